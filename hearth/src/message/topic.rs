/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Topic construction, parsing and wildcard matching.
//!
//! Every envelope travels on a topic of the form
//! `<tag>/<version>/<house_id>/<sender-scope>/<sender-name>/<recipient-scope>/<recipient-name>/<command>/<args…>`.
//! Subscription patterns use the same layout with `+` (one level) and `#`
//! (all remaining levels) wildcards.

use super::ProtocolError;

/// Protocol tag found in the first segment of every topic.
pub const PROTOCOL_TAG: &str = "hearth";

/// API version found in the second segment of every topic.
pub const API_VERSION: &str = "v1";

/// Placeholder written in place of empty arguments, since an empty trailing
/// segment cannot be told apart from a missing one on the wire.
pub const NULL_ARGS: &str = "null";

/// Minimum number of `/`-separated segments in a valid topic.
pub const MIN_SEGMENTS: usize = 8;

/// Single-level wildcard.
pub const SINGLE_LEVEL: &str = "+";

/// Multi-level wildcard.
pub const MULTI_LEVEL: &str = "#";

/// The typed fields carried by a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicParts {
    /// Installation the message belongs to (`*` for every house).
    pub house_id: String,
    /// Sender fullname (`scope/name`).
    pub sender: String,
    /// Recipient fullname (`scope/name`).
    pub recipient: String,
    /// Command verb.
    pub command: String,
    /// Free-form arguments, possibly spanning several segments.
    pub args: String,
}

/// Builds the wire topic for the given addressing fields.
///
/// Empty `args` are encoded as [`NULL_ARGS`].
#[must_use]
pub fn build(house_id: &str, sender: &str, recipient: &str, command: &str, args: &str) -> String {
    let args = if args.is_empty() { NULL_ARGS } else { args };
    [PROTOCOL_TAG, API_VERSION, house_id, sender, recipient, command, args].join("/")
}

/// Splits a wire topic into its typed fields.
///
/// # Errors
///
/// Returns [`ProtocolError::TooFewSegments`] if the topic is shorter than
/// [`MIN_SEGMENTS`], or [`ProtocolError::ProtocolMismatch`] if the tag or the
/// version do not belong to this protocol.
pub fn parse(topic: &str) -> Result<TopicParts, ProtocolError> {
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() < MIN_SEGMENTS {
        return Err(ProtocolError::TooFewSegments {
            expected: MIN_SEGMENTS,
            found: segments.len(),
        });
    }
    if segments[0] != PROTOCOL_TAG || segments[1] != API_VERSION {
        return Err(ProtocolError::ProtocolMismatch {
            tag: segments[0].to_string(),
            version: segments[1].to_string(),
        });
    }
    Ok(TopicParts {
        house_id: segments[2].to_string(),
        sender: format!("{}/{}", segments[3], segments[4]),
        recipient: format!("{}/{}", segments[5], segments[6]),
        command: segments[7].to_string(),
        args: segments[8..].join("/"),
    })
}

/// Returns `true` if `topic` is matched by the subscription `pattern`.
///
/// `+` matches exactly one level, `#` matches every remaining level
/// (including none, so `a/#` matches `a`).
#[must_use]
pub fn matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL), _) => return true,
            (Some(SINGLE_LEVEL), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
