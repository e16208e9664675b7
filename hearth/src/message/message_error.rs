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

use thiserror::Error;

/// Errors raised while decoding an inbound envelope from the wire.
///
/// These are structural rejections: the offending message is logged and
/// discarded at the boundary, never propagated into module code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The topic has fewer segments than the protocol requires.
    #[error("missing required information in topic: expected at least {expected} segments, found {found}")]
    TooFewSegments {
        /// Minimum number of segments.
        expected: usize,
        /// Number of segments actually present.
        found: usize,
    },

    /// The protocol tag or API version does not match this SDK.
    #[error("invalid api call: unsupported protocol {tag}/{version}")]
    ProtocolMismatch {
        /// Tag found on the wire.
        tag: String,
        /// Version found on the wire.
        version: String,
    },

    /// The payload is not a valid structured document.
    #[error("payload in an invalid JSON format: {0}")]
    InvalidPayload(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}
