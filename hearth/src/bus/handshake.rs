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

use std::collections::VecDeque;

use tracing::warn;

use crate::message::{topic, Message};

/// What happened to an accepted configuration envelope.
#[derive(Debug, Default)]
pub struct Resolution {
    /// The envelope satisfied at least one outstanding mandatory pattern.
    pub consumed: bool,
    /// The envelope satisfied the last outstanding pattern.
    pub completed: bool,
    /// Configuration envelopes buffered before completion, oldest first.
    pub drained: Vec<Message>,
    /// The envelope was buffered for later delivery.
    pub queued: bool,
}

/// Tracks mandatory configuration dependencies of one module.
///
/// A module is configured once every pattern registered with
/// [`wait_for`](Self::wait_for) has been matched by an accepted
/// configuration envelope. Envelopes accepted while unconfigured that do not
/// resolve a pattern are buffered and handed back, in arrival order, when the
/// last pattern resolves.
#[derive(Debug)]
pub struct Handshake {
    pending: Vec<String>,
    configured: bool,
    queue: VecDeque<Message>,
    capacity: usize,
}

impl Handshake {
    /// Creates a configured handshake with a buffer of `capacity` envelopes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Vec::new(),
            configured: true,
            queue: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Adds a mandatory pattern; the module becomes unconfigured.
    pub fn wait_for(&mut self, pattern: &str) {
        if !self.pending.iter().any(|p| p == pattern) {
            self.pending.push(pattern.to_string());
        }
        self.configured = false;
    }

    /// Returns `true` once every mandatory pattern has been satisfied.
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.configured
    }

    /// Patterns still waiting for a configuration envelope.
    #[must_use]
    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    /// Number of buffered configuration envelopes.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Records an accepted configuration envelope.
    pub fn accept(&mut self, message: &Message) -> Resolution {
        let mut resolution = Resolution::default();
        if !self.pending.is_empty() {
            let before = self.pending.len();
            self.pending
                .retain(|pattern| !topic::matches(pattern, &message.topic));
            resolution.consumed = self.pending.len() < before;
            if resolution.consumed && self.pending.is_empty() && !self.configured {
                self.configured = true;
                resolution.completed = true;
                resolution.drained = self.queue.drain(..).collect();
            }
        }
        if !resolution.consumed && !self.configured {
            if self.queue.len() >= self.capacity {
                if let Some(dropped) = self.queue.pop_front() {
                    warn!(topic = %dropped.topic, "Configuration queue full, dropping oldest entry");
                }
            }
            self.queue.push_back(message.clone());
            resolution.queued = true;
        }
        resolution
    }
}
