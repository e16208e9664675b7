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

/// A publish waiting for the connection to come back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPublish {
    /// Wire topic.
    pub topic: String,
    /// Encoded payload, `None` for a null envelope.
    pub payload: Option<Vec<u8>>,
    /// Retain flag.
    pub retain: bool,
}

/// Bounded FIFO of publishes issued while disconnected.
///
/// Pushing never blocks: when the queue is full the oldest entry is evicted
/// and handed back to the caller.
#[derive(Debug)]
pub struct OfflineQueue {
    entries: VecDeque<PendingPublish>,
    capacity: usize,
}

impl OfflineQueue {
    /// Creates a queue holding at most `capacity` publishes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Appends a publish, returning the entry evicted to make room, if any.
    pub fn push(&mut self, publish: PendingPublish) -> Option<PendingPublish> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(publish);
        evicted
    }

    /// Puts a publish back at the head of the queue after a failed flush.
    pub fn push_front(&mut self, publish: PendingPublish) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front(publish);
    }

    /// Removes the oldest publish.
    pub fn pop(&mut self) -> Option<PendingPublish> {
        self.entries.pop_front()
    }

    /// Number of queued publishes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
