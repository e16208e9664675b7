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

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

use crate::message::Message;

/// Correlates asynchronous replies with the request that caused them.
///
/// A module registers a continuation value under the `request_id` of an
/// outgoing envelope; when the reply comes back with the same id the value is
/// restored and removed.
///
/// ```rust,ignore
/// let request = ctx.message();
/// ctx.sessions().register(&request, json!({"sensor": "livingroom"}));
/// // ... later, in on_message
/// if let Some(context) = ctx.sessions().restore(&reply) { /* ... */ }
/// ```
pub struct SessionRegistry<T = serde_json::Value> {
    sessions: Mutex<HashMap<u64, T>>,
}

impl<T> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> fmt::Debug for SessionRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("outstanding", &self.len())
            .finish()
    }
}

impl<T> SessionRegistry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `context` under the envelope's request id, replacing any previous value.
    pub fn register(&self, message: &Message, context: T) {
        self.sessions.lock().insert(message.request_id(), context);
    }

    /// Takes back the context registered for the envelope's request id.
    pub fn restore(&self, message: &Message) -> Option<T> {
        self.sessions.lock().remove(&message.request_id())
    }

    /// Returns `true` if a context is waiting for this envelope's request id.
    #[must_use]
    pub fn is_registered(&self, message: &Message) -> bool {
        self.sessions.lock().contains_key(&message.request_id())
    }

    /// Number of outstanding sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Returns `true` if nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
