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

//! The message envelope and the topic protocol it travels on.
//!
//! * [`Message`]: the envelope exchanged between modules, with reply/forward
//!   semantics and copy-out payload accessors.
//! * [`topic`]: building, parsing and wildcard matching of wire topics.
//! * [`ProtocolError`]: structural errors raised while decoding.

pub use envelope::*;
pub use message_error::ProtocolError;

/// Defines the [`Message`] envelope and the well-known commands.
mod envelope;
/// Defines [`ProtocolError`].
mod message_error;
/// Topic protocol helpers.
pub mod topic;
