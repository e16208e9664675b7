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

use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::message::Message;

/// Why a restart was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// A `RESTART` command on the bus.
    Requested,
    /// The module's consumer queue overflowed.
    Overload,
}

/// Work for the supervisor's control loop.
///
/// Everything that touches the fleet goes through this channel so the
/// registry has a single writer.
#[derive(Debug, Clone)]
pub enum ControlRequest {
    /// Start the named module.
    Start(String),
    /// Stop the named module.
    Stop(String),
    /// Stop then start the named module.
    Restart {
        /// Target fullname.
        fullname: String,
        /// Origin of the request.
        reason: RestartReason,
    },
    /// Set the named module's debug flag.
    Debug {
        /// Target fullname.
        fullname: String,
        /// New value.
        enabled: bool,
    },
    /// Answer a `DISCOVER` request.
    Discover(Message),
    /// A `PONG` came back from `fullname`.
    Pong {
        /// Module that answered.
        fullname: String,
        /// When the answer was received.
        received_at: Instant,
    },
}

/// A module's line to the supervisor that launched it.
#[derive(Debug, Clone)]
pub struct SupervisorLink {
    sender: UnboundedSender<ControlRequest>,
}

impl SupervisorLink {
    /// Wraps the sending side of a control channel.
    #[must_use]
    pub const fn new(sender: UnboundedSender<ControlRequest>) -> Self {
        Self { sender }
    }

    /// Queues a request. Returns `false` if the supervisor is gone.
    pub fn request(&self, request: ControlRequest) -> bool {
        match self.sender.send(request) {
            Ok(()) => true,
            Err(e) => {
                warn!("Supervisor unavailable, dropping {:?}", e.0);
                false
            }
        }
    }

    /// Asks for `fullname` to be restarted after a consumer overload.
    pub fn request_overload_restart(&self, fullname: &str) -> bool {
        self.request(ControlRequest::Restart {
            fullname: fullname.to_string(),
            reason: RestartReason::Overload,
        })
    }
}
