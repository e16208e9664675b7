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

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::message::ProtocolError;

/// Errors raised by the bus and its transports.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker could not be reached or refused the connection.
    #[error("unable to connect to {endpoint}: {reason}")]
    Connect {
        /// Where the connection was attempted.
        endpoint: String,
        /// Why it failed.
        reason: String,
    },
    /// The transport is not connected.
    #[error("not connected")]
    NotConnected,
    /// The transport accepted the request but failed to carry it out.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The bus was shut down while the operation was pending.
    #[error("bus is shutting down")]
    Shutdown,
    /// The envelope could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Transport security material could not be loaded.
    #[error("invalid TLS material {path}: {source}")]
    Tls {
        /// File that failed to load.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// What a transport reports back to its bus client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The broker acknowledged the connection.
    Connected,
    /// The connection is gone; `unexpected` is false for a requested disconnect.
    Disconnected {
        /// Set when the drop was not requested by the client.
        unexpected: bool,
    },
    /// An inbound publish.
    Message {
        /// Literal topic.
        topic: String,
        /// Raw payload, empty for a null envelope.
        payload: Vec<u8>,
        /// Whether the broker delivered it from its retained store.
        retain: bool,
    },
}

/// Identity and credentials a module presents to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Unique client id on the broker.
    pub client_id: String,
    /// Broker user name (the house id).
    pub username: String,
    /// Broker password (the house passcode).
    pub password: String,
    /// Keep the session on the broker across reconnects.
    pub persistent: bool,
}

/// A single publish/subscribe connection.
///
/// Implementations push inbound traffic and connectivity changes to the
/// channel handed to [`connect`](Self::connect) and must never call back into
/// module code themselves.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Connects to the broker. Returns once the broker acknowledged the
    /// connection, or with an error if it could not be established.
    async fn connect(&self, events: UnboundedSender<TransportEvent>) -> Result<(), BusError>;

    /// Subscribes to a topic pattern.
    async fn subscribe(&self, pattern: &str) -> Result<(), BusError>;

    /// Drops a subscription.
    async fn unsubscribe(&self, pattern: &str) -> Result<(), BusError>;

    /// Publishes a payload; `None` publishes an empty (null) payload.
    async fn publish(
        &self,
        topic: &str,
        payload: Option<Vec<u8>>,
        retain: bool,
    ) -> Result<(), BusError>;

    /// Closes the connection. Idempotent.
    async fn disconnect(&self) -> Result<(), BusError>;
}

/// Produces one [`Transport`] per module.
pub trait Connector: Send + Sync + Debug {
    /// Creates a transport for a client with the given options.
    fn transport(&self, options: ClientOptions) -> Arc<dyn Transport>;

    /// Human readable endpoint, used in log lines.
    fn endpoint(&self) -> String;
}
