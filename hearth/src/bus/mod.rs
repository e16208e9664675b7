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

//! Connectivity, subscriptions and inbound dispatch.

pub use client::{BusClient, BusOptions, ConnectionState};
pub use consumer::{ConfigurationVerdict, ConsumerPool, Delivery, Hooks, OverloadHandler, PoolLimits};
pub use handshake::{Handshake, Resolution};
pub use local::{LocalBroker, PublishRecord};
pub use mqtt::{MqttConnector, MqttTransport};
pub use offline_queue::{OfflineQueue, PendingPublish};
pub use transport::{BusError, ClientOptions, Connector, Transport, TransportEvent};

mod client;
mod consumer;
mod handshake;
mod local;
mod mqtt;
mod offline_queue;
mod transport;
