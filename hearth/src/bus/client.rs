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

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::consumer::{ConsumerPool, Delivery};
use super::handshake::{Handshake, Resolution};
use super::offline_queue::{OfflineQueue, PendingPublish};
use super::{BusError, Transport, TransportEvent};
use crate::common::HearthConfig;
use crate::message::{topic, Message, ANY_HOUSE};

/// Connectivity of a [`BusClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to.
    Disconnected,
    /// Connecting or waiting to reconnect.
    Connecting,
    /// The broker acknowledged the connection.
    Connected,
}

/// Static parameters of a bus client.
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Fullname written as sender on every outgoing topic.
    pub fullname: String,
    /// Installation this client belongs to.
    pub house_id: String,
    /// Human readable broker endpoint for log lines.
    pub endpoint: String,
    /// Log every envelope in and out.
    pub verbose: bool,
    /// Pause between two connection attempts.
    pub connect_backoff: Duration,
    /// Offline queue capacity.
    pub offline_capacity: usize,
    /// Configuration queue capacity.
    pub config_capacity: usize,
}

impl BusOptions {
    /// Options for `fullname` in `house_id`, with limits taken from `config`.
    #[must_use]
    pub fn new(
        fullname: impl Into<String>,
        house_id: impl Into<String>,
        endpoint: impl Into<String>,
        config: &HearthConfig,
    ) -> Self {
        Self {
            fullname: fullname.into(),
            house_id: house_id.into(),
            endpoint: endpoint.into(),
            verbose: false,
            connect_backoff: config.timeouts.connect_backoff(),
            offline_capacity: config.limits.offline_queue_capacity,
            config_capacity: config.limits.config_queue_capacity,
        }
    }
}

struct BusInner {
    options: BusOptions,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    subscriptions: RwLock<Vec<String>>,
    handshake: Mutex<Handshake>,
    configured: watch::Sender<bool>,
    // held across publishes so live traffic never overtakes queued traffic
    offline: tokio::sync::Mutex<OfflineQueue>,
    pool: Mutex<Option<ConsumerPool>>,
    shutdown: CancellationToken,
    ingress: Mutex<Option<JoinHandle<()>>>,
}

/// A module's connection to the bus.
///
/// Owns connectivity, the subscription set, the offline publish queue and the
/// configuration handshake. Inbound envelopes are parsed and filtered on an
/// ingress task and handed to a [`ConsumerPool`]; no module code ever runs on
/// the transport's side of the channel.
///
/// Cloning is cheap and every clone refers to the same connection.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<BusInner>,
}

impl fmt::Debug for BusClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusClient")
            .field("fullname", &self.inner.options.fullname)
            .field("state", &self.state())
            .field("configured", &self.is_configured())
            .finish_non_exhaustive()
    }
}

impl BusClient {
    /// Creates a disconnected client on top of `transport`.
    #[must_use]
    pub fn new(options: BusOptions, transport: Arc<dyn Transport>) -> Self {
        let handshake = Handshake::new(options.config_capacity);
        let offline = OfflineQueue::new(options.offline_capacity);
        Self {
            inner: Arc::new(BusInner {
                options,
                transport,
                state: watch::Sender::new(ConnectionState::Disconnected),
                subscriptions: RwLock::new(Vec::new()),
                handshake: Mutex::new(handshake),
                configured: watch::Sender::new(true),
                offline: tokio::sync::Mutex::new(offline),
                pool: Mutex::new(None),
                shutdown: CancellationToken::new(),
                ingress: Mutex::new(None),
            }),
        }
    }

    /// Fullname used as sender.
    #[must_use]
    pub fn fullname(&self) -> &str {
        &self.inner.options.fullname
    }

    /// Installation id.
    #[must_use]
    pub fn house_id(&self) -> &str {
        &self.inner.options.house_id
    }

    /// Current connectivity.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Returns `true` while the broker connection is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Returns `true` once every mandatory configuration pattern has been satisfied.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        *self.inner.configured.borrow()
    }

    /// Resolves once the module is configured.
    pub async fn wait_configured(&self) {
        let mut configured = self.inner.configured.subscribe();
        let _ = configured.wait_for(|configured| *configured).await;
    }

    /// Snapshot of the active subscription patterns, in registration order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.read().clone()
    }

    /// Returns `true` if any active subscription matches `topic`.
    #[must_use]
    pub fn is_subscribed(&self, wire_topic: &str) -> bool {
        self.inner
            .subscriptions
            .read()
            .iter()
            .any(|pattern| topic::matches(pattern, wire_topic))
    }

    /// Mandatory patterns still waiting for configuration.
    #[must_use]
    pub fn pending_configuration(&self) -> Vec<String> {
        self.inner.handshake.lock().pending().to_vec()
    }

    /// Number of publishes waiting for the connection.
    pub async fn offline_len(&self) -> usize {
        self.inner.offline.lock().await.len()
    }

    /// Connects to the broker, retrying with a fixed backoff until it succeeds
    /// or the client is shut down. Inbound traffic is handed to `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Shutdown`] if [`disconnect`](Self::disconnect) was
    /// called before a connection could be established.
    #[instrument(skip(self, pool), fields(module = %self.fullname()))]
    pub async fn connect(&self, pool: ConsumerPool) -> Result<(), BusError> {
        *self.inner.pool.lock() = Some(pool);
        let (events, receiver) = mpsc::unbounded_channel();
        let ingress = tokio::spawn(self.clone().ingress(receiver));
        if let Some(previous) = self.inner.ingress.lock().replace(ingress) {
            previous.abort();
        }

        self.inner.state.send_replace(ConnectionState::Connecting);
        loop {
            if self.inner.shutdown.is_cancelled() {
                return Err(BusError::Shutdown);
            }
            debug!("Connecting to {}", self.inner.options.endpoint);
            match self.inner.transport.connect(events.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Unable to connect to {}: {e}", self.inner.options.endpoint);
                    tokio::select! {
                        () = self.inner.shutdown.cancelled() => return Err(BusError::Shutdown),
                        () = tokio::time::sleep(self.inner.options.connect_backoff) => {}
                    }
                }
            }
        }
    }

    /// Subscribes to envelopes matching the given addressing fields, from any house.
    ///
    /// With `wait_for_it` the pattern becomes a mandatory configuration
    /// dependency and the module is unconfigured until a configuration
    /// envelope matching it has been accepted. Returns the pattern, which can
    /// be passed to [`remove_listener`](Self::remove_listener).
    pub async fn add_listener(
        &self,
        from: &str,
        to: &str,
        command: &str,
        args: &str,
        wait_for_it: bool,
    ) -> String {
        let pattern = topic::build(topic::SINGLE_LEVEL, from, to, command, args);
        if wait_for_it {
            self.inner.handshake.lock().wait_for(&pattern);
            self.inner.configured.send_replace(false);
            debug!(module = %self.fullname(), "Will wait for configuration on {pattern}");
        }
        {
            let mut subscriptions = self.inner.subscriptions.write();
            if subscriptions.contains(&pattern) {
                return pattern;
            }
            subscriptions.push(pattern.clone());
        }
        if self.is_connected() {
            self.subscribe_transport(&pattern).await;
        }
        pattern
    }

    /// Drops a subscription. Unknown patterns are ignored.
    pub async fn remove_listener(&self, pattern: &str) {
        let removed = {
            let mut subscriptions = self.inner.subscriptions.write();
            let before = subscriptions.len();
            subscriptions.retain(|p| p != pattern);
            subscriptions.len() < before
        };
        if removed && self.is_connected() {
            debug!(module = %self.fullname(), "Unsubscribing from {pattern}");
            if let Err(e) = self.inner.transport.unsubscribe(pattern).await {
                warn!(module = %self.fullname(), "Unable to unsubscribe from {pattern}: {e}");
            }
        }
    }

    /// Publishes an envelope, or queues it while the connection is down.
    ///
    /// The sender segment of the topic is always this client's fullname.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Protocol`] if the payload cannot be encoded. Transport
    /// failures are not errors: the publish is queued and retried on reconnect.
    pub async fn publish(&self, message: &Message) -> Result<(), BusError> {
        let wire_topic = topic::build(
            &message.house_id,
            self.fullname(),
            &message.recipient,
            &message.command,
            &message.wire_args(),
        );
        let payload = message.encode_payload()?;
        if self.inner.options.verbose {
            debug!(module = %self.fullname(), "Publishing {message}");
        }

        let mut offline = self.inner.offline.lock().await;
        if self.is_connected() && offline.is_empty() {
            match self
                .inner
                .transport
                .publish(&wire_topic, payload.clone(), message.retain)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => warn!(module = %self.fullname(), "Publish to {wire_topic} failed, queueing: {e}"),
            }
        }
        let pending = PendingPublish {
            topic: wire_topic,
            payload,
            retain: message.retain,
        };
        if let Some(evicted) = offline.push(pending) {
            warn!(module = %self.fullname(), "Offline queue full, dropping {}", evicted.topic);
        }
        Ok(())
    }

    /// Records an accepted configuration envelope in the handshake.
    pub(crate) fn accept_configuration(&self, message: &Message) -> Resolution {
        let resolution = self.inner.handshake.lock().accept(message);
        if resolution.consumed {
            debug!(module = %self.fullname(), "Received configuration {}", message.topic);
        }
        if resolution.completed {
            info!(module = %self.fullname(), "Configuration completed");
            self.inner.configured.send_replace(true);
        } else if resolution.consumed {
            debug!(
                module = %self.fullname(),
                "Still waiting for configuration on {:?}",
                self.pending_configuration()
            );
        }
        resolution
    }

    /// Stops the consumer pool, then closes the connection.
    ///
    /// No handler runs once this returns.
    pub async fn disconnect(&self) {
        self.inner.shutdown.cancel();
        let pool = self.inner.pool.lock().take();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }
        if let Err(e) = self.inner.transport.disconnect().await {
            warn!(module = %self.fullname(), "Error while disconnecting: {e}");
        }
        self.inner.state.send_replace(ConnectionState::Disconnected);
        let ingress = self.inner.ingress.lock().take();
        if let Some(ingress) = ingress {
            ingress.abort();
        }
        debug!(module = %self.fullname(), "Disconnected from {}", self.inner.options.endpoint);
    }

    async fn subscribe_transport(&self, pattern: &str) {
        debug!(module = %self.fullname(), "Subscribing topic {pattern}");
        if let Err(e) = self.inner.transport.subscribe(pattern).await {
            warn!(module = %self.fullname(), "Unable to subscribe to {pattern}: {e}");
        }
    }

    fn submit(&self, delivery: Delivery) {
        if let Some(pool) = self.inner.pool.lock().as_ref() {
            pool.submit(delivery);
        }
    }

    async fn ingress(self, mut events: UnboundedReceiver<TransportEvent>) {
        loop {
            let event = tokio::select! {
                () = self.inner.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                TransportEvent::Connected => self.on_connected().await,
                TransportEvent::Disconnected { unexpected } => self.on_disconnected(unexpected),
                TransportEvent::Message {
                    topic,
                    payload,
                    retain,
                } => self.on_inbound(&topic, &payload, retain),
            }
        }
        trace!(module = %self.fullname(), "Ingress stopped");
    }

    async fn on_connected(&self) {
        debug!(module = %self.fullname(), "Connected to {}", self.inner.options.endpoint);
        self.inner.state.send_replace(ConnectionState::Connected);
        self.submit(Delivery::Connected);
        for pattern in self.subscriptions() {
            self.subscribe_transport(&pattern).await;
        }
        self.flush_offline().await;
    }

    fn on_disconnected(&self, unexpected: bool) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        if unexpected {
            warn!(module = %self.fullname(), "Unexpected disconnection, reconnecting...");
            self.inner.state.send_replace(ConnectionState::Connecting);
        } else {
            debug!(module = %self.fullname(), "Disconnected from {}", self.inner.options.endpoint);
            self.inner.state.send_replace(ConnectionState::Disconnected);
        }
        self.submit(Delivery::Disconnected);
    }

    fn on_inbound(&self, wire_topic: &str, payload: &[u8], retain: bool) {
        let message = match Message::parse(wire_topic, payload, retain) {
            Ok(message) => message,
            Err(e) => {
                error!(module = %self.fullname(), "Invalid message received on {wire_topic}: {e}");
                return;
            }
        };
        if message.house_id != ANY_HOUSE && message.house_id != self.house_id() {
            warn!(
                module = %self.fullname(),
                "Received message for the wrong house {}: {message}",
                message.house_id
            );
            return;
        }
        if self.inner.options.verbose {
            debug!(module = %self.fullname(), "Received message {message}");
        }
        self.submit(Delivery::Message(message));
    }

    async fn flush_offline(&self) {
        let mut offline = self.inner.offline.lock().await;
        if !offline.is_empty() {
            debug!(module = %self.fullname(), queued = offline.len(), "Flushing offline queue");
        }
        while self.is_connected() {
            let Some(pending) = offline.pop() else {
                break;
            };
            if let Err(e) = self
                .inner
                .transport
                .publish(&pending.topic, pending.payload.clone(), pending.retain)
                .await
            {
                warn!(module = %self.fullname(), "Flush interrupted: {e}");
                offline.push_front(pending);
                break;
            }
        }
    }
}
