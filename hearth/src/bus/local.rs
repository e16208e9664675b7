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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use super::{BusError, ClientOptions, Connector, Transport, TransportEvent};
use crate::message::topic;

/// A publish observed by the [`LocalBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    /// Client that published.
    pub client_id: String,
    /// Literal topic.
    pub topic: String,
    /// Raw payload, empty for null.
    pub payload: Vec<u8>,
    /// Retain flag.
    pub retain: bool,
}

#[derive(Debug)]
struct Session {
    events: UnboundedSender<TransportEvent>,
    patterns: Vec<String>,
    connected: bool,
}

#[derive(Debug, Default)]
struct BrokerInner {
    sessions: DashMap<String, Session>,
    retained: DashMap<String, Vec<u8>>,
    offline: AtomicBool,
    history: Mutex<Vec<PublishRecord>>,
}

/// An in-process publish/subscribe broker with MQTT wildcard semantics and
/// retained messages.
///
/// Cloning is cheap; every clone refers to the same broker. A whole fleet of
/// modules can share one `LocalBroker` through [`LocalBroker::connector`].
///
/// [`sever`](Self::sever) drops every connection and refuses new ones until
/// [`restore`](Self::restore) is called, at which point severed sessions
/// reconnect on their own (with a clean subscription set), the way a network
/// client with automatic reconnect would.
#[derive(Debug, Clone, Default)]
pub struct LocalBroker {
    inner: Arc<BrokerInner>,
}

impl LocalBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector handing out transports attached to this broker.
    #[must_use]
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(LocalConnector {
            broker: self.clone(),
        })
    }

    /// A raw transport for an arbitrary client id.
    #[must_use]
    pub fn transport(&self, client_id: impl Into<String>) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            broker: self.clone(),
            client_id: client_id.into(),
        })
    }

    /// Drops every connection and refuses new ones.
    pub fn sever(&self) {
        self.inner.offline.store(true, Ordering::SeqCst);
        for mut session in self.inner.sessions.iter_mut() {
            if session.connected {
                session.connected = false;
                session.patterns.clear();
                let _ = session
                    .events
                    .send(TransportEvent::Disconnected { unexpected: true });
            }
        }
        trace!("Local broker severed");
    }

    /// Accepts connections again and reconnects severed sessions.
    pub fn restore(&self) {
        self.inner.offline.store(false, Ordering::SeqCst);
        for mut session in self.inner.sessions.iter_mut() {
            if !session.connected && !session.events.is_closed() {
                session.connected = true;
                let _ = session.events.send(TransportEvent::Connected);
            }
        }
        trace!("Local broker restored");
    }

    /// Returns `true` while connections are refused.
    #[must_use]
    pub fn is_severed(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    /// Every publish accepted so far, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<PublishRecord> {
        self.inner.history.lock().clone()
    }

    /// The retained payload stored for `topic`.
    #[must_use]
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.inner.retained.get(topic).map(|entry| entry.value().clone())
    }

    /// Returns `true` if `client_id` is currently connected.
    #[must_use]
    pub fn is_connected(&self, client_id: &str) -> bool {
        self.inner
            .sessions
            .get(client_id)
            .is_some_and(|session| session.connected)
    }

    /// Patterns `client_id` is subscribed to on the broker side.
    #[must_use]
    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        self.inner
            .sessions
            .get(client_id)
            .map(|session| session.patterns.clone())
            .unwrap_or_default()
    }

    fn connect(
        &self,
        client_id: &str,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<(), BusError> {
        if self.is_severed() {
            return Err(BusError::Connect {
                endpoint: "local".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        self.inner.sessions.insert(
            client_id.to_string(),
            Session {
                events: events.clone(),
                patterns: Vec::new(),
                connected: true,
            },
        );
        let _ = events.send(TransportEvent::Connected);
        trace!(client = client_id, "Local client connected");
        Ok(())
    }

    fn subscribe(&self, client_id: &str, pattern: &str) -> Result<(), BusError> {
        let mut session = self
            .inner
            .sessions
            .get_mut(client_id)
            .filter(|session| session.connected)
            .ok_or(BusError::NotConnected)?;
        if !session.patterns.iter().any(|p| p == pattern) {
            session.patterns.push(pattern.to_string());
        }
        for retained in self.inner.retained.iter() {
            if topic::matches(pattern, retained.key()) {
                let _ = session.events.send(TransportEvent::Message {
                    topic: retained.key().clone(),
                    payload: retained.value().clone(),
                    retain: true,
                });
            }
        }
        Ok(())
    }

    fn unsubscribe(&self, client_id: &str, pattern: &str) -> Result<(), BusError> {
        let mut session = self
            .inner
            .sessions
            .get_mut(client_id)
            .filter(|session| session.connected)
            .ok_or(BusError::NotConnected)?;
        session.patterns.retain(|p| p != pattern);
        Ok(())
    }

    fn publish(
        &self,
        client_id: &str,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), BusError> {
        if !self.is_connected(client_id) {
            return Err(BusError::NotConnected);
        }
        if retain {
            if payload.is_empty() {
                self.inner.retained.remove(topic);
            } else {
                self.inner.retained.insert(topic.to_string(), payload.clone());
            }
        }
        self.inner.history.lock().push(PublishRecord {
            client_id: client_id.to_string(),
            topic: topic.to_string(),
            payload: payload.clone(),
            retain,
        });
        for session in self.inner.sessions.iter() {
            if session.connected && session.patterns.iter().any(|p| topic::matches(p, topic)) {
                let _ = session.events.send(TransportEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    retain: false,
                });
            }
        }
        Ok(())
    }

    fn disconnect(&self, client_id: &str) {
        if let Some((_, session)) = self.inner.sessions.remove(client_id) {
            let _ = session
                .events
                .send(TransportEvent::Disconnected { unexpected: false });
        }
    }
}

#[derive(Debug)]
struct LocalConnector {
    broker: LocalBroker,
}

impl Connector for LocalConnector {
    fn transport(&self, options: ClientOptions) -> Arc<dyn Transport> {
        self.broker.transport(options.client_id)
    }

    fn endpoint(&self) -> String {
        "local".to_string()
    }
}

#[derive(Debug)]
struct LocalTransport {
    broker: LocalBroker,
    client_id: String,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, events: UnboundedSender<TransportEvent>) -> Result<(), BusError> {
        self.broker.connect(&self.client_id, events)
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), BusError> {
        self.broker.subscribe(&self.client_id, pattern)
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), BusError> {
        self.broker.unsubscribe(&self.client_id, pattern)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Option<Vec<u8>>,
        retain: bool,
    ) -> Result<(), BusError> {
        self.broker
            .publish(&self.client_id, topic, payload.unwrap_or_default(), retain)
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.broker.disconnect(&self.client_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn message_topic(event: TransportEvent) -> Option<(String, bool)> {
        match event {
            TransportEvent::Message { topic, retain, .. } => Some((topic, retain)),
            _ => None,
        }
    }

    #[tokio::test]
    async fn retained_messages_replay_on_subscribe() {
        let broker = LocalBroker::new();
        let publisher = broker.transport("publisher");
        let (tx, _rx) = mpsc::unbounded_channel();
        publisher.connect(tx).await.unwrap();
        publisher
            .publish("hearth/v1/h/a/b/c/d/CONF/x", Some(b"{}".to_vec()), true)
            .await
            .unwrap();

        let subscriber = broker.transport("subscriber");
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber.connect(tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));
        subscriber.subscribe("hearth/v1/h/+/+/+/+/CONF/#").await.unwrap();
        let replayed = rx.recv().await.and_then(message_topic);
        assert_eq!(replayed, Some(("hearth/v1/h/a/b/c/d/CONF/x".to_string(), true)));
    }

    #[tokio::test]
    async fn null_retained_publish_clears_the_topic() {
        let broker = LocalBroker::new();
        let client = broker.transport("client");
        let (tx, _rx) = mpsc::unbounded_channel();
        client.connect(tx).await.unwrap();
        client.publish("t/a", Some(b"1".to_vec()), true).await.unwrap();
        assert_eq!(broker.retained("t/a"), Some(b"1".to_vec()));
        client.publish("t/a", None, true).await.unwrap();
        assert_eq!(broker.retained("t/a"), None);
    }

    #[tokio::test]
    async fn overlapping_patterns_deliver_once() {
        let broker = LocalBroker::new();
        let client = broker.transport("client");
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.connect(tx).await.unwrap();
        client.subscribe("t/#").await.unwrap();
        client.subscribe("t/+").await.unwrap();
        client.publish("t/a", Some(b"1".to_vec()), false).await.unwrap();
        client.disconnect().await.unwrap();

        let mut delivered = 0;
        while let Some(event) = rx.recv().await {
            if matches!(event, TransportEvent::Message { .. }) {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn severed_broker_refuses_and_then_reconnects() {
        let broker = LocalBroker::new();
        let client = broker.transport("client");
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.connect(tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));

        broker.sever();
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Disconnected { unexpected: true })
        );
        assert!(client.publish("t/a", None, false).await.is_err());
        let (other_tx, _other_rx) = mpsc::unbounded_channel();
        assert!(broker.transport("other").connect(other_tx).await.is_err());

        broker.restore();
        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));
        assert!(broker.is_connected("client"));
    }
}
