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

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration,
    Transport as MqttTransportKind,
};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{BusError, ClientOptions, Connector, Transport, TransportEvent};
use crate::common::{GatewayTransport, Settings, CONFIG};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 64;

/// Connects modules to an MQTT broker.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    settings: Settings,
    reconnect_backoff: Duration,
}

impl MqttConnector {
    /// Creates a connector for the gateway described by `settings`.
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            reconnect_backoff: CONFIG.timeouts.connect_backoff(),
        }
    }

    /// Overrides the pause between two reconnect attempts.
    #[must_use]
    pub const fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }
}

impl Connector for MqttConnector {
    fn transport(&self, options: ClientOptions) -> Arc<dyn Transport> {
        Arc::new(MqttTransport {
            settings: self.settings.clone(),
            options,
            reconnect_backoff: self.reconnect_backoff,
            client: Mutex::new(None),
            poller: Mutex::new(None),
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}:{} ({}, ssl={})",
            self.settings.gateway_hostname,
            self.settings.gateway_port,
            self.settings.gateway_transport,
            self.settings.gateway_ssl
        )
    }
}

/// One MQTT connection, driven by a background polling task.
#[derive(Debug)]
pub struct MqttTransport {
    settings: Settings,
    options: ClientOptions,
    reconnect_backoff: Duration,
    client: Mutex<Option<AsyncClient>>,
    poller: Mutex<Option<CancellationToken>>,
}

impl MqttTransport {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.settings.gateway_hostname, self.settings.gateway_port)
    }

    async fn mqtt_options(&self) -> Result<MqttOptions, BusError> {
        let host = match self.settings.gateway_transport {
            GatewayTransport::Tcp => self.settings.gateway_hostname.clone(),
            GatewayTransport::Websockets => {
                let scheme = if self.settings.gateway_ssl { "wss" } else { "ws" };
                format!(
                    "{scheme}://{}:{}/mqtt",
                    self.settings.gateway_hostname, self.settings.gateway_port
                )
            }
        };
        let mut options =
            MqttOptions::new(&self.options.client_id, host, self.settings.gateway_port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_credentials(&self.options.username, &self.options.password);
        options.set_clean_session(!self.options.persistent);
        options.set_transport(self.transport_kind().await?);
        Ok(options)
    }

    async fn transport_kind(&self) -> Result<MqttTransportKind, BusError> {
        let settings = &self.settings;
        Ok(match (settings.gateway_transport, settings.gateway_ssl) {
            (GatewayTransport::Tcp, false) => MqttTransportKind::Tcp,
            (GatewayTransport::Websockets, false) => MqttTransportKind::Ws,
            (GatewayTransport::Tcp, true) => match &settings.gateway_ca_cert {
                Some(ca_path) => {
                    let ca = read_material(ca_path).await?;
                    let client_auth = match (&settings.gateway_certfile, &settings.gateway_keyfile)
                    {
                        (Some(cert), Some(key)) => {
                            Some((read_material(cert).await?, read_material(key).await?))
                        }
                        _ => None,
                    };
                    MqttTransportKind::tls_with_config(TlsConfiguration::Simple {
                        ca,
                        alpn: None,
                        client_auth,
                    })
                }
                None => MqttTransportKind::tls_with_default_config(),
            },
            (GatewayTransport::Websockets, true) => MqttTransportKind::wss_with_default_config(),
        })
    }

    async fn await_connack(&self, eventloop: &mut EventLoop) -> Result<(), BusError> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(event) => trace!(?event, "Waiting for connection acknowledgement"),
                Err(e) => {
                    return Err(BusError::Connect {
                        endpoint: self.endpoint(),
                        reason: e.to_string(),
                    })
                }
            }
        }
    }
}

async fn read_material(path: &std::path::Path) -> Result<Vec<u8>, BusError> {
    tokio::fs::read(path).await.map_err(|source| BusError::Tls {
        path: path.display().to_string(),
        source,
    })
}

// Drives the rumqttc event loop after the first ConnAck. The event loop
// reconnects on its own on the next poll after an error.
async fn poll_events(
    mut eventloop: EventLoop,
    events: UnboundedSender<TransportEvent>,
    backoff: Duration,
    cancel: CancellationToken,
    client_id: String,
) {
    let mut connected = true;
    loop {
        let polled = tokio::select! {
            () = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };
        match polled {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let event = TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                debug!(client = %client_id, "Reconnected to the broker");
                connected = true;
                let _ = events.send(TransportEvent::Connected);
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => break,
            Err(e) => {
                if connected {
                    warn!(client = %client_id, "Connection to the broker lost: {e}");
                    connected = false;
                    let _ = events.send(TransportEvent::Disconnected { unexpected: true });
                }
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
    trace!(client = %client_id, "Event loop stopped");
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, events: UnboundedSender<TransportEvent>) -> Result<(), BusError> {
        let options = self.mqtt_options().await?;
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        self.await_connack(&mut eventloop).await?;

        let cancel = CancellationToken::new();
        if let Some(previous) = self.poller.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        *self.client.lock() = Some(client);
        let _ = events.send(TransportEvent::Connected);
        tokio::spawn(poll_events(
            eventloop,
            events,
            self.reconnect_backoff,
            cancel,
            self.options.client_id.clone(),
        ));
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), BusError> {
        let client = self.client.lock().clone().ok_or(BusError::NotConnected)?;
        // unsubscribe first so the broker replays retained messages
        client
            .unsubscribe(pattern)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        client
            .subscribe(pattern, QoS::ExactlyOnce)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), BusError> {
        let client = self.client.lock().clone().ok_or(BusError::NotConnected)?;
        client
            .unsubscribe(pattern)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Option<Vec<u8>>,
        retain: bool,
    ) -> Result<(), BusError> {
        let client = self.client.lock().clone().ok_or(BusError::NotConnected)?;
        client
            .publish(topic, QoS::ExactlyOnce, retain, payload.unwrap_or_default())
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        let client = self.client.lock().take();
        let poller = self.poller.lock().take();
        let result = match client {
            Some(client) => client
                .disconnect()
                .await
                .map_err(|e| BusError::Transport(e.to_string())),
            None => Ok(()),
        };
        if let Some(poller) = poller {
            poller.cancel();
        }
        result
    }
}
