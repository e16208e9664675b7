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
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hearth::bus::{Transport, TransportEvent};
use hearth::message::topic;
use hearth::prelude::*;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// A third party speaking the wire protocol directly on the broker, without
/// the module runtime.
#[derive(Debug)]
pub struct ScriptedClient {
    house_id: String,
    fullname: String,
    transport: Arc<dyn Transport>,
    events: UnboundedReceiver<TransportEvent>,
}

impl ScriptedClient {
    pub async fn connect(broker: &LocalBroker, house_id: &str, fullname: &str) -> Self {
        let transport = broker.transport(format!("scripted-{fullname}"));
        let (sender, events) = mpsc::unbounded_channel();
        transport
            .connect(sender)
            .await
            .expect("local broker refused the scripted client");
        Self {
            house_id: house_id.to_string(),
            fullname: fullname.to_string(),
            transport,
            events,
        }
    }

    /// Subscribes to traffic from `from` to `to`.
    pub async fn listen(&self, from: &str, to: &str, command: &str) {
        let pattern = topic::build("+", from, to, command, "#");
        self.transport
            .subscribe(&pattern)
            .await
            .expect("subscribe failed");
    }

    pub fn envelope(&self, to: &str, command: &str, args: &str) -> Message {
        let mut message = Message::from_sender(self.house_id.clone(), self.fullname.clone());
        message.recipient = to.to_string();
        message.command = command.to_string();
        message.args = args.to_string();
        message
    }

    /// Publishes `message` as written, sender included.
    pub async fn publish(&self, message: &Message) {
        let wire_topic = topic::build(
            &message.house_id,
            &message.sender,
            &message.recipient,
            &message.command,
            &message.wire_args(),
        );
        let payload = message.encode_payload().expect("payload encodes");
        self.transport
            .publish(&wire_topic, payload, message.retain)
            .await
            .expect("publish failed");
    }

    pub async fn send(&self, to: &str, command: &str, args: &str, data: Option<Value>) {
        let mut message = self.envelope(to, command, args);
        if let Some(data) = data {
            message.set_data(data);
        }
        self.publish(&message).await;
    }

    /// Pushes configuration file `args` as the configuration authority.
    pub async fn configure(&self, args: &str, data: Value, retain: bool) {
        let mut message = Message::from_sender(self.house_id.clone(), CONFIG_AUTHORITY);
        message.recipient = BROADCAST.to_string();
        message.command = CONF.to_string();
        message.args = args.to_string();
        message.retain = retain;
        message.set_data(data);
        self.publish(&message).await;
    }

    /// Waits for the next inbound envelope accepted by `filter`.
    pub async fn next_matching<F>(&mut self, timeout: Duration, mut filter: F) -> Option<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .ok()??;
            if let TransportEvent::Message {
                topic,
                payload,
                retain,
            } = event
            {
                if let Ok(message) = Message::parse(&topic, &payload, retain) {
                    if filter(&message) {
                        return Some(message);
                    }
                }
            }
        }
    }

    /// Every envelope accepted by `filter` arriving within `window`.
    pub async fn collect_matching<F>(&mut self, window: Duration, mut filter: F) -> Vec<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        let deadline = tokio::time::Instant::now() + window;
        let mut collected = Vec::new();
        while let Some(message) = self
            .next_matching(
                deadline.saturating_duration_since(tokio::time::Instant::now()),
                &mut filter,
            )
            .await
        {
            collected.push(message);
        }
        collected
    }
}
