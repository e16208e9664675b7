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

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{topic, ProtocolError};

/// Command used to ping a module.
pub const PING: &str = "PING";
/// Command used to answer a [`PING`].
pub const PONG: &str = "PONG";
/// Presence broadcast (`1` up, `0` down).
pub const STATUS: &str = "STATUS";
/// Fleet enumeration request/response.
pub const DISCOVER: &str = "DISCOVER";
/// Supervisor control: stop a module.
pub const STOP: &str = "STOP";
/// Supervisor control: start a module.
pub const START: &str = "START";
/// Supervisor control: restart a module.
pub const RESTART: &str = "RESTART";
/// Supervisor control: toggle a module's debug flag.
pub const DEBUG: &str = "DEBUG";
/// Configuration push from the configuration authority.
pub const CONF: &str = "CONF";
/// Retained package descriptor.
pub const MANIFEST: &str = "MANIFEST";
/// Log line addressed to the remote logger.
pub const LOG: &str = "LOG";
/// Removes a configuration document.
pub const DELETE: &str = "DELETE";
/// Stores a configuration document.
pub const SAVE: &str = "SAVE";

/// Recipient used for broadcasts.
pub const BROADCAST: &str = "*/*";
/// House id matching every installation.
pub const ANY_HOUSE: &str = "*";
/// The well-known configuration authority.
pub const CONFIG_AUTHORITY: &str = "controller/config";
/// The well-known remote logger.
pub const REMOTE_LOGGER: &str = "controller/logger";

/// The body of an envelope as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Correlation id, random per envelope unless carried through for a reply.
    #[serde(default)]
    pub request_id: u64,
    /// User data of unrestricted shape.
    #[serde(default)]
    pub data: Value,
}

impl Payload {
    fn fresh() -> Self {
        Self {
            request_id: generate_request_id(),
            data: Value::Object(Map::new()),
        }
    }
}

fn generate_request_id() -> u64 {
    rand::rng().random_range(1..=100_000)
}

/// A message exchanged between modules over the bus.
///
/// `Message` is a plain value type: [`reply`](Self::reply) and
/// [`forward`](Self::forward) return new envelopes rather than mutating the
/// original, and every payload accessor hands out an owned copy.
///
/// # Example
///
/// ```rust,ignore
/// let mut message = ctx.message();
/// message.recipient = "controller/hub".into();
/// message.command = "IN".into();
/// message.args = "livingroom".into();
/// message.set("value", 21.5.into());
/// ctx.send(&message).await;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Literal topic the message arrived on; empty for outgoing envelopes.
    pub topic: String,
    /// Installation the message belongs to.
    pub house_id: String,
    /// Sender fullname.
    pub sender: String,
    /// Recipient fullname.
    pub recipient: String,
    /// Command verb.
    pub command: String,
    /// Free-form arguments.
    pub args: String,
    /// Set when the envelope carries no payload at all (clears retained state).
    pub is_null: bool,
    /// Ask the broker to retain the message.
    pub retain: bool,
    /// Version of the configuration file this envelope refers to, if any.
    ///
    /// When set, the version is prefixed to `args` at send time.
    pub config_schema: Option<u32>,
    payload: Payload,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    /// Creates an empty envelope with a fresh request id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            topic: String::new(),
            house_id: String::new(),
            sender: String::new(),
            recipient: String::new(),
            command: String::new(),
            args: String::new(),
            is_null: false,
            retain: false,
            config_schema: None,
            payload: Payload::fresh(),
        }
    }

    /// Creates an envelope already addressed from `sender` within `house_id`.
    #[must_use]
    pub fn from_sender(house_id: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            house_id: house_id.into(),
            sender: sender.into(),
            ..Self::new()
        }
    }

    /// Decodes an inbound message from its topic and raw payload.
    ///
    /// An empty payload marks the envelope as null.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] if the topic is malformed or the payload is
    /// not valid JSON.
    pub fn parse(wire_topic: &str, payload: &[u8], retain: bool) -> Result<Self, ProtocolError> {
        let parts = topic::parse(wire_topic)?;
        let mut message = Self {
            topic: wire_topic.to_string(),
            house_id: parts.house_id,
            sender: parts.sender,
            recipient: parts.recipient,
            command: parts.command,
            args: parts.args,
            retain,
            ..Self::new()
        };
        if payload.is_empty() {
            message.is_null = true;
        } else {
            message.payload = serde_json::from_slice(payload)?;
        }
        Ok(message)
    }

    /// Serializes the payload for the wire, or `None` for a null envelope.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] if the data cannot be serialized.
    pub fn encode_payload(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.is_null {
            return Ok(None);
        }
        Ok(Some(serde_json::to_vec(&self.payload)?))
    }

    /// Arguments as they are written on the wire, including the configuration
    /// schema prefix when one is set.
    #[must_use]
    pub fn wire_args(&self) -> String {
        match self.config_schema {
            Some(schema) if self.args.is_empty() => schema.to_string(),
            Some(schema) => format!("{schema}/{}", self.args),
            None => self.args.clone(),
        }
    }

    /// Returns `true` if both ends of the envelope are set.
    #[must_use]
    pub fn is_addressed(&self) -> bool {
        !self.sender.is_empty() && !self.recipient.is_empty()
    }

    /// Returns `true` if this is a configuration push from the configuration authority.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        self.sender == CONFIG_AUTHORITY && self.command == CONF
    }

    /// Builds the answer to this envelope.
    ///
    /// Sender and recipient are swapped, command and args are kept, the data
    /// is cleared and the request id is carried through for correlation.
    #[must_use]
    pub fn reply(&self) -> Self {
        let mut reply = self.clone();
        std::mem::swap(&mut reply.sender, &mut reply.recipient);
        reply.topic.clear();
        reply.is_null = false;
        reply.payload.data = Value::Object(Map::new());
        reply
    }

    /// Re-addresses this envelope to another module, keeping its payload.
    #[must_use]
    pub fn forward(&self, recipient: impl Into<String>) -> Self {
        let mut forwarded = self.clone();
        forwarded.sender = std::mem::take(&mut forwarded.recipient);
        forwarded.recipient = recipient.into();
        forwarded.topic.clear();
        forwarded
    }

    /// Replaces the payload with a fresh one and a new request id.
    pub fn clear(&mut self) {
        self.is_null = false;
        self.payload = Payload::fresh();
    }

    /// Marks the envelope as carrying no payload.
    pub fn set_null(&mut self) {
        self.is_null = true;
    }

    /// Replaces the data.
    pub fn set_data(&mut self, value: Value) {
        self.is_null = false;
        self.payload.data = value;
    }

    /// Sets `key` in the data, turning the data into a map if it is not one.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.is_null = false;
        if !self.payload.data.is_object() {
            self.payload.data = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.payload.data {
            map.insert(key.into(), value);
        }
    }

    /// Returns a copy of the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        if self.is_null {
            return None;
        }
        self.payload.data.as_object()?.get(key).cloned()
    }

    /// Returns `true` if the data holds a non-null value under `key`.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some_and(|value| !value.is_null())
    }

    /// Returns a copy of the whole data value.
    #[must_use]
    pub fn get_data(&self) -> Option<Value> {
        if self.is_null {
            return None;
        }
        Some(self.payload.data.clone())
    }

    /// The correlation id of this envelope.
    #[must_use]
    pub const fn request_id(&self) -> u64 {
        self.payload.request_id
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message({} -> {}: {} {}: ",
            self.sender, self.recipient, self.command, self.args
        )?;
        if self.is_null {
            write!(f, "null)")
        } else {
            write!(f, "{} [{}])", self.payload.data, self.payload.request_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn addressed() -> Message {
        let mut message = Message::from_sender("house", "sensors/temp");
        message.recipient = "controller/hub".to_string();
        message.command = "IN".to_string();
        message.args = "livingroom".to_string();
        message.set("value", json!(21.5));
        message
    }

    #[test]
    fn request_id_is_generated_once() {
        let message = Message::new();
        let id = message.request_id();
        assert!((1..=100_000).contains(&id));
        assert_eq!(message.clone().request_id(), id);
    }

    #[test]
    fn reply_swaps_ends_and_keeps_request_id() {
        let original = addressed();
        let reply = original.reply();
        assert_eq!(reply.sender, "controller/hub");
        assert_eq!(reply.recipient, "sensors/temp");
        assert_eq!(reply.command, "IN");
        assert_eq!(reply.args, "livingroom");
        assert_eq!(reply.request_id(), original.request_id());
        assert_eq!(reply.get("value"), None);
    }

    #[test]
    fn double_reply_restores_addressing() {
        let original = addressed();
        let back = original.reply().reply();
        assert_eq!(back.sender, original.sender);
        assert_eq!(back.recipient, original.recipient);
        assert_eq!(back.command, original.command);
        assert_eq!(back.args, original.args);
    }

    #[test]
    fn forward_readdresses_from_old_recipient() {
        let forwarded = addressed().forward("controller/db");
        assert_eq!(forwarded.sender, "controller/hub");
        assert_eq!(forwarded.recipient, "controller/db");
        assert_eq!(forwarded.get("value"), Some(json!(21.5)));
    }

    #[test]
    fn accessors_hand_out_copies() {
        let mut message = addressed();
        let mut data = message.get_data().unwrap();
        data["value"] = json!(99);
        assert_eq!(message.get("value"), Some(json!(21.5)));
        message.set("value", json!(1));
        assert_eq!(data["value"], json!(99));
    }

    #[test]
    fn set_turns_scalar_data_into_map() {
        let mut message = Message::new();
        message.set_data(json!(5));
        assert_eq!(message.get("key"), None);
        message.set("key", json!("x"));
        assert_eq!(message.get_data(), Some(json!({"key": "x"})));
        assert!(message.has("key"));
        assert!(!message.has("other"));
    }

    #[test]
    fn parse_round_trips_payload() {
        let message = addressed();
        let wire = topic::build(
            &message.house_id,
            &message.sender,
            &message.recipient,
            &message.command,
            &message.args,
        );
        let payload = message.encode_payload().unwrap().unwrap();
        let parsed = Message::parse(&wire, &payload, true).unwrap();
        assert_eq!(parsed.topic, wire);
        assert_eq!(parsed.request_id(), message.request_id());
        assert_eq!(parsed.get("value"), Some(json!(21.5)));
        assert!(parsed.retain);
        assert!(!parsed.is_null);
    }

    #[test]
    fn empty_payload_is_null() {
        let parsed = Message::parse("hearth/v1/h/a/b/*/*/MANIFEST/pkg", b"", true).unwrap();
        assert!(parsed.is_null);
        assert_eq!(parsed.get_data(), None);
        assert_eq!(parsed.encode_payload().unwrap(), None);
    }

    #[test]
    fn invalid_json_is_rejected() {
        let err = Message::parse("hearth/v1/h/a/b/c/d/CMD/x", b"{nope", false).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload(_)));
    }

    #[test]
    fn config_schema_prefixes_args() {
        let mut message = Message::new();
        message.args = "sensors/livingroom".to_string();
        message.config_schema = Some(2);
        assert_eq!(message.wire_args(), "2/sensors/livingroom");
    }

    #[test]
    fn display_renders_null_payloads() {
        let mut message = addressed();
        message.set_null();
        assert_eq!(
            message.to_string(),
            "Message(sensors/temp -> controller/hub: IN livingroom: null)"
        );
    }
}
