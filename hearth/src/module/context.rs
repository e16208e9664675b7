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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::bus::{BusClient, BusOptions, ClientOptions, Connector};
use crate::common::{HearthConfig, SessionRegistry, Settings, CONFIG};
use crate::message::{
    Message, BROADCAST, CONFIG_AUTHORITY, CONF, DELETE, LOG, REMOTE_LOGGER, SAVE,
};
use crate::watchdog::SupervisorLink;

/// A module's address on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleIdentity {
    /// Namespace, e.g. a package name or `system`.
    pub scope: String,
    /// Name within the scope.
    pub name: String,
}

impl ModuleIdentity {
    /// Creates an identity.
    #[must_use]
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }

    /// `scope/name`.
    #[must_use]
    pub fn fullname(&self) -> String {
        format!("{}/{}", self.scope, self.name)
    }
}

impl fmt::Display for ModuleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.name)
    }
}

/// Log severity of a module log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Only emitted while the module's debug flag is on.
    Debug,
    /// Informational.
    Info,
    /// Something unexpected that the module recovered from.
    Warning,
    /// A failure.
    Error,
}

impl Severity {
    /// Wire name used as `LOG` args.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

struct ContextInner {
    identity: ModuleIdentity,
    fullname: String,
    settings: Settings,
    config: HearthConfig,
    bus: BusClient,
    sessions: SessionRegistry,
    stopping: CancellationToken,
    debug: AtomicBool,
    version: RwLock<Option<String>>,
    build: RwLock<Option<String>>,
    supervisor: Option<SupervisorLink>,
    log_lines: Mutex<Option<UnboundedSender<Message>>>,
}

/// Everything a module needs at runtime: its identity, bus connection,
/// session registry and lifecycle flags.
///
/// Handed to every [`Module`](super::Module) hook. Cloning is cheap.
#[derive(Clone)]
pub struct ModuleContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("fullname", &self.inner.fullname)
            .field("configured", &self.is_configured())
            .field("stopping", &self.is_stopping())
            .finish_non_exhaustive()
    }
}

/// Assembles a [`ModuleContext`].
#[derive(Debug)]
pub struct ContextBuilder {
    identity: ModuleIdentity,
    settings: Settings,
    config: HearthConfig,
    supervisor: Option<SupervisorLink>,
    version: Option<String>,
    build: Option<String>,
}

impl ContextBuilder {
    /// Runtime settings; defaults to [`Settings::default`].
    #[must_use]
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// SDK tunables; defaults to the global [`CONFIG`].
    #[must_use]
    pub fn config(mut self, config: HearthConfig) -> Self {
        self.config = config;
        self
    }

    /// The supervisor managing this module.
    #[must_use]
    pub fn supervisor(mut self, link: SupervisorLink) -> Self {
        self.supervisor = Some(link);
        self
    }

    /// Version string stamped by the supervisor.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Short build identifier stamped by the supervisor.
    #[must_use]
    pub fn build_id(mut self, build: impl Into<String>) -> Self {
        self.build = Some(build.into());
        self
    }

    /// Creates the context with a fresh transport from `connector`.
    #[must_use]
    pub fn attach(self, connector: &dyn Connector) -> ModuleContext {
        let fullname = self.identity.fullname();
        let client_id = [
            crate::message::topic::PROTOCOL_TAG,
            self.settings.house_id.as_str(),
            self.identity.scope.as_str(),
            self.identity.name.as_str(),
        ]
        .join("-");
        let transport = connector.transport(ClientOptions {
            client_id,
            username: self.settings.house_id.clone(),
            password: self.settings.house_passcode.clone(),
            persistent: self.settings.persistent_client,
        });
        let mut options = BusOptions::new(
            fullname.clone(),
            self.settings.house_id.clone(),
            connector.endpoint(),
            &self.config,
        );
        options.verbose = self.settings.verbose;
        let bus = BusClient::new(options, transport);

        ModuleContext {
            inner: Arc::new(ContextInner {
                debug: AtomicBool::new(self.settings.debug),
                identity: self.identity,
                fullname,
                settings: self.settings,
                config: self.config,
                bus,
                sessions: SessionRegistry::new(),
                stopping: CancellationToken::new(),
                version: RwLock::new(self.version),
                build: RwLock::new(self.build),
                supervisor: self.supervisor,
                log_lines: Mutex::new(None),
            }),
        }
    }
}

impl ModuleContext {
    /// Starts building the context of module `scope/name`.
    #[must_use]
    pub fn builder(scope: impl Into<String>, name: impl Into<String>) -> ContextBuilder {
        ContextBuilder {
            identity: ModuleIdentity::new(scope, name),
            settings: Settings::default(),
            config: CONFIG.clone(),
            supervisor: None,
            version: None,
            build: None,
        }
    }

    /// This module's identity.
    #[must_use]
    pub fn identity(&self) -> &ModuleIdentity {
        &self.inner.identity
    }

    /// `scope/name`.
    #[must_use]
    pub fn fullname(&self) -> &str {
        &self.inner.fullname
    }

    /// Installation id.
    #[must_use]
    pub fn house_id(&self) -> &str {
        &self.inner.settings.house_id
    }

    /// Runtime settings.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// SDK tunables.
    #[must_use]
    pub fn config(&self) -> &HearthConfig {
        &self.inner.config
    }

    /// The module's bus connection.
    #[must_use]
    pub fn bus(&self) -> &BusClient {
        &self.inner.bus
    }

    /// Request/response correlation table.
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    /// The supervisor managing this module, if any.
    #[must_use]
    pub fn supervisor(&self) -> Option<&SupervisorLink> {
        self.inner.supervisor.as_ref()
    }

    /// Returns `true` while debug logging is on.
    #[must_use]
    pub fn debug(&self) -> bool {
        self.inner.debug.load(Ordering::Relaxed)
    }

    /// Turns debug logging on or off.
    pub fn set_debug(&self, enabled: bool) {
        self.inner.debug.store(enabled, Ordering::Relaxed);
    }

    /// Version stamped by the supervisor.
    #[must_use]
    pub fn version(&self) -> Option<String> {
        self.inner.version.read().clone()
    }

    /// Build identifier stamped by the supervisor.
    #[must_use]
    pub fn build(&self) -> Option<String> {
        self.inner.build.read().clone()
    }

    /// Returns `true` once every mandatory configuration has arrived.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.inner.bus.is_configured()
    }

    /// Returns `true` while the bus is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.bus.is_connected()
    }

    /// Returns `true` once the module has been asked to stop.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.is_cancelled()
    }

    /// Resolves when the module is asked to stop.
    pub async fn stopped(&self) {
        self.inner.stopping.cancelled().await;
    }

    pub(crate) fn stopping_token(&self) -> &CancellationToken {
        &self.inner.stopping
    }

    /// Sleeps for `duration`, waking up early if the module is stopping.
    ///
    /// Returns `false` if the sleep was cut short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.inner.stopping.cancelled() => false,
            () = tokio::time::sleep(duration) => !self.is_stopping(),
        }
    }

    /// A new envelope sent by this module within its house.
    #[must_use]
    pub fn message(&self) -> Message {
        Message::from_sender(self.house_id(), self.fullname())
    }

    /// Publishes `message`, or queues it while the bus is offline.
    ///
    /// Envelopes without a sender or recipient are rejected with a warning.
    pub async fn send(&self, message: &Message) {
        if !message.is_addressed() {
            warn!(module = %self.fullname(), "invalid message to send: {message}");
            return;
        }
        if let Err(e) = self.inner.bus.publish(message).await {
            error!(module = %self.fullname(), "Unable to send {message}: {e}");
        }
    }

    /// Subscribes to envelopes from `from` to `to`. Wildcards are allowed in
    /// every field. Returns the pattern for [`remove_listener`](Self::remove_listener).
    pub async fn add_listener(
        &self,
        from: &str,
        to: &str,
        command: &str,
        args: &str,
        wait_for_it: bool,
    ) -> String {
        self.inner
            .bus
            .add_listener(from, to, command, args, wait_for_it)
            .await
    }

    /// Listens for configuration `args` (optionally at schema `version`).
    ///
    /// With `wait_for_it` the module does not start until it has been received.
    pub async fn add_configuration_listener(
        &self,
        args: &str,
        version: Option<u32>,
        wait_for_it: bool,
    ) -> String {
        let filename = match version {
            Some(version) => format!("{version}/{args}"),
            None => args.to_string(),
        };
        self.add_listener(CONFIG_AUTHORITY, BROADCAST, CONF, &filename, wait_for_it)
            .await
    }

    /// Listens for envelopes addressed to this module.
    pub async fn add_request_listener(&self, from: &str, command: &str, args: &str) -> String {
        let to = self.fullname().to_string();
        self.add_listener(from, &to, command, args, false).await
    }

    /// Listens for broadcasts from `from`.
    pub async fn add_broadcast_listener(&self, from: &str, command: &str, args: &str) -> String {
        self.add_listener(from, BROADCAST, command, args, false).await
    }

    /// Listens for traffic between two other modules.
    pub async fn add_inspection_listener(
        &self,
        from: &str,
        to: &str,
        command: &str,
        args: &str,
    ) -> String {
        self.add_listener(from, to, command, args, false).await
    }

    /// Drops a listener registered earlier.
    pub async fn remove_listener(&self, pattern: &str) {
        self.inner.bus.remove_listener(pattern).await;
    }

    /// Asks the configuration authority to replace `filename` at
    /// `from_version` with `content` at `to_version`.
    pub async fn upgrade_config(
        &self,
        filename: &str,
        from_version: u32,
        to_version: u32,
        content: Value,
    ) {
        let mut delete = self.message();
        delete.recipient = CONFIG_AUTHORITY.to_string();
        delete.command = DELETE.to_string();
        delete.args = filename.to_string();
        delete.config_schema = Some(from_version);
        self.send(&delete).await;

        let mut save = self.message();
        save.recipient = CONFIG_AUTHORITY.to_string();
        save.command = SAVE.to_string();
        save.args = filename.to_string();
        save.config_schema = Some(to_version);
        save.set_data(content);
        self.send(&save).await;

        self.log_info(format!(
            "Requesting to upgrade configuration {filename} from v{from_version} to v{to_version}"
        ));
    }

    /// Returns `true` if `candidate` is a map holding a non-null value for
    /// every key in `required`.
    pub fn is_valid_configuration(&self, required: &[&str], candidate: &Value) -> bool {
        let Some(map) = candidate.as_object() else {
            self.log_warning(format!("Invalid configuration received, not a map: {candidate}"));
            return false;
        };
        for key in required {
            if map.get(*key).map_or(true, Value::is_null) {
                self.log_warning(format!(
                    "Invalid configuration received, {key} missing in {candidate}"
                ));
                return false;
            }
        }
        true
    }

    /// Logs at debug level while the module's debug flag is on.
    pub fn log_debug(&self, text: impl Into<String>) {
        if self.debug() {
            self.log(Severity::Debug, text.into());
        }
    }

    /// Logs at info level.
    pub fn log_info(&self, text: impl Into<String>) {
        self.log(Severity::Info, text.into());
    }

    /// Logs at warning level.
    pub fn log_warning(&self, text: impl Into<String>) {
        self.log(Severity::Warning, text.into());
    }

    /// Logs at error level.
    pub fn log_error(&self, text: impl Into<String>) {
        self.log(Severity::Error, text.into());
    }

    fn log(&self, severity: Severity, text: String) {
        let module = self.fullname();
        if self.inner.settings.logging_local {
            match severity {
                Severity::Debug => debug!(module, "{text}"),
                Severity::Info => info!(module, "{text}"),
                Severity::Warning => warn!(module, "{text}"),
                Severity::Error => error!(module, "{text}"),
            }
        }
        if self.inner.settings.logging_remote {
            let mut message = self.message();
            message.recipient = REMOTE_LOGGER.to_string();
            message.command = LOG.to_string();
            message.args = severity.as_str().to_string();
            message.set_data(Value::String(text));
            self.ship(message);
        }
    }

    // A single shipping task per context keeps remote log lines in order.
    fn ship(&self, message: Message) {
        let mut lines = self.inner.log_lines.lock();
        let sender = lines.get_or_insert_with(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            tokio::spawn(ship_log_lines(self.inner.bus.clone(), receiver));
            sender
        });
        if sender.send(message).is_err() {
            trace!(module = %self.fullname(), "Log shipper gone, dropping line");
        }
    }
}

async fn ship_log_lines(bus: BusClient, mut lines: UnboundedReceiver<Message>) {
    while let Some(message) = lines.recv().await {
        if let Err(e) = bus.publish(&message).await {
            error!(module = %bus.fullname(), "Unable to ship log line: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::bus::LocalBroker;

    fn context() -> ModuleContext {
        let broker = LocalBroker::new();
        ModuleContext::builder("sensors", "temp")
            .settings(Settings::local("house"))
            .config(HearthConfig::default())
            .attach(broker.connector().as_ref())
    }

    #[tokio::test]
    async fn messages_are_prefilled() {
        let ctx = context();
        let message = ctx.message();
        assert_eq!(message.sender, "sensors/temp");
        assert_eq!(message.house_id, "house");
        assert!(message.recipient.is_empty());
    }

    #[tokio::test]
    async fn configuration_validation() {
        let ctx = context();
        assert!(ctx.is_valid_configuration(&["unit", "offset"], &json!({"unit": "C", "offset": 0})));
        assert!(!ctx.is_valid_configuration(&["unit", "offset"], &json!({"unit": "C"})));
        assert!(!ctx.is_valid_configuration(&["unit"], &json!({"unit": null})));
        assert!(!ctx.is_valid_configuration(&["unit"], &json!(["unit"])));
        assert!(ctx.is_valid_configuration(&[], &json!({})));
    }

    #[tokio::test]
    async fn sleep_returns_early_when_stopping() {
        let ctx = context();
        let sleeper = ctx.clone();
        let sleeping = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(3600)).await });
        ctx.stopping_token().cancel();
        let completed = tokio::time::timeout(Duration::from_secs(5), sleeping)
            .await
            .unwrap()
            .unwrap();
        assert!(!completed);
        assert!(ctx.is_stopping());
    }

    #[tokio::test]
    async fn configuration_listener_prefixes_version() {
        let ctx = context();
        let pattern = ctx.add_configuration_listener("sensors/temp", Some(2), true).await;
        assert_eq!(pattern, "hearth/v1/+/controller/config/*/*/CONF/2/sensors/temp");
        assert!(!ctx.is_configured());
        assert_eq!(ctx.bus().pending_configuration(), vec![pattern]);
    }
}
