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

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::control::{ControlRequest, RestartReason, SupervisorLink};
use super::factory::ModuleFactory;
use super::manifest::Manifest;
use super::registry::{ModuleEntry, ModuleStatus};
use super::restart_limiter::RestartLimiter;
use super::signature::runtime_signature;
use crate::bus::{ConfigurationVerdict, Connector};
use crate::common::{HearthConfig, Settings};
use crate::message::{
    Message, BROADCAST, DEBUG, DISCOVER, MANIFEST, PING, PONG, RESTART, START, STOP,
};
use crate::module::{Module, ModuleContext, ModuleHandle, ModuleIdentity};

/// Scope of every supervisor.
pub const WATCHDOG_SCOPE: &str = "system";

#[derive(Default)]
struct Fleet {
    entries: Vec<ModuleEntry>,
    running: HashMap<String, ModuleHandle>,
    limiters: HashMap<String, RestartLimiter>,
}

impl Fleet {
    fn index(&self, fullname: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.fullname == fullname)
    }
}

/// The supervisor: a module that starts, stops, restarts and pings the
/// modules of one package and publishes the package manifest.
///
/// Every change to the fleet is made by the control loop running in
/// `on_start`; bus handlers only translate envelopes into
/// [`ControlRequest`]s.
pub struct Watchdog {
    identity: ModuleIdentity,
    manifest: Manifest,
    factory: ModuleFactory,
    connector: Arc<dyn Connector>,
    settings: Settings,
    config: HearthConfig,
    link: SupervisorLink,
    inbox: Mutex<Option<UnboundedReceiver<ControlRequest>>>,
    fleet: tokio::sync::Mutex<Fleet>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("identity", &self.identity)
            .field("factory", &self.factory)
            .finish_non_exhaustive()
    }
}

impl Watchdog {
    /// Creates a supervisor for `manifest` managing `entries`.
    #[must_use]
    pub fn new(
        manifest: Manifest,
        entries: Vec<ModuleEntry>,
        factory: ModuleFactory,
        connector: Arc<dyn Connector>,
        settings: Settings,
        config: HearthConfig,
    ) -> Self {
        let identity = ModuleIdentity::new(
            WATCHDOG_SCOPE,
            format!("watchdog-{}-{}", manifest.package(), runtime_signature(&settings)),
        );
        let (sender, inbox) = mpsc::unbounded_channel();
        Self {
            identity,
            manifest,
            factory,
            connector,
            settings,
            config,
            link: SupervisorLink::new(sender),
            inbox: Mutex::new(Some(inbox)),
            fleet: tokio::sync::Mutex::new(Fleet {
                entries,
                ..Fleet::default()
            }),
        }
    }

    /// The supervisor's own identity, `system/watchdog-<package>-<signature>`.
    #[must_use]
    pub fn identity(&self) -> &ModuleIdentity {
        &self.identity
    }

    /// A link for submitting control requests.
    #[must_use]
    pub fn link(&self) -> SupervisorLink {
        self.link.clone()
    }

    /// Starts the supervisor as a module on its own bus connection.
    pub async fn launch(self) -> WatchdogHandle {
        let ctx = ModuleContext::builder(self.identity.scope.clone(), self.identity.name.clone())
            .settings(self.settings.clone())
            .config(self.config.clone())
            .version(self.manifest.version_string())
            .attach(self.connector.as_ref());
        let watchdog = Arc::new(self);
        let handle = ModuleHandle::launch(Arc::clone(&watchdog) as Arc<dyn Module>, ctx).await;
        WatchdogHandle { watchdog, handle }
    }

    /// The live state of every managed module.
    pub async fn snapshot(&self) -> Vec<ModuleStatus> {
        let fleet = self.fleet.lock().await;
        fleet
            .entries
            .iter()
            .map(|entry| status_of(entry, fleet.running.get(&entry.fullname)))
            .collect()
    }

    async fn publish_manifest(&self, ctx: &ModuleContext, withdraw_only: bool) {
        let mut message = ctx.message();
        message.recipient = BROADCAST.to_string();
        message.command = MANIFEST.to_string();
        message.args = self.manifest.package();
        message.retain = true;
        message.set_null();
        ctx.send(&message).await;
        if !withdraw_only {
            message.set_data(self.manifest.to_value());
            ctx.send(&message).await;
        }
    }

    // The fleet lock is only held while the entry is inspected and updated,
    // never across a module's hooks.
    async fn start_module(&self, ctx: &ModuleContext, index: usize) {
        let (module, module_ctx, fullname) = {
            let mut fleet = self.fleet.lock().await;
            let Some(entry) = fleet.entries.get_mut(index) else {
                return;
            };
            if entry.started {
                return;
            }
            let identity = ModuleIdentity::new(entry.scope.clone(), entry.name.clone());
            let Some((module, build)) = self.factory.create(&entry.file, &identity) else {
                ctx.log_error(format!(
                    "Module {} not found, skipping",
                    entry.declared_name()
                ));
                return;
            };
            let module_ctx = ModuleContext::builder(identity.scope, identity.name)
                .settings(self.settings.clone())
                .config(self.config.clone())
                .supervisor(self.link.clone())
                .version(self.manifest.version_string())
                .build_id(build)
                .attach(self.connector.as_ref());
            entry.started = true;
            entry.reset_liveness();
            (module, module_ctx, entry.fullname.clone())
        };

        let handle = ModuleHandle::launch(module, module_ctx).await;
        let mut fleet = self.fleet.lock().await;
        let wanted = fleet.entries.get(index).is_some_and(|entry| entry.started)
            && !fleet.running.contains_key(&fullname);
        if !wanted {
            // stopped while launching
            drop(fleet);
            handle.stop().await;
            return;
        }
        fleet.running.insert(fullname.clone(), handle);
        debug!(module = %ctx.fullname(), "Started {fullname}");
    }

    async fn stop_module(&self, index: usize) {
        let handle = {
            let mut fleet = self.fleet.lock().await;
            let Fleet {
                entries, running, ..
            } = &mut *fleet;
            let Some(entry) = entries.get_mut(index) else {
                return;
            };
            if !entry.started {
                return;
            }
            entry.started = false;
            entry.reset_liveness();
            running.remove(&entry.fullname)
        };
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// Restarts `fullname`. Operator requests always go through; overload
    /// restarts are rate limited, and a module over its limit is stopped.
    async fn restart_module(&self, ctx: &ModuleContext, fullname: &str, reason: RestartReason) {
        let admitted = {
            let mut fleet = self.fleet.lock().await;
            let Some(index) = fleet.index(fullname) else {
                return;
            };
            match reason {
                RestartReason::Requested => Ok((index, Duration::ZERO)),
                RestartReason::Overload if !fleet.entries[index].started => return,
                RestartReason::Overload => fleet
                    .limiters
                    .entry(fullname.to_string())
                    .or_insert_with(|| RestartLimiter::new(self.config.restart.clone()))
                    .admit()
                    .map(|backoff| (index, backoff))
                    .map_err(|e| (index, e)),
            }
        };
        let (index, backoff) = match admitted {
            Ok(admitted) => admitted,
            Err((index, e)) => {
                ctx.log_error(format!("Not restarting {fullname}: {e}, stopping it"));
                self.stop_module(index).await;
                return;
            }
        };
        match reason {
            RestartReason::Requested => ctx.log_info(format!("asked to restart module {fullname}")),
            RestartReason::Overload => {
                ctx.log_warning(format!("restarting overloaded module {fullname}"));
            }
        }
        self.stop_module(index).await;
        if !backoff.is_zero() && !ctx.sleep(backoff).await {
            return;
        }
        self.start_module(ctx, index).await;
    }

    async fn handle(&self, ctx: &ModuleContext, request: ControlRequest) {
        match request {
            ControlRequest::Start(fullname) => {
                let index = self.fleet.lock().await.index(&fullname);
                if let Some(index) = index {
                    ctx.log_info(format!("asked to start module {fullname}"));
                    self.start_module(ctx, index).await;
                }
            }
            ControlRequest::Stop(fullname) => {
                let index = self.fleet.lock().await.index(&fullname);
                if let Some(index) = index {
                    ctx.log_info(format!("asked to stop module {fullname}"));
                    self.stop_module(index).await;
                }
            }
            ControlRequest::Restart { fullname, reason } => {
                self.restart_module(ctx, &fullname, reason).await;
            }
            ControlRequest::Debug { fullname, enabled } => {
                let fleet = self.fleet.lock().await;
                if let Some(handle) = fleet.running.get(&fullname) {
                    ctx.log_info(format!("setting debug to {enabled} to module {fullname}"));
                    handle.context().set_debug(enabled);
                }
            }
            ControlRequest::Pong {
                fullname,
                received_at,
            } => {
                let mut fleet = self.fleet.lock().await;
                if let Some(index) = fleet.index(&fullname) {
                    if let Some(rtt) = fleet.entries[index].pong_received(received_at) {
                        ctx.log_debug(format!(
                            "Received ping reply from {fullname}: {:.3}s",
                            rtt.as_secs_f64()
                        ));
                    }
                }
            }
            ControlRequest::Discover(request) => {
                let fleet = self.fleet.lock().await;
                let statuses: Vec<ModuleStatus> = fleet
                    .entries
                    .iter()
                    .filter(|entry| discover_matches(&request.args, &entry.fullname))
                    .map(|entry| status_of(entry, fleet.running.get(&entry.fullname)))
                    .collect();
                drop(fleet);
                if statuses.is_empty() {
                    return;
                }
                ctx.log_debug(format!("requested module discovery from {}", request.sender));
                let mut response = request.reply();
                response.sender = ctx.fullname().to_string();
                response.house_id = ctx.house_id().to_string();
                response.args = "res".to_string();
                match serde_json::to_value(&statuses) {
                    Ok(data) => response.set_data(data),
                    Err(e) => {
                        ctx.log_error(format!("Unable to serialize discovery response: {e}"));
                        return;
                    }
                }
                ctx.send(&response).await;
            }
        }
    }

    async fn ping(&self, ctx: &ModuleContext) {
        let timeout = self.config.timeouts.ping_timeout();
        let targets: Vec<String> = {
            let mut fleet = self.fleet.lock().await;
            let now = Instant::now();
            fleet
                .entries
                .iter_mut()
                .filter(|entry| entry.started)
                .map(|entry| {
                    if entry.is_unreachable(now, timeout) {
                        ctx.log_warning(format!("module {} is unreachable", entry.fullname));
                    }
                    if !entry.ping_pending {
                        entry.ping_sent(now);
                    }
                    entry.fullname.clone()
                })
                .collect()
        };
        for fullname in targets {
            let mut ping = ctx.message();
            ping.recipient = fullname;
            ping.command = PING.to_string();
            ctx.log_debug(format!("Pinging {}...", ping.recipient));
            ctx.send(&ping).await;
        }
    }
}

fn status_of(entry: &ModuleEntry, handle: Option<&ModuleHandle>) -> ModuleStatus {
    let ctx = handle.map(ModuleHandle::context);
    ModuleStatus {
        package: entry.package.clone(),
        file: entry.file.clone(),
        scope: entry.scope.clone(),
        name: entry.name.clone(),
        fullname: entry.fullname.clone(),
        started: entry.started,
        ping: entry.rtt.map(|rtt| rtt.as_secs_f64()),
        debug: ctx.is_some_and(ModuleContext::debug),
        version: ctx.and_then(ModuleContext::version),
        build: ctx.and_then(ModuleContext::build),
        configured: ctx.is_some_and(ModuleContext::is_configured),
    }
}

fn discover_matches(args: &str, fullname: &str) -> bool {
    matches!(args, "*" | "req" | "") || args == fullname
}

fn flag_value(data: Option<Value>) -> Option<bool> {
    match data? {
        Value::Bool(enabled) => Some(enabled),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[async_trait]
impl Module for Watchdog {
    async fn on_init(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        ctx.add_broadcast_listener("+/+", DISCOVER, "#").await;
        Ok(())
    }

    async fn on_start(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        let Some(mut inbox) = self.inbox.lock().take() else {
            anyhow::bail!("control loop already running");
        };
        self.publish_manifest(ctx, false).await;

        let stagger = self.config.timeouts.start_stagger();
        let count = self.fleet.lock().await.entries.len();
        for index in 0..count {
            if ctx.is_stopping() {
                return Ok(());
            }
            self.start_module(ctx, index).await;
            ctx.sleep(stagger).await;
        }
        info!(module = %ctx.fullname(), modules = count, "Fleet started");

        let interval = self.config.timeouts.ping_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                () = ctx.stopped() => break,
                request = inbox.recv() => match request {
                    Some(request) => self.handle(ctx, request).await,
                    None => break,
                },
                _ = ticker.tick() => self.ping(ctx).await,
            }
        }
        Ok(())
    }

    async fn on_stop(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        let count = self.fleet.lock().await.entries.len();
        for index in (0..count).rev() {
            self.stop_module(index).await;
        }
        self.publish_manifest(ctx, true).await;
        Ok(())
    }

    async fn on_message(&self, ctx: &ModuleContext, message: Message) -> anyhow::Result<()> {
        if message.sender == ctx.fullname() {
            return Ok(());
        }
        let request = match message.command.as_str() {
            PONG => ControlRequest::Pong {
                fullname: message.sender,
                received_at: Instant::now(),
            },
            DISCOVER if message.args == "res" => return Ok(()),
            DISCOVER => ControlRequest::Discover(message),
            DEBUG => {
                let Some(enabled) = flag_value(message.get_data()) else {
                    warn!(module = %ctx.fullname(), "Invalid debug value in {message}");
                    return Ok(());
                };
                ControlRequest::Debug {
                    fullname: message.args,
                    enabled,
                }
            }
            STOP => ControlRequest::Stop(message.args),
            START => ControlRequest::Start(message.args),
            RESTART => ControlRequest::Restart {
                fullname: message.args,
                reason: RestartReason::Requested,
            },
            _ => return Ok(()),
        };
        self.link.request(request);
        Ok(())
    }

    async fn on_configuration(
        &self,
        _ctx: &ModuleContext,
        _message: &Message,
    ) -> anyhow::Result<ConfigurationVerdict> {
        Ok(ConfigurationVerdict::Ignored)
    }
}

/// A running supervisor.
#[derive(Debug)]
pub struct WatchdogHandle {
    watchdog: Arc<Watchdog>,
    handle: ModuleHandle,
}

impl WatchdogHandle {
    /// The supervisor.
    #[must_use]
    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    /// The supervisor's module context.
    #[must_use]
    pub fn context(&self) -> &ModuleContext {
        self.handle.context()
    }

    /// The live state of every managed module.
    pub async fn snapshot(&self) -> Vec<ModuleStatus> {
        self.watchdog.snapshot().await
    }

    /// Stops the managed modules in reverse order, withdraws the manifest and
    /// stops the supervisor.
    pub async fn stop(&self) {
        self.handle.stop().await;
    }

    /// Runs until `shutdown` is cancelled, then stops.
    pub async fn run_until(self, shutdown: CancellationToken) {
        shutdown.cancelled().await;
        info!(module = %self.context().fullname(), "Exiting...");
        self.stop().await;
    }
}
