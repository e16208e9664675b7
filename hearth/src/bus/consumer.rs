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

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::BusClient;
use crate::common::HearthConfig;
use crate::message::{Message, PING, PONG};

/// Outcome of a module's configuration hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigurationVerdict {
    /// The configuration is valid and was applied.
    Accepted,
    /// The configuration is invalid; it is discarded and does not count
    /// towards the handshake.
    Rejected,
    /// The module expressed no opinion; treated like [`Accepted`](Self::Accepted).
    #[default]
    Ignored,
}

/// Work handed from the ingress task to the consumer workers.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// An inbound envelope.
    Message(Message),
    /// The connection came up.
    Connected,
    /// The connection went down.
    Disconnected,
}

/// Module callbacks invoked by the consumer workers.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// An ordinary envelope for a configured module.
    async fn message(&self, message: Message) -> anyhow::Result<()>;
    /// A configuration envelope.
    async fn configuration(&self, message: &Message) -> anyhow::Result<ConfigurationVerdict>;
    /// The bus connected.
    async fn connected(&self) -> anyhow::Result<()>;
    /// The bus disconnected.
    async fn disconnected(&self) -> anyhow::Result<()>;
}

/// Called once per overload episode.
pub type OverloadHandler = Arc<dyn Fn() + Send + Sync>;

/// Sizing of a [`ConsumerPool`].
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    /// Number of workers.
    pub workers: usize,
    /// Queue depth above which a warning is logged.
    pub warn_depth: usize,
    /// Queue depth above which the module asks to be restarted.
    pub overload_depth: usize,
    /// Idle wait before a worker re-checks for shutdown.
    pub poll: Duration,
    /// How long shutdown waits for busy workers before aborting them.
    pub shutdown: Duration,
}

impl From<&HearthConfig> for PoolLimits {
    fn from(config: &HearthConfig) -> Self {
        Self {
            workers: config.limits.consumer_workers,
            warn_depth: config.limits.consumer_queue_warn_depth,
            overload_depth: config.limits.consumer_queue_overload_depth,
            poll: config.timeouts.worker_poll(),
            shutdown: config.timeouts.module_shutdown_timeout(),
        }
    }
}

struct Dispatcher {
    bus: BusClient,
    hooks: Arc<dyn Hooks>,
}

/// Runs module handlers off the transport's I/O path.
///
/// The queue in front of the workers is unbounded but monitored: past
/// `warn_depth` every enqueue logs a warning, past `overload_depth` incoming
/// deliveries are dropped and the overload handler fires once until the depth
/// falls back under `warn_depth`.
pub struct ConsumerPool {
    sender: UnboundedSender<Delivery>,
    depth: Arc<AtomicUsize>,
    overloaded: AtomicBool,
    limits: PoolLimits,
    on_overload: Option<OverloadHandler>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    dispatcher: Arc<Dispatcher>,
}

impl std::fmt::Debug for ConsumerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerPool")
            .field("depth", &self.depth())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl ConsumerPool {
    /// Spawns `limits.workers` workers dispatching deliveries for `bus` to `hooks`.
    #[must_use]
    pub fn start(
        bus: BusClient,
        hooks: Arc<dyn Hooks>,
        limits: PoolLimits,
        on_overload: Option<OverloadHandler>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let depth = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher { bus, hooks });

        let workers = (0..limits.workers.max(1))
            .map(|index| {
                tokio::spawn(worker(
                    index,
                    Arc::clone(&receiver),
                    Arc::clone(&depth),
                    Arc::clone(&dispatcher),
                    cancel.clone(),
                    limits.poll,
                ))
            })
            .collect();

        Self {
            sender,
            depth,
            overloaded: AtomicBool::new(false),
            limits,
            on_overload,
            cancel,
            workers: Mutex::new(workers),
            dispatcher,
        }
    }

    /// Deliveries waiting for a worker.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Enqueues a delivery, applying the backpressure policy.
    pub fn submit(&self, delivery: Delivery) {
        let depth = self.depth();
        if depth > self.limits.overload_depth {
            if !self.overloaded.swap(true, Ordering::SeqCst) {
                error!(
                    module = %self.dispatcher.bus.fullname(),
                    depth,
                    "Consumer queue overloaded, requesting a restart"
                );
                if let Some(on_overload) = &self.on_overload {
                    on_overload();
                }
            }
            trace!(module = %self.dispatcher.bus.fullname(), "Dropping delivery while overloaded");
            return;
        }
        if depth > self.limits.warn_depth {
            warn!(module = %self.dispatcher.bus.fullname(), depth, "Consumer queue growing");
        } else {
            self.overloaded.store(false, Ordering::SeqCst);
        }
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(delivery).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Stops the workers, then runs the disconnect hook once.
    ///
    /// Workers still inside a handler when `limits.shutdown` elapses are
    /// aborted, so a handler that never returns cannot hold up the stop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let module = self.dispatcher.bus.fullname();
        let workers = std::mem::take(&mut *self.workers.lock());
        let deadline = tokio::time::Instant::now() + self.limits.shutdown;
        for (index, mut handle) in workers.into_iter().enumerate() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(module, index, "Consumer worker failed: {e}"),
                Err(_) => {
                    warn!(module, index, "Consumer worker still busy at shutdown, aborting");
                    handle.abort();
                }
            }
        }
        let hooks = Arc::clone(&self.dispatcher.hooks);
        let disconnected = guarded(module, "on_disconnect", None, async move {
            hooks.disconnected().await
        });
        if tokio::time::timeout(self.limits.shutdown, disconnected)
            .await
            .is_err()
        {
            warn!(module, "on_disconnect() did not return in time");
        }
    }
}

async fn worker(
    index: usize,
    receiver: Arc<tokio::sync::Mutex<UnboundedReceiver<Delivery>>>,
    depth: Arc<AtomicUsize>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    poll: Duration,
) {
    trace!(module = %dispatcher.bus.fullname(), index, "Consumer worker started");
    loop {
        let received = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = async {
                let mut receiver = receiver.lock().await;
                tokio::time::timeout(poll, receiver.recv()).await
            } => received,
        };
        let delivery = match received {
            Ok(Some(delivery)) => delivery,
            Ok(None) => break,
            Err(_) => continue,
        };
        depth.fetch_sub(1, Ordering::SeqCst);
        dispatcher.dispatch(delivery).await;
    }
    trace!(module = %dispatcher.bus.fullname(), index, "Consumer worker stopped");
}

// Runs one hook invocation, logging errors and panics instead of propagating them.
async fn guarded<T, F>(module: &str, hook: &str, message: Option<&Message>, call: F) -> Option<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            match message {
                Some(message) => error!(module, "runtime error during {hook}() - {message}: {e:#}"),
                None => error!(module, "runtime error during {hook}(): {e:#}"),
            }
            None
        }
        Err(_) => {
            match message {
                Some(message) => error!(module, "{hook}() panicked - {message}"),
                None => error!(module, "{hook}() panicked"),
            }
            None
        }
    }
}

impl Dispatcher {
    async fn dispatch(&self, delivery: Delivery) {
        let module = self.bus.fullname();
        match delivery {
            Delivery::Connected => {
                guarded(module, "on_connect", None, self.hooks.connected()).await;
            }
            Delivery::Disconnected => {
                guarded(module, "on_disconnect", None, self.hooks.disconnected()).await;
            }
            Delivery::Message(message) => self.dispatch_message(message).await,
        }
    }

    // Exactly one handler path per envelope, however many subscriptions match.
    async fn dispatch_message(&self, message: Message) {
        if !self.bus.is_subscribed(&message.topic) {
            trace!(module = %self.bus.fullname(), "No active subscription for {}", message.topic);
            return;
        }
        if message.is_configuration() {
            self.configure(message).await;
        } else if message.command == PING {
            let mut pong = message.reply();
            pong.command = PONG.to_string();
            if let Err(e) = self.bus.publish(&pong).await {
                warn!(module = %self.bus.fullname(), "Unable to answer ping: {e}");
            }
        } else if self.bus.is_configured() {
            let module = self.bus.fullname();
            let summary = message.to_string();
            let hooks = &self.hooks;
            match AssertUnwindSafe(hooks.message(message)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(module, "runtime error during on_message() - {summary}: {e:#}"),
                Err(_) => error!(module, "on_message() panicked - {summary}"),
            }
        } else {
            debug!(module = %self.bus.fullname(), "Not configured, dropping {message}");
        }
    }

    async fn configure(&self, message: Message) {
        let module = self.bus.fullname();
        let verdict = guarded(
            module,
            "on_configuration",
            Some(&message),
            self.hooks.configuration(&message),
        )
        .await;
        match verdict {
            None => return,
            Some(ConfigurationVerdict::Rejected) => {
                debug!(module, "Configuration rejected: {}", message.topic);
                return;
            }
            Some(_) => {}
        }
        let resolution = self.bus.accept_configuration(&message);
        for queued in resolution.drained {
            guarded(
                module,
                "on_configuration",
                Some(&queued),
                self.hooks.configuration(&queued),
            )
            .await;
        }
    }
}
