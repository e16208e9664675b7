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

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Module, ModuleContext};
use crate::bus::{ConfigurationVerdict, ConsumerPool, Hooks, OverloadHandler, PoolLimits};
use crate::message::{Message, BROADCAST, STATUS};

/// A running module.
///
/// Created by [`ModuleHandle::launch`], which runs `on_init` and spawns the
/// lifecycle task; [`ModuleHandle::stop`] runs the stop sequence.
pub struct ModuleHandle {
    ctx: ModuleContext,
    module: Arc<dyn Module>,
    lifecycle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

struct ModuleHooks {
    module: Arc<dyn Module>,
    ctx: ModuleContext,
}

#[async_trait]
impl Hooks for ModuleHooks {
    async fn message(&self, message: Message) -> anyhow::Result<()> {
        self.module.on_message(&self.ctx, message).await
    }

    async fn configuration(&self, message: &Message) -> anyhow::Result<ConfigurationVerdict> {
        self.module.on_configuration(&self.ctx, message).await
    }

    async fn connected(&self) -> anyhow::Result<()> {
        self.module.on_connect(&self.ctx).await
    }

    async fn disconnected(&self) -> anyhow::Result<()> {
        self.module.on_disconnect(&self.ctx).await
    }
}

impl ModuleHandle {
    /// Initializes `module` and starts its lifecycle in the background.
    ///
    /// `on_init` runs before this returns; an error there is logged and the
    /// module is started anyway. The lifecycle task then connects, listens
    /// for envelopes addressed to the module, announces `STATUS 1`, waits
    /// until the module is configured and finally runs `on_start`.
    pub async fn launch(module: Arc<dyn Module>, ctx: ModuleContext) -> Self {
        ctx.log_debug("Initializing module...");
        if let Err(message) = run_hook(&ctx, "on_init", module.on_init(&ctx)).await {
            error!(module = %ctx.fullname(), "{message}");
        }
        let lifecycle = tokio::spawn(run(Arc::clone(&module), ctx.clone()));
        Self {
            ctx,
            module,
            lifecycle: Mutex::new(Some(lifecycle)),
        }
    }

    /// The module's context.
    #[must_use]
    pub fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    /// Returns `true` until the lifecycle task finished or the module was stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.ctx.is_stopping()
            && self
                .lifecycle
                .lock()
                .as_ref()
                .is_some_and(|task| !task.is_finished())
    }

    /// Runs the stop sequence: flag the module as stopping, announce
    /// `STATUS 0`, run `on_stop`, then disconnect the bus (which stops the
    /// consumer workers first). Waits for the lifecycle task up to the
    /// configured shutdown timeout before aborting it. Calling it twice is a no-op.
    pub async fn stop(&self) {
        let Some(lifecycle) = self.lifecycle.lock().take() else {
            return;
        };
        let ctx = &self.ctx;
        ctx.log_info("Stopping module...");
        ctx.stopping_token().cancel();

        let mut status = ctx.message();
        status.recipient = BROADCAST.to_string();
        status.command = STATUS.to_string();
        status.args = "0".to_string();
        ctx.send(&status).await;

        if let Err(message) = run_hook(ctx, "on_stop", self.module.on_stop(ctx)).await {
            error!(module = %ctx.fullname(), "{message}");
        }
        ctx.bus().disconnect().await;

        let abort = lifecycle.abort_handle();
        match tokio::time::timeout(ctx.config().timeouts.module_shutdown_timeout(), lifecycle).await {
            Ok(Ok(())) => debug!(module = %ctx.fullname(), "Lifecycle finished"),
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => error!(module = %ctx.fullname(), "Lifecycle task failed: {e}"),
            Err(_) => {
                warn!(module = %ctx.fullname(), "on_start() did not return in time, aborting");
                abort.abort();
            }
        }
    }
}

async fn run(module: Arc<dyn Module>, ctx: ModuleContext) {
    let build = ctx
        .build()
        .map(|build| format!(" (build {build})"))
        .unwrap_or_default();
    ctx.log_info(format!("Starting module{build}"));

    let on_overload: Option<OverloadHandler> = ctx.supervisor().cloned().map(|link| {
        let fullname = ctx.fullname().to_string();
        Arc::new(move || {
            link.request_overload_restart(&fullname);
        }) as OverloadHandler
    });
    let hooks = Arc::new(ModuleHooks {
        module: Arc::clone(&module),
        ctx: ctx.clone(),
    });
    let pool = ConsumerPool::start(
        ctx.bus().clone(),
        hooks,
        PoolLimits::from(ctx.config()),
        on_overload,
    );

    tokio::select! {
        () = ctx.stopped() => return,
        connected = ctx.bus().connect(pool) => if let Err(e) = connected {
            debug!(module = %ctx.fullname(), "Connection abandoned: {e}");
            return;
        },
    }

    ctx.add_request_listener("+/+", "+", "#").await;
    let mut status = ctx.message();
    status.recipient = BROADCAST.to_string();
    status.command = STATUS.to_string();
    status.args = "1".to_string();
    ctx.send(&status).await;

    if !ctx.is_configured() {
        debug!(module = %ctx.fullname(), "Waiting for configuration");
    }
    tokio::select! {
        () = ctx.stopped() => return,
        () = ctx.bus().wait_configured() => {}
    }

    info!(module = %ctx.fullname(), "Module started");
    if let Err(message) = run_hook(&ctx, "on_start", module.on_start(&ctx)).await {
        error!(module = %ctx.fullname(), "{message}");
    }
}

async fn run_hook<F>(ctx: &ModuleContext, hook: &str, call: F) -> Result<(), String>
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("runtime error during {hook}() in {}: {e:#}", ctx.fullname())),
        Err(_) => Err(format!("{hook}() panicked in {}", ctx.fullname())),
    }
}
