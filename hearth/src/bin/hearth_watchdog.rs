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

//! The `hearth-watchdog` binary: supervises the modules listed in
//! `HEARTH_MODULES` for the package described by the manifest.

use std::process;
use std::sync::Arc;

use hearth::common::{logging, CONFIG};
use hearth::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Answers `ECHO` requests with the request's payload.
#[derive(Debug, Default)]
struct Echo;

#[async_trait]
impl Module for Echo {
    async fn on_init(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        ctx.add_request_listener("+/+", "ECHO", "#").await;
        Ok(())
    }

    async fn on_start(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        ctx.stopped().await;
        Ok(())
    }

    async fn on_stop(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_message(&self, ctx: &ModuleContext, message: Message) -> anyhow::Result<()> {
        if message.command != "ECHO" {
            return Ok(());
        }
        let mut reply = message.reply();
        reply.sender = ctx.fullname().to_string();
        reply.house_id = ctx.house_id().to_string();
        ctx.send(&reply).await;
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (settings, ignored) = Settings::from_env_with_warnings();
    let _guard = logging::init(&settings, &CONFIG);
    for warning in ignored {
        warn!("{warning}");
    }

    let entries = parse_modules(settings.modules.as_deref().unwrap_or_default());
    let paths = &CONFIG.paths;
    let manifest = match Manifest::load(
        &paths.manifest,
        &paths.sdk_manifest,
        &paths.default_config_directory,
        &entries,
    ) {
        Ok(manifest) => manifest,
        Err(e) => {
            error!("Unable to load the package manifest: {e}");
            eprintln!("hearth-watchdog: {e}");
            process::exit(1);
        }
    };
    info!(package = %manifest.package(), version = %manifest.version_string(), "Manifest loaded");

    let mut factory = ModuleFactory::new();
    factory.register("echo", |_identity: &ModuleIdentity| Echo);

    let connector: Arc<dyn Connector> = Arc::new(MqttConnector::new(settings.clone()));
    let watchdog = Watchdog::new(
        manifest,
        entries,
        factory,
        connector,
        settings,
        CONFIG.clone(),
    );
    let handle = watchdog.launch().await;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {e}");
        }
        signal.cancel();
    });
    handle.run_until(shutdown).await;
    Ok(())
}
