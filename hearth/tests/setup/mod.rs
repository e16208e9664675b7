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

use hearth::message::topic;
use hearth::prelude::*;
use hearth::watchdog::RestartLimiterConfig;

pub use client::ScriptedClient;
pub use probe::{Probe, ProbeLog};

pub mod client;
pub mod probe;

pub const HOUSE: &str = "test_house";

/// Tunables shrunk so lifecycle tests finish quickly.
pub fn fast_config() -> HearthConfig {
    let mut config = HearthConfig::default();
    config.timeouts.connect_backoff_ms = 20;
    config.timeouts.module_shutdown_timeout_ms = 2_000;
    config.timeouts.worker_poll_ms = 20;
    config.timeouts.ping_interval_ms = 100;
    config.timeouts.ping_timeout_ms = 1_000;
    config.timeouts.start_stagger_ms = 5;
    config.restart = RestartLimiterConfig {
        initial_backoff_ms: 0,
        ..RestartLimiterConfig::default()
    };
    config
}

pub fn settings() -> Settings {
    Settings::local(HOUSE)
}

/// Launches `module` as `scope/name` on `broker`.
pub async fn launch<M: Module>(
    broker: &LocalBroker,
    scope: &str,
    name: &str,
    module: M,
    config: HearthConfig,
) -> ModuleHandle {
    let ctx = ModuleContext::builder(scope, name)
        .settings(settings())
        .config(config)
        .attach(broker.connector().as_ref());
    ModuleHandle::launch(Arc::new(module), ctx).await
}

/// Broker client id of module `scope/name` in the test house.
pub fn client_id(scope: &str, name: &str) -> String {
    format!("hearth-{HOUSE}-{scope}-{name}")
}

/// Waits until the module is connected and every listener it registered is
/// active on the broker.
pub async fn wait_connected(broker: &LocalBroker, ctx: &ModuleContext) -> bool {
    let ctx = ctx.clone();
    let identity = ctx.identity().clone();
    let id = client_id(&identity.scope, &identity.name);
    let requests = topic::build("+", "+/+", ctx.fullname(), "+", "#");
    let broker = broker.clone();
    hearth_test::wait_until(Duration::from_secs(5), move || {
        let wanted = ctx.bus().subscriptions();
        let active = broker.subscriptions(&id);
        ctx.is_connected()
            && wanted.contains(&requests)
            && wanted.iter().all(|p| active.contains(p))
    })
    .await
}

/// Builds and launches a supervisor for `modules` (a `package/file[=alias]` list).
pub async fn start_watchdog(
    broker: &LocalBroker,
    modules: &str,
    factory: ModuleFactory,
    config: HearthConfig,
) -> WatchdogHandle {
    let entries = parse_modules(modules);
    let mut manifest = manifest("sensors", &["sensors/temp"]);
    manifest.apply_aliases(&entries);
    let watchdog = Watchdog::new(
        manifest,
        entries,
        factory,
        broker.connector(),
        settings(),
        config,
    );
    watchdog.launch().await
}

/// A manifest for package `package` declaring `modules`.
pub fn manifest(package: &str, modules: &[&str]) -> Manifest {
    let modules: Vec<String> = modules.iter().map(|m| format!("  - {m}")).collect();
    let yaml = format!(
        "manifest_schema: 2\npackage: {package}\nrevision: 7\nversion: \"1.0\"\nbranch: main\ngithub: example/{package}\ndockerhub: example/{package}\nmodules:\n{}\n",
        modules.join("\n")
    );
    Manifest::parse(&yaml).expect("test manifest is valid")
}
