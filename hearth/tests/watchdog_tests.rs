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

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use hearth::message::topic;
use hearth::prelude::*;
use hearth::watchdog::runtime_signature;
use hearth_test::prelude::*;
use serde_json::{json, Value};

use crate::setup::{
    client_id, fast_config, settings, start_watchdog, wait_connected, Probe, ProbeLog,
    ScriptedClient, HOUSE,
};

mod setup;

const LIVINGROOM: &str = "sensors/livingroom";
const REPLY_WINDOW: Duration = Duration::from_millis(300);

fn thermometer_factory(probe: Probe) -> ModuleFactory {
    let mut factory = ModuleFactory::new();
    factory.register("temp", move |_identity: &ModuleIdentity| probe.clone());
    factory
}

fn snapshot_entry(statuses: &[ModuleStatus], fullname: &str) -> Option<ModuleStatus> {
    statuses.iter().find(|status| status.fullname == fullname).cloned()
}

async fn status_of(handle: &WatchdogHandle, fullname: &str) -> Option<ModuleStatus> {
    snapshot_entry(&handle.snapshot().await, fullname)
}

async fn wait_started(handle: &WatchdogHandle, fullname: &str, started: bool) -> bool {
    wait_for_value(DEFAULT_WAIT, move || async move {
        status_of(handle, fullname)
            .await
            .filter(|status| status.started == started)
    })
    .await
    .is_some()
}

fn discovered(reply: &Message) -> Vec<Value> {
    reply
        .get_data()
        .and_then(|data| data.as_array().cloned())
        .unwrap_or_default()
}

async fn discover(observer: &mut ScriptedClient, args: &str) -> Vec<Message> {
    observer.send(BROADCAST, DISCOVER, args, None).await;
    observer
        .collect_matching(REPLY_WINDOW, |message| {
            message.command == DISCOVER && message.args == "res"
        })
        .await
}

#[hearth_test]
async fn fleet_is_announced_discovered_and_configured() -> anyhow::Result<()> {
    let broker = LocalBroker::new();
    let mut observer = ScriptedClient::connect(&broker, HOUSE, "ops/observer").await;
    observer.listen("+/+", BROADCAST, STATUS).await;
    observer.listen("system/+", "ops/observer", DISCOVER).await;

    let probe = Probe::new().requiring(LIVINGROOM);
    let log = Arc::clone(&probe.log);
    let handle = start_watchdog(
        &broker,
        "sensors/temp=livingroom",
        thermometer_factory(probe),
        fast_config(),
    )
    .await;
    let watchdog_name = handle.context().fullname().to_string();
    assert_eq!(
        watchdog_name,
        format!("system/watchdog-sensors-{}", runtime_signature(&settings()))
    );

    let mut announced = Vec::new();
    while announced.len() < 2 {
        let status = observer
            .next_matching(DEFAULT_WAIT, |message| {
                message.command == STATUS && message.args == "1"
            })
            .await
            .expect("missing STATUS announcement");
        announced.push(status.sender);
    }
    announced.sort();
    assert_eq!(announced, [LIVINGROOM.to_string(), watchdog_name.clone()]);
    assert!(wait_started(&handle, LIVINGROOM, true).await);
    assert!(wait_connected(&broker, handle.context()).await);

    let replies = discover(&mut observer, "*").await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].sender, watchdog_name);
    let modules = discovered(&replies[0]);
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0]["fullname"], json!(LIVINGROOM));
    assert_eq!(modules[0]["file"], json!("temp"));
    assert_eq!(modules[0]["started"], json!(true));
    assert_eq!(modules[0]["configured"], json!(false));
    assert!(!log.is_started());

    let authority = ScriptedClient::connect(&broker, HOUSE, CONFIG_AUTHORITY).await;
    authority.configure(LIVINGROOM, json!({ "unit": "C" }), false).await;
    assert!(wait_until(DEFAULT_WAIT, || log.is_started()).await);

    let replies = discover(&mut observer, "*").await;
    assert_eq!(replies.len(), 1);
    assert_eq!(discovered(&replies[0])[0]["configured"], json!(true));

    handle.stop().await;
    Ok(())
}

#[hearth_test]
async fn discovery_can_target_one_module() -> anyhow::Result<()> {
    let broker = LocalBroker::new();
    let handle = start_watchdog(
        &broker,
        "sensors/temp=livingroom,sensors/temp=bedroom",
        thermometer_factory(Probe::new()),
        fast_config(),
    )
    .await;
    assert!(wait_started(&handle, "sensors/bedroom", true).await);
    assert!(wait_connected(&broker, handle.context()).await);

    let mut observer = ScriptedClient::connect(&broker, HOUSE, "ops/observer").await;
    observer.listen("system/+", "ops/observer", DISCOVER).await;

    let everything = discover(&mut observer, "*").await;
    assert_eq!(everything.len(), 1);
    assert_eq!(discovered(&everything[0]).len(), 2);

    let targeted = discover(&mut observer, "sensors/bedroom").await;
    assert_eq!(targeted.len(), 1);
    let modules = discovered(&targeted[0]);
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0]["name"], json!("bedroom"));

    assert!(discover(&mut observer, "sensors/attic").await.is_empty());
    handle.stop().await;
    Ok(())
}

#[hearth_test]
async fn control_commands_drive_the_fleet() -> anyhow::Result<()> {
    let broker = LocalBroker::new();
    let probe = Probe::new();
    let log: Arc<ProbeLog> = Arc::clone(&probe.log);
    let handle = start_watchdog(
        &broker,
        "sensors/temp=livingroom",
        thermometer_factory(probe),
        fast_config(),
    )
    .await;
    assert!(wait_started(&handle, LIVINGROOM, true).await);
    assert!(wait_connected(&broker, handle.context()).await);
    assert!(wait_until(DEFAULT_WAIT, || log.connects.load(Ordering::SeqCst) == 1).await);
    let watchdog_name = handle.context().fullname().to_string();
    let module_client = client_id("sensors", "livingroom");
    let operator = ScriptedClient::connect(&broker, HOUSE, "ops/operator").await;

    operator.send(&watchdog_name, STOP, LIVINGROOM, None).await;
    assert!(wait_started(&handle, LIVINGROOM, false).await);
    assert!(log.stopped.load(Ordering::SeqCst));
    assert!(!broker.is_connected(&module_client));

    operator.send(&watchdog_name, START, LIVINGROOM, None).await;
    assert!(wait_started(&handle, LIVINGROOM, true).await);
    assert!(wait_until(DEFAULT_WAIT, || log.connects.load(Ordering::SeqCst) == 2).await);

    operator.send(&watchdog_name, RESTART, LIVINGROOM, None).await;
    assert!(wait_until(DEFAULT_WAIT, || log.connects.load(Ordering::SeqCst) == 3).await);
    assert!(wait_started(&handle, LIVINGROOM, true).await);

    operator
        .send(&watchdog_name, DEBUG, LIVINGROOM, Some(json!("1")))
        .await;
    let watchdog = &handle;
    let debugging = wait_for_value(DEFAULT_WAIT, move || async move {
        status_of(watchdog, LIVINGROOM).await.filter(|status| status.debug)
    })
    .await;
    assert!(debugging.is_some());

    // unknown targets are ignored
    operator.send(&watchdog_name, STOP, "sensors/attic", None).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(status_of(&handle, LIVINGROOM).await.is_some_and(|s| s.started));

    handle.stop().await;
    assert!(!broker.is_connected(&module_client));
    Ok(())
}

#[hearth_test]
async fn operator_restarts_are_never_rate_limited() -> anyhow::Result<()> {
    let broker = LocalBroker::new();
    let mut config = fast_config();
    config.restart.max_restarts = 1;
    let probe = Probe::new();
    let log = Arc::clone(&probe.log);
    let handle = start_watchdog(
        &broker,
        "sensors/temp=livingroom",
        thermometer_factory(probe),
        config,
    )
    .await;
    assert!(wait_started(&handle, LIVINGROOM, true).await);
    assert!(wait_connected(&broker, handle.context()).await);
    assert!(wait_until(DEFAULT_WAIT, || log.connects.load(Ordering::SeqCst) == 1).await);

    let watchdog_name = handle.context().fullname().to_string();
    let operator = ScriptedClient::connect(&broker, HOUSE, "ops/operator").await;
    for round in 2..=4 {
        operator.send(&watchdog_name, RESTART, LIVINGROOM, None).await;
        assert!(
            wait_until(DEFAULT_WAIT, || log.connects.load(Ordering::SeqCst) == round).await,
            "restart {round} was refused"
        );
    }
    assert!(wait_started(&handle, LIVINGROOM, true).await);
    handle.stop().await;
    Ok(())
}

#[hearth_test]
async fn overload_restarts_past_the_limit_stop_the_module() -> anyhow::Result<()> {
    let broker = LocalBroker::new();
    let mut config = fast_config();
    config.restart.max_restarts = 1;
    let probe = Probe::new();
    let log = Arc::clone(&probe.log);
    let handle = start_watchdog(
        &broker,
        "sensors/temp=livingroom",
        thermometer_factory(probe),
        config,
    )
    .await;
    assert!(wait_started(&handle, LIVINGROOM, true).await);
    assert!(wait_until(DEFAULT_WAIT, || log.connects.load(Ordering::SeqCst) == 1).await);

    let link = handle.watchdog().link();
    assert!(link.request_overload_restart(LIVINGROOM));
    assert!(wait_until(DEFAULT_WAIT, || log.connects.load(Ordering::SeqCst) == 2).await);

    assert!(link.request_overload_restart(LIVINGROOM));
    assert!(wait_started(&handle, LIVINGROOM, false).await);
    assert_eq!(log.connects.load(Ordering::SeqCst), 2);
    assert!(!broker.is_connected(&client_id("sensors", "livingroom")));

    handle.stop().await;
    Ok(())
}

#[hearth_test]
async fn stalled_module_is_restarted_when_its_queue_overflows() -> anyhow::Result<()> {
    let broker = LocalBroker::new();
    let mut config = fast_config();
    config.timeouts.module_shutdown_timeout_ms = 300;
    config.limits.consumer_queue_warn_depth = 2;
    config.limits.consumer_queue_overload_depth = 4;
    let probe = Probe::new().stalling_on("HANG");
    let log = Arc::clone(&probe.log);
    let handle = start_watchdog(
        &broker,
        "sensors/temp=livingroom",
        thermometer_factory(probe),
        config,
    )
    .await;
    assert!(wait_started(&handle, LIVINGROOM, true).await);
    assert!(wait_connected(&broker, handle.context()).await);
    let module_client = client_id("sensors", "livingroom");
    let requests = topic::build("+", "+/+", LIVINGROOM, "+", "#");
    assert!(
        wait_until(DEFAULT_WAIT, || {
            log.connects.load(Ordering::SeqCst) == 1
                && broker.subscriptions(&module_client).contains(&requests)
        })
        .await
    );

    let kitchen = ScriptedClient::connect(&broker, HOUSE, "sensors/kitchen").await;
    kitchen.send(LIVINGROOM, "HANG", "forever", None).await;
    assert!(wait_until(DEFAULT_WAIT, || log.stalled.load(Ordering::SeqCst) == 1).await);
    for reading in 0..10 {
        kitchen
            .send(LIVINGROOM, "NOTE", "temperature", Some(json!(reading)))
            .await;
    }

    assert!(wait_until(DEFAULT_WAIT, || log.connects.load(Ordering::SeqCst) >= 2).await);
    assert!(wait_started(&handle, LIVINGROOM, true).await);
    assert!(log.disconnects.load(Ordering::SeqCst) >= 1);

    let mut observer = ScriptedClient::connect(&broker, HOUSE, "ops/observer").await;
    observer.listen("system/+", "ops/observer", DISCOVER).await;
    let replies = discover(&mut observer, "*").await;
    assert_eq!(replies.len(), 1);
    assert_eq!(discovered(&replies[0])[0]["started"], json!(true));

    handle.stop().await;
    Ok(())
}

#[hearth_test]
async fn liveness_round_records_round_trip_time() -> anyhow::Result<()> {
    let broker = LocalBroker::new();
    let handle = start_watchdog(
        &broker,
        "sensors/temp=livingroom",
        thermometer_factory(Probe::new()),
        fast_config(),
    )
    .await;

    let watchdog = &handle;
    let rtt = wait_for_value(DEFAULT_WAIT, move || async move {
        status_of(watchdog, LIVINGROOM).await.and_then(|status| status.ping)
    })
    .await
    .expect("no round-trip time recorded");
    assert!(rtt >= 0.0);
    handle.stop().await;
    Ok(())
}

#[hearth_test]
async fn manifest_is_retained_while_running() -> anyhow::Result<()> {
    let broker = LocalBroker::new();
    let handle = start_watchdog(
        &broker,
        "sensors/temp=livingroom",
        thermometer_factory(Probe::new()),
        fast_config(),
    )
    .await;
    let manifest_topic = topic::build(
        HOUSE,
        handle.context().fullname(),
        BROADCAST,
        MANIFEST,
        "sensors",
    );

    assert!(wait_until(DEFAULT_WAIT, || broker.retained(&manifest_topic).is_some()).await);
    let payload = broker.retained(&manifest_topic).unwrap_or_default();
    let manifest = Message::parse(&manifest_topic, &payload, true)?;
    assert_eq!(manifest.get("package"), Some(json!("sensors")));
    assert_eq!(manifest.get("modules"), Some(json!([LIVINGROOM])));

    handle.stop().await;
    assert!(broker.retained(&manifest_topic).is_none());
    Ok(())
}

#[hearth_test]
async fn unknown_implementations_stay_stopped() -> anyhow::Result<()> {
    let broker = LocalBroker::new();
    let handle = start_watchdog(
        &broker,
        "sensors/ghost,sensors/temp=livingroom",
        thermometer_factory(Probe::new()),
        fast_config(),
    )
    .await;

    assert!(wait_started(&handle, LIVINGROOM, true).await);
    let ghost = status_of(&handle, "sensors/ghost").await.expect("ghost is listed");
    assert!(!ghost.started);
    assert_eq!(ghost.ping, None);
    handle.stop().await;
    Ok(())
}
