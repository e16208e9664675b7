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

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use hearth::prelude::*;
use parking_lot::Mutex;

/// Everything a [`Probe`] observed, shared with the test.
#[derive(Debug, Default)]
pub struct ProbeLog {
    pub messages: Mutex<Vec<Message>>,
    pub configurations: Mutex<Vec<Message>>,
    pub started: AtomicBool,
    pub stopped: AtomicBool,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub stalled: AtomicUsize,
}

impl ProbeLog {
    pub fn messages_with(&self, command: &str) -> Vec<Message> {
        self.messages
            .lock()
            .iter()
            .filter(|message| message.command == command)
            .cloned()
            .collect()
    }

    pub fn configuration_args(&self) -> Vec<String> {
        self.configurations
            .lock()
            .iter()
            .map(|message| message.args.clone())
            .collect()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// A module that records every hook invocation.
///
/// `required` configuration files must arrive before it starts; `rejected`
/// ones are refused by `on_configuration`; `optional` ones are listened for
/// without blocking start-up. `listeners` are extra `(from, to, command, args)`
/// subscriptions. A message whose command is `stall_on` never finishes handling.
#[derive(Debug, Default, Clone)]
pub struct Probe {
    pub log: Arc<ProbeLog>,
    pub required: Vec<String>,
    pub optional: Vec<String>,
    pub rejected: Vec<String>,
    pub listeners: Vec<(String, String, String, String)>,
    pub stall_on: Option<String>,
}

impl Probe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requiring(mut self, args: &str) -> Self {
        self.required.push(args.to_string());
        self
    }

    pub fn optional(mut self, args: &str) -> Self {
        self.optional.push(args.to_string());
        self
    }

    pub fn rejecting(mut self, args: &str) -> Self {
        self.rejected.push(args.to_string());
        self
    }

    pub fn stalling_on(mut self, command: &str) -> Self {
        self.stall_on = Some(command.to_string());
        self
    }

    pub fn listening(mut self, from: &str, to: &str, command: &str, args: &str) -> Self {
        self.listeners.push((
            from.to_string(),
            to.to_string(),
            command.to_string(),
            args.to_string(),
        ));
        self
    }
}

#[async_trait]
impl Module for Probe {
    async fn on_init(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        for args in &self.required {
            ctx.add_configuration_listener(args, None, true).await;
        }
        for args in self.optional.iter().chain(&self.rejected) {
            ctx.add_configuration_listener(args, None, false).await;
        }
        for (from, to, command, args) in &self.listeners {
            ctx.add_inspection_listener(from, to, command, args).await;
        }
        Ok(())
    }

    async fn on_start(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        self.log.started.store(true, Ordering::SeqCst);
        ctx.stopped().await;
        Ok(())
    }

    async fn on_stop(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        self.log.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn on_message(&self, _ctx: &ModuleContext, message: Message) -> anyhow::Result<()> {
        if message.command == "FAIL" {
            anyhow::bail!("asked to fail");
        }
        if message.command == "PANIC" {
            panic!("asked to panic");
        }
        if self.stall_on.as_deref() == Some(message.command.as_str()) {
            self.log.stalled.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
        self.log.messages.lock().push(message);
        Ok(())
    }

    async fn on_configuration(
        &self,
        _ctx: &ModuleContext,
        message: &Message,
    ) -> anyhow::Result<ConfigurationVerdict> {
        self.log.configurations.lock().push(message.clone());
        if self.rejected.contains(&message.args) {
            return Ok(ConfigurationVerdict::Rejected);
        }
        Ok(ConfigurationVerdict::Accepted)
    }

    async fn on_connect(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_disconnect(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        self.log.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
