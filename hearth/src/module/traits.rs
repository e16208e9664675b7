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

use async_trait::async_trait;

use super::ModuleContext;
use crate::bus::ConfigurationVerdict;
use crate::message::Message;

/// The contract every module implements.
///
/// Hooks take `&self`: the lifecycle task runs [`on_start`](Self::on_start)
/// while consumer workers call the message and configuration hooks, so any
/// state a module keeps needs interior mutability (a `parking_lot::Mutex`,
/// atomics, or a `tokio::sync` primitive when it must be held across an
/// `.await`).
///
/// Errors returned from a hook, and panics raised inside one, are logged with
/// the module's name and never stop the module.
///
/// # Example
///
/// ```rust,ignore
/// struct Thermometer {
///     readings: AtomicU64,
/// }
///
/// #[async_trait]
/// impl Module for Thermometer {
///     async fn on_init(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
///         ctx.add_configuration_listener(ctx.fullname(), Some(1), true).await;
///         Ok(())
///     }
///
///     async fn on_start(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
///         while ctx.sleep(Duration::from_secs(60)).await {
///             self.readings.fetch_add(1, Ordering::Relaxed);
///         }
///         Ok(())
///     }
///
///     async fn on_stop(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
///         Ok(())
///     }
///
///     async fn on_message(&self, _ctx: &ModuleContext, _message: Message) -> anyhow::Result<()> {
///         Ok(())
///     }
///
///     async fn on_configuration(
///         &self,
///         ctx: &ModuleContext,
///         message: &Message,
///     ) -> anyhow::Result<ConfigurationVerdict> {
///         let valid = message
///             .get_data()
///             .is_some_and(|data| ctx.is_valid_configuration(&["unit"], &data));
///         Ok(if valid { ConfigurationVerdict::Accepted } else { ConfigurationVerdict::Rejected })
///     }
/// }
/// ```
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Called once before the module connects. Register listeners here.
    async fn on_init(&self, ctx: &ModuleContext) -> anyhow::Result<()>;

    /// The module's main behavior, run once it is configured. Usually loops
    /// until [`ModuleContext::is_stopping`] turns true.
    async fn on_start(&self, ctx: &ModuleContext) -> anyhow::Result<()>;

    /// Teardown, run after the module announced it is going down.
    async fn on_stop(&self, ctx: &ModuleContext) -> anyhow::Result<()>;

    /// An ordinary envelope matching one of the module's listeners.
    async fn on_message(&self, ctx: &ModuleContext, message: Message) -> anyhow::Result<()>;

    /// A configuration envelope from the configuration authority.
    async fn on_configuration(
        &self,
        ctx: &ModuleContext,
        message: &Message,
    ) -> anyhow::Result<ConfigurationVerdict>;

    /// The bus connection came up.
    async fn on_connect(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// The bus connection went down.
    async fn on_disconnect(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }
}
