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

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Hearth
//!
//! An SDK for long-running modules that collaborate over a shared
//! publish/subscribe bus, plus the watchdog that supervises them.
//!
//! ## Key Concepts
//!
//! - **Messages (`Message`)**: envelopes addressed `scope/name` to
//!   `scope/name`, carried on topics of the form
//!   `hearth/v1/<house>/<sender>/<recipient>/<command>/<args>`.
//! - **Bus (`BusClient`)**: one connection per module with retrying connect,
//!   an offline queue, the configuration handshake and a worker pool that
//!   feeds the module's hooks.
//! - **Modules (`Module`, `ModuleContext`, `ModuleHandle`)**: the lifecycle
//!   contract a module implements and the context it is handed.
//! - **Watchdog (`Watchdog`)**: starts the modules of a package, publishes
//!   its manifest, answers discovery, pings the fleet and restarts modules
//!   on request or overload.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hearth::prelude::*;
//!
//! let broker = LocalBroker::new();
//! let ctx = ModuleContext::builder("sensors", "temp").attach(broker.connector().as_ref());
//! let handle = ModuleHandle::launch(Arc::new(Thermometer::default()), ctx).await;
//! ```

/// The pub/sub client, its transports and the consumer workers.
pub mod bus;

/// Settings, tunables, logging and the session registry.
pub mod common;

/// The message envelope and topic protocol.
pub mod message;

/// The module contract and runtime.
pub mod module;

/// The supervisor.
pub mod watchdog;

/// Commonly used items.
pub mod prelude {
    pub use async_trait::async_trait;

    pub use crate::bus::{
        BusClient, BusError, ConfigurationVerdict, Connector, LocalBroker, MqttConnector,
    };
    pub use crate::common::{HearthConfig, Settings, CONFIG};
    pub use crate::message::*;
    pub use crate::module::{Module, ModuleContext, ModuleHandle, ModuleIdentity, Severity};
    pub use crate::watchdog::{
        parse_modules, Manifest, ModuleEntry, ModuleFactory, ModuleStatus, Watchdog,
        WatchdogHandle,
    };
}
