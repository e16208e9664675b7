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

//! The supervisor managing a package's fleet of modules.

pub use control::{ControlRequest, RestartReason, SupervisorLink};
pub use factory::ModuleFactory;
pub use manifest::{compare_versions, load_default_config, Manifest, ManifestError, SUPPORTED_SCHEMA};
pub use registry::{parse_modules, ModuleEntry, ModuleStatus};
pub use restart_limiter::{RestartLimitExceeded, RestartLimiter, RestartLimiterConfig};
pub use signature::{runtime_signature, short_hash};
pub use supervisor::{Watchdog, WatchdogHandle, WATCHDOG_SCOPE};

mod control;
mod factory;
mod manifest;
mod registry;
mod restart_limiter;
mod signature;
mod supervisor;
