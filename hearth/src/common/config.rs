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

use std::path::PathBuf;
use std::time::Duration;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::watchdog::RestartLimiterConfig;

/// Tunables for the Hearth SDK.
///
/// Loaded once from `$XDG_CONFIG_HOME/hearth/config.toml`; every missing key
/// falls back to its default. Runtime parameters that differ per deployment
/// (gateway, house, module list) live in [`Settings`](super::Settings) instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HearthConfig {
    /// Timeout and interval configuration
    pub timeouts: TimeoutConfig,
    /// Queue limits and worker counts
    pub limits: LimitsConfig,
    /// Restart limiting applied by the watchdog
    pub restart: RestartLimiterConfig,
    /// Filesystem locations
    pub paths: PathsConfig,
    /// Behavioral switches
    pub behavior: BehaviorConfig,
}

/// Timeout-related configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Pause between two broker connection attempts, in milliseconds
    pub connect_backoff_ms: u64,
    /// How long a module may take to wind down before its task is aborted, in milliseconds
    pub module_shutdown_timeout_ms: u64,
    /// How long a consumer worker waits on an empty queue before re-checking for shutdown
    pub worker_poll_ms: u64,
    /// Interval between two liveness rounds of the watchdog, in milliseconds
    pub ping_interval_ms: u64,
    /// Elapsed time after which an unanswered ping marks a module unreachable
    pub ping_timeout_ms: u64,
    /// Pause between starting two modules, in milliseconds
    pub start_stagger_ms: u64,
}

/// Queue limits and worker counts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Publishes kept while disconnected before the oldest is evicted
    pub offline_queue_capacity: usize,
    /// Configuration envelopes buffered while a module is unconfigured
    pub config_queue_capacity: usize,
    /// Consumer queue depth above which a warning is logged
    pub consumer_queue_warn_depth: usize,
    /// Consumer queue depth above which the module asks to be restarted
    pub consumer_queue_overload_depth: usize,
    /// Number of consumer workers per module
    pub consumer_workers: usize,
}

/// Path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Manifest of the package the watchdog manages
    pub manifest: PathBuf,
    /// Manifest of the SDK itself
    pub sdk_manifest: PathBuf,
    /// Root of the default configuration tree embedded in the manifest
    pub default_config_directory: PathBuf,
    /// Directory for log files
    pub log_directory: PathBuf,
}

/// Behavioral configuration switches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Write logs to a daily rolling file in `paths.log_directory`
    pub log_to_file: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_backoff_ms: 10_000,
            module_shutdown_timeout_ms: 10_000,
            worker_poll_ms: 1_000,
            ping_interval_ms: 30_000,
            ping_timeout_ms: 10_000,
            start_stagger_ms: 100,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            offline_queue_capacity: 300,
            config_queue_capacity: 500,
            consumer_queue_warn_depth: 100,
            consumer_queue_overload_depth: 500,
            consumer_workers: 1,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from("manifest.yml"),
            sdk_manifest: PathBuf::from("sdk/manifest.yml"),
            default_config_directory: PathBuf::from("default_config"),
            log_directory: PathBuf::from("logs"),
        }
    }
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self { log_to_file: false }
    }
}

impl TimeoutConfig {
    /// Pause between two connection attempts.
    #[must_use]
    pub const fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    /// Grace period granted to a stopping module.
    #[must_use]
    pub const fn module_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.module_shutdown_timeout_ms)
    }

    /// Idle wait of a consumer worker.
    #[must_use]
    pub const fn worker_poll(&self) -> Duration {
        Duration::from_millis(self.worker_poll_ms)
    }

    /// Interval between liveness rounds.
    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Deadline for a ping to be answered.
    #[must_use]
    pub const fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Pause between two module starts.
    #[must_use]
    pub const fn start_stagger(&self) -> Duration {
        Duration::from_millis(self.start_stagger_ms)
    }
}

impl HearthConfig {
    /// Load configuration from XDG-compliant locations
    ///
    /// Looks for `hearth/config.toml` under `$XDG_CONFIG_HOME` (then the XDG
    /// fallbacks). If no file is found, returns the defaults. If the file
    /// exists but is malformed, logs an error and uses the defaults.
    pub fn load() -> Self {
        use tracing::{error, info};

        let xdg_dirs = match xdg::BaseDirectories::with_prefix("hearth") {
            Ok(dirs) => dirs,
            Err(e) => {
                error!("Failed to initialize XDG directories: {}", e);
                return Self::default();
            }
        };

        let Some(path) = xdg_dirs.find_config_file("config.toml") else {
            info!("No configuration file found, using defaults");
            return Self::default();
        };

        info!("Loading configuration from: {}", path.display());
        match std::fs::read_to_string(&path) {
            Ok(config_str) => Self::from_toml(&config_str).unwrap_or_else(|e| {
                error!("Failed to parse configuration file {}: {}", path.display(), e);
                Self::default()
            }),
            Err(e) => {
                error!("Failed to read configuration file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Parses a configuration document.
    ///
    /// # Errors
    ///
    /// Returns the TOML error if the document is malformed.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

lazy_static! {
    /// Global configuration instance loaded from XDG-compliant locations
    pub static ref CONFIG: HearthConfig = HearthConfig::load();
}
