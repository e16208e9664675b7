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

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Prefix shared by every environment variable the SDK reads.
pub const ENV_PREFIX: &str = "HEARTH_";

/// Network transport used to reach the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayTransport {
    /// Plain MQTT over TCP.
    Tcp,
    /// MQTT over WebSocket.
    Websockets,
}

impl fmt::Display for GatewayTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Websockets => write!(f, "websockets"),
        }
    }
}

impl FromStr for GatewayTransport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "websockets" | "websocket" | "ws" => Ok(Self::Websockets),
            other => Err(format!("unknown gateway transport '{other}'")),
        }
    }
}

/// Runtime parameters sourced from the environment.
///
/// Every module of a process shares the same `Settings`. Use
/// [`Settings::from_env`] in binaries and [`Settings::local`] (plus struct
/// update syntax) in tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Broker host name.
    pub gateway_hostname: String,
    /// Broker port.
    pub gateway_port: u16,
    /// Broker transport.
    pub gateway_transport: GatewayTransport,
    /// Wrap the transport in TLS.
    pub gateway_ssl: bool,
    /// CA certificate used to verify the broker.
    pub gateway_ca_cert: Option<PathBuf>,
    /// Client certificate for mutual TLS.
    pub gateway_certfile: Option<PathBuf>,
    /// Client key for mutual TLS.
    pub gateway_keyfile: Option<PathBuf>,
    /// Installation identifier, also the broker user name.
    pub house_id: String,
    /// Installation passcode, also the broker password.
    pub house_passcode: String,
    /// Declarative module list of the watchdog (`package/file[=alias],...`).
    pub modules: Option<String>,
    /// Start every module with its debug flag on.
    pub debug: bool,
    /// Log every inbound and outbound envelope.
    pub verbose: bool,
    /// Print log lines on stdout.
    pub logging_local: bool,
    /// Ship log lines to the remote logger module.
    pub logging_remote: bool,
    /// Ask the broker to keep the session across reconnects.
    pub persistent_client: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gateway_hostname: "hearth-gateway".to_string(),
            gateway_port: 443,
            gateway_transport: GatewayTransport::Websockets,
            gateway_ssl: false,
            gateway_ca_cert: None,
            gateway_certfile: None,
            gateway_keyfile: None,
            house_id: "default_house".to_string(),
            house_passcode: String::new(),
            modules: None,
            debug: false,
            verbose: false,
            logging_local: true,
            logging_remote: true,
            persistent_client: false,
        }
    }
}

impl Settings {
    /// Reads the settings from `HEARTH_*` environment variables.
    ///
    /// Unset or unparsable variables keep their default; the latter are
    /// reported with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), but hands the warnings back instead
    /// of logging them, for callers that install logging from these settings.
    #[must_use]
    pub fn from_env_with_warnings() -> (Self, Vec<String>) {
        Self::from_lookup_with_warnings(|key| env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let (settings, warnings) = Self::from_lookup_with_warnings(lookup);
        for warning in warnings {
            tracing::warn!("{warning}");
        }
        settings
    }

    /// Builds settings from an arbitrary key lookup, returning one message per
    /// ignored value.
    pub fn from_lookup_with_warnings(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> (Self, Vec<String>) {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty());
        let defaults = Self::default();
        let mut warnings = Vec::new();
        let settings = Self {
            gateway_hostname: get("GATEWAY_HOSTNAME").unwrap_or(defaults.gateway_hostname),
            gateway_port: parsed(
                get("GATEWAY_PORT"),
                "GATEWAY_PORT",
                defaults.gateway_port,
                &mut warnings,
            ),
            gateway_transport: parsed(
                get("GATEWAY_TRANSPORT"),
                "GATEWAY_TRANSPORT",
                defaults.gateway_transport,
                &mut warnings,
            ),
            gateway_ssl: flag(get("GATEWAY_SSL"), defaults.gateway_ssl),
            gateway_ca_cert: get("GATEWAY_CA_CERT").map(PathBuf::from),
            gateway_certfile: get("GATEWAY_CERTFILE").map(PathBuf::from),
            gateway_keyfile: get("GATEWAY_KEYFILE").map(PathBuf::from),
            house_id: get("ID").unwrap_or(defaults.house_id),
            house_passcode: get("PASSCODE").unwrap_or(defaults.house_passcode),
            modules: get("MODULES"),
            debug: flag(get("DEBUG"), defaults.debug),
            verbose: flag(get("VERBOSE"), defaults.verbose),
            logging_local: flag(get("LOGGING_LOCAL"), defaults.logging_local),
            logging_remote: flag(get("LOGGING_REMOTE"), defaults.logging_remote),
            persistent_client: flag(get("PERSISTENT_CLIENT"), defaults.persistent_client),
        };
        (settings, warnings)
    }

    /// Settings for an in-process fleet: remote logging off, everything else default.
    #[must_use]
    pub fn local(house_id: impl Into<String>) -> Self {
        Self {
            house_id: house_id.into(),
            logging_remote: false,
            ..Self::default()
        }
    }
}

fn parsed<T: FromStr>(
    value: Option<String>,
    name: &str,
    default: T,
    warnings: &mut Vec<String>,
) -> T
where
    T::Err: fmt::Display,
{
    match value {
        Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warnings.push(format!("Ignoring {ENV_PREFIX}{name}={raw}: {e}"));
            default
        }),
        None => default,
    }
}

// Accepts 0/1 like the deployment scripts, plus true/false.
fn flag(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(str::trim) {
        Some("1" | "true" | "TRUE" | "True" | "yes") => true,
        Some("0" | "false" | "FALSE" | "False" | "no") => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(Settings::from_lookup(|_| None), Settings::default());
    }

    #[test]
    fn variables_override_defaults() {
        let settings = Settings::from_lookup(lookup(&[
            ("HEARTH_GATEWAY_HOSTNAME", "broker.local"),
            ("HEARTH_GATEWAY_PORT", "1883"),
            ("HEARTH_GATEWAY_TRANSPORT", "tcp"),
            ("HEARTH_GATEWAY_SSL", "1"),
            ("HEARTH_ID", "house42"),
            ("HEARTH_MODULES", "sensors/temp=livingroom"),
            ("HEARTH_LOGGING_REMOTE", "0"),
        ]));
        assert_eq!(settings.gateway_hostname, "broker.local");
        assert_eq!(settings.gateway_port, 1883);
        assert_eq!(settings.gateway_transport, GatewayTransport::Tcp);
        assert!(settings.gateway_ssl);
        assert_eq!(settings.house_id, "house42");
        assert_eq!(settings.modules.as_deref(), Some("sensors/temp=livingroom"));
        assert!(!settings.logging_remote);
        assert!(settings.logging_local);
    }

    #[test]
    fn malformed_values_fall_back() {
        let settings = Settings::from_lookup(lookup(&[
            ("HEARTH_GATEWAY_PORT", "not-a-port"),
            ("HEARTH_GATEWAY_TRANSPORT", "carrier-pigeon"),
            ("HEARTH_DEBUG", "maybe"),
        ]));
        assert_eq!(settings.gateway_port, 443);
        assert_eq!(settings.gateway_transport, GatewayTransport::Websockets);
        assert!(!settings.debug);
    }

    #[test]
    fn ignored_values_are_reported_back() {
        let (settings, warnings) = Settings::from_lookup_with_warnings(lookup(&[
            ("HEARTH_GATEWAY_PORT", "not-a-port"),
            ("HEARTH_GATEWAY_TRANSPORT", "carrier-pigeon"),
            ("HEARTH_ID", "house42"),
        ]));
        assert_eq!(settings.house_id, "house42");
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].starts_with("Ignoring HEARTH_GATEWAY_PORT=not-a-port"));
        assert!(warnings[1].starts_with("Ignoring HEARTH_GATEWAY_TRANSPORT=carrier-pigeon"));
    }
}
