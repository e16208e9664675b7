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

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

/// A module the supervisor manages.
///
/// Entries are created once from the declarative module list and never
/// removed; only `started` and the liveness fields change.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleEntry {
    /// Package the module ships in; also its scope.
    pub package: String,
    /// Implementation name, resolved through the module factory.
    pub file: String,
    /// Scope on the bus.
    pub scope: String,
    /// Public name on the bus; the alias when one was given.
    pub name: String,
    /// `scope/name`.
    pub fullname: String,
    /// Whether the module is running.
    pub started: bool,
    /// When the last `PING` was sent.
    pub last_ping: Option<Instant>,
    /// A `PING` is waiting for its `PONG`.
    pub ping_pending: bool,
    /// Round-trip time of the last answered `PING`.
    pub rtt: Option<Duration>,
}

impl ModuleEntry {
    /// An entry for `package/file`, optionally published as `package/alias`.
    #[must_use]
    pub fn new(package: &str, file: &str, alias: Option<&str>) -> Self {
        let name = alias.unwrap_or(file);
        Self {
            package: package.to_string(),
            file: file.to_string(),
            scope: package.to_string(),
            name: name.to_string(),
            fullname: format!("{package}/{name}"),
            started: false,
            last_ping: None,
            ping_pending: false,
            rtt: None,
        }
    }

    /// `package/file`, the name the module is declared under in the manifest.
    #[must_use]
    pub fn declared_name(&self) -> String {
        format!("{}/{}", self.package, self.file)
    }

    /// Returns `true` if the module was published under an alias.
    #[must_use]
    pub fn is_aliased(&self) -> bool {
        self.name != self.file
    }

    /// Returns `true` if a ping has been outstanding for longer than `timeout`.
    #[must_use]
    pub fn is_unreachable(&self, now: Instant, timeout: Duration) -> bool {
        self.ping_pending
            && self
                .last_ping
                .is_some_and(|sent| now.saturating_duration_since(sent) > timeout)
    }

    /// Records a `PING` sent at `now`.
    pub fn ping_sent(&mut self, now: Instant) {
        self.last_ping = Some(now);
        self.ping_pending = true;
    }

    /// Records a `PONG` received at `now`; returns the round-trip time if a
    /// ping was outstanding.
    pub fn pong_received(&mut self, now: Instant) -> Option<Duration> {
        if !self.ping_pending {
            return None;
        }
        let rtt = now.saturating_duration_since(self.last_ping?);
        self.ping_pending = false;
        self.rtt = Some(rtt);
        Some(rtt)
    }

    /// Forgets liveness state, e.g. after the module stopped.
    pub fn reset_liveness(&mut self) {
        self.last_ping = None;
        self.ping_pending = false;
    }
}

/// The live view of an entry published in `DISCOVER` responses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleStatus {
    /// Package name.
    pub package: String,
    /// Implementation name.
    pub file: String,
    /// Scope on the bus.
    pub scope: String,
    /// Name on the bus.
    pub name: String,
    /// `scope/name`.
    pub fullname: String,
    /// Whether the module is running.
    pub started: bool,
    /// Last round-trip time in seconds.
    pub ping: Option<f64>,
    /// Runtime debug flag.
    pub debug: bool,
    /// Version stamped at start.
    pub version: Option<String>,
    /// Build identifier stamped at start.
    pub build: Option<String>,
    /// Whether the module finished its configuration handshake.
    pub configured: bool,
}

/// Parses a declarative module list: `package/file[=alias]`, comma separated.
///
/// Whitespace is ignored. Invalid entries are logged and skipped.
#[must_use]
pub fn parse_modules(input: &str) -> Vec<ModuleEntry> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    compact
        .split(',')
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let (package_file, alias) = match entry.split_once('=') {
                Some((package_file, alias)) if !alias.is_empty() => (package_file, Some(alias)),
                Some((package_file, _)) => (package_file, None),
                None => (entry, None),
            };
            match package_file.split_once('/') {
                Some((package, file))
                    if !package.is_empty() && !file.is_empty() && !file.contains('/') =>
                {
                    Some(ModuleEntry::new(package, file, alias))
                }
                _ => {
                    warn!("Skipping invalid module {entry}");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases_and_ignores_whitespace() {
        let entries = parse_modules(" sensors/temp = livingroom,\tcontroller/hub ");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].fullname, "sensors/livingroom");
        assert_eq!(entries[0].file, "temp");
        assert_eq!(entries[0].declared_name(), "sensors/temp");
        assert!(entries[0].is_aliased());
        assert_eq!(entries[1].fullname, "controller/hub");
        assert!(!entries[1].is_aliased());
    }

    #[test]
    fn skips_invalid_entries() {
        let entries = parse_modules("justafile,a/b/c,/x,ok/module,,");
        let names: Vec<_> = entries.iter().map(|e| e.fullname.as_str()).collect();
        assert_eq!(names, ["ok/module"]);
    }

    #[test]
    fn liveness_uses_elapsed_time() {
        let mut entry = ModuleEntry::new("sensors", "temp", None);
        let sent = Instant::now();
        entry.ping_sent(sent);
        assert!(!entry.is_unreachable(sent + Duration::from_secs(5), Duration::from_secs(10)));
        assert!(entry.is_unreachable(sent + Duration::from_secs(11), Duration::from_secs(10)));

        let rtt = entry.pong_received(sent + Duration::from_millis(40));
        assert_eq!(rtt, Some(Duration::from_millis(40)));
        assert!(!entry.is_unreachable(sent + Duration::from_secs(60), Duration::from_secs(10)));
        assert_eq!(entry.pong_received(sent + Duration::from_secs(1)), None);
    }
}
