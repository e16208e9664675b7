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

//! Restart limiting for supervised modules.
//!
//! Restarts are counted in a sliding window; within the limit each restart
//! waits an exponentially growing backoff, past it the restart is refused.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for restart limiting and exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartLimiterConfig {
    /// When disabled, restarts are never refused and never delayed.
    pub enabled: bool,
    /// Restarts allowed within `window_secs`.
    pub max_restarts: u32,
    /// Sliding window in seconds.
    pub window_secs: u64,
    /// Delay before the first restart in a streak, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound of the delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Growth factor of the delay between consecutive restarts.
    pub backoff_multiplier: f64,
}

impl Default for RestartLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_restarts: 5,
            window_secs: 60,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RestartLimiterConfig {
    /// A configuration that lets every restart through immediately.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            max_restarts: 0,
            window_secs: 0,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            backoff_multiplier: 0.0,
        }
    }

    /// The sliding window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// A restart was refused because the module restarted too often.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("restart limit exceeded: {attempts} restarts (max {max_restarts}) in {window_secs} seconds")]
pub struct RestartLimitExceeded {
    /// Restarts already in the window.
    pub attempts: usize,
    /// Allowed restarts.
    pub max_restarts: u32,
    /// Window size in seconds.
    pub window_secs: u64,
}

/// Sliding-window restart counter of one module.
#[derive(Debug)]
pub struct RestartLimiter {
    config: RestartLimiterConfig,
    restarts: Vec<Instant>,
    streak: u32,
}

impl RestartLimiter {
    /// Creates a limiter with no restart history.
    #[must_use]
    pub const fn new(config: RestartLimiterConfig) -> Self {
        Self {
            config,
            restarts: Vec::new(),
            streak: 0,
        }
    }

    /// Records a restart if the window allows it and returns how long to wait
    /// before starting the module again.
    ///
    /// # Errors
    ///
    /// Returns [`RestartLimitExceeded`] when the window is full; nothing is
    /// recorded in that case.
    pub fn admit(&mut self) -> Result<Duration, RestartLimitExceeded> {
        if !self.config.enabled {
            return Ok(Duration::ZERO);
        }
        let now = Instant::now();
        let window = self.config.window();
        self.restarts.retain(|at| now.duration_since(*at) < window);
        if self.restarts.is_empty() {
            self.streak = 0;
        }
        if self.restarts.len() >= self.config.max_restarts as usize {
            return Err(RestartLimitExceeded {
                attempts: self.restarts.len(),
                max_restarts: self.config.max_restarts,
                window_secs: self.config.window_secs,
            });
        }
        self.restarts.push(now);
        let backoff = self.backoff_for(self.streak);
        self.streak = self.streak.saturating_add(1);
        Ok(backoff)
    }

    /// Restarts currently counted in the window.
    #[must_use]
    pub fn restarts_in_window(&self) -> usize {
        self.restarts.len()
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_sign_loss,
        clippy::cast_possible_truncation
    )]
    fn backoff_for(&self, streak: u32) -> Duration {
        let exponent = i32::try_from(streak).unwrap_or(i32::MAX);
        let millis = self.config.initial_backoff_ms as f64
            * self.config.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.config.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_restarts: u32) -> RestartLimiterConfig {
        RestartLimiterConfig {
            enabled: true,
            max_restarts,
            window_secs: 60,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn refuses_once_the_window_is_full() {
        let mut limiter = RestartLimiter::new(config(3));
        for _ in 0..3 {
            assert!(limiter.admit().is_ok());
        }
        let refused = limiter.admit().unwrap_err();
        assert_eq!(refused.attempts, 3);
        assert_eq!(refused.max_restarts, 3);
        assert_eq!(limiter.restarts_in_window(), 3);
        assert!(refused.to_string().contains("max 3"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut limiter = RestartLimiter::new(config(10));
        let delays: Vec<u64> = (0..6)
            .map(|_| limiter.admit().unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, [100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn disabled_limiter_never_refuses() {
        let mut limiter = RestartLimiter::new(RestartLimiterConfig::disabled());
        for _ in 0..100 {
            assert_eq!(limiter.admit(), Ok(Duration::ZERO));
        }
    }

    #[test]
    fn expired_restarts_leave_the_window() {
        let mut limiter = RestartLimiter::new(RestartLimiterConfig {
            window_secs: 0,
            ..config(1)
        });
        assert!(limiter.admit().is_ok());
        // a zero-length window forgets every restart immediately
        assert_eq!(limiter.admit(), Ok(Duration::from_millis(100)));
    }
}
