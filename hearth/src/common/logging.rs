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

use std::sync::Once;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use super::{HearthConfig, Settings};

static INIT: Once = Once::new();

/// Installs the process-wide tracing subscriber.
///
/// The default level is `debug` when `settings.debug` is set and `info`
/// otherwise; `RUST_LOG` takes precedence. Stdout output follows
/// `settings.logging_local`, and a daily rolling file is written to
/// `config.paths.log_directory` when `config.behavior.log_to_file` is on.
///
/// Only the first call has any effect. Keep the returned guard alive for the
/// lifetime of the process so buffered file output is flushed on exit.
#[must_use]
pub fn init(settings: &Settings, config: &HearthConfig) -> Option<WorkerGuard> {
    let mut guard = None;
    INIT.call_once(|| {
        let default_level = if settings.debug { "debug" } else { "info" };
        let filter = || {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
        };

        let stdout_layer = settings.logging_local.then(|| {
            fmt::layer()
                .compact()
                .with_target(true)
                .with_line_number(settings.verbose)
                .with_filter(filter())
        });

        let file_layer = if config.behavior.log_to_file {
            match std::fs::create_dir_all(&config.paths.log_directory) {
                Ok(()) => {
                    let appender = RollingFileAppender::new(
                        Rotation::DAILY,
                        &config.paths.log_directory,
                        "hearth.log",
                    );
                    let (writer, worker_guard) = tracing_appender::non_blocking(appender);
                    guard = Some(worker_guard);
                    Some(
                        fmt::layer()
                            .with_ansi(false)
                            .with_writer(writer)
                            .with_filter(filter()),
                    )
                }
                Err(e) => {
                    eprintln!(
                        "unable to create log directory {}: {e}",
                        config.paths.log_directory.display()
                    );
                    None
                }
            }
        } else {
            None
        };

        if tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .try_init()
            .is_err()
        {
            eprintln!("a global tracing subscriber is already installed");
        }
    });
    guard
}
