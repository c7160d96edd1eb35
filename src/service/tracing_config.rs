// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::{AppError, AppResult};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Builds the filter from `RUST_LOG`, falling back to `default_level` when it is unset.
fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Console-only tracing, used by tests and the client command.
pub fn setup_local_tracing() -> AppResult<()> {
    setup_local_tracing_with_level("info")
}

pub fn setup_local_tracing_with_level(default_level: &str) -> AppResult<()> {
    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(default_level))
        .try_init()
        .map_err(|e| AppError::TracingInit(e.to_string()))
}

/// Console plus an hourly rolling file under `log_dir`.
///
/// The returned guard flushes the background file writer when dropped, so keep it alive for
/// the lifetime of the process.
pub fn setup_tracing<P: AsRef<Path>>(log_dir: P, default_level: &str) -> AppResult<WorkerGuard> {
    let file_appender = tracing_appender::rolling::hourly(log_dir, "tablewire.log");
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);

    // write to both the console and the file
    let writer = non_blocking.and(std::io::stdout);

    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(default_level))
        .try_init()
        .map_err(|e| AppError::TracingInit(e.to_string()))?;

    Ok(worker_guard)
}
