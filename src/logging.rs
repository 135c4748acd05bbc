#![forbid(unsafe_code)]

//! Subscriber setup shared by both binaries: human-readable lines on stderr,
//! optionally mirrored into a plain-text log file.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DEFAULT_FILTER: &str = "info";

/// Filter from `RUST_LOG`, falling back to `info` with a warning when the
/// variable holds something that does not parse.
fn env_filter() -> EnvFilter {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(err) => {
            if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
                eprintln!("WARN: RUST_LOG is not a valid tracing filter ({err}); falling back to 'info'");
            }
            EnvFilter::new(DEFAULT_FILTER)
        }
    }
}

/// Installs the global subscriber. With `log_file` set, every event is also
/// appended to that file; keep the returned guard alive until exit so buffered
/// lines are flushed.
pub fn init(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Creating log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string())),
        )
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!("installing tracing subscriber: {err}"))?;

    Ok(guard)
}
