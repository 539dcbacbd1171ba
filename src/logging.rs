//! Structured logging setup using `tracing-subscriber` and `tracing-appender`.
//!
//! The daemon path gets a JSON file layer with daily rotation plus a
//! human-readable console layer; one-shot CLI subcommands get console only.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// File name prefix for rotated log files.
const LOG_FILE_PREFIX: &str = "sortinghat.log";

/// Keeps the non-blocking file writer alive.
///
/// Dropping the guard flushes pending entries and closes the file, so the
/// caller must hold it for the lifetime of the process.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Initialise full logging for long-running operation.
///
/// JSON logs go to `{logs_dir}/sortinghat.log.YYYY-MM-DD`; console output
/// goes to stderr, filtered by `RUST_LOG` (default `info`).
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created.
pub fn init_production(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!(
            "failed to create logs directory {}: {e}",
            logs_dir.display()
        )
    })?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(default_env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(LoggingGuard { _guard: guard })
}

/// Initialise console-only logging for one-shot subcommands.
///
/// Controlled by `RUST_LOG` (default `info`). No file layer, no rotation.
pub fn init_cli() {
    tracing_subscriber::fmt()
        .with_env_filter(default_env_filter())
        .with_writer(std::io::stderr)
        .init();
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
