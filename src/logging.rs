//! Structured logging setup using `tracing-subscriber` and `tracing-appender`.
//!
//! `start` logs JSON lines to a daily-rotated file and readable lines to
//! stderr. Each poll tick runs inside a `poll` span carrying the loop name, so
//! every file record from a scheduler or dispatcher cycle is tagged with
//! `span.task`. One-shot subcommands log to stderr only.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when neither `RUST_LOG` nor `logging.level` is set.
pub const DEFAULT_DIRECTIVE: &str = "campaign_dispatch=info,sqlx=warn";

/// Rotated log file name prefix inside the logs directory.
pub const LOG_FILE_PREFIX: &str = "campaign-dispatch.log";

/// Holds the non-blocking writer guard for file logging.
///
/// Dropping it flushes pending log entries and closes the file, so it must be
/// held until the process exits.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Filter from `RUST_LOG`, else `directive`.
///
/// # Errors
///
/// Returns an error if `RUST_LOG` is unset and `directive` does not parse.
pub fn filter(directive: &str) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(directive)
            .map_err(|e| anyhow::anyhow!("invalid log filter {directive:?}: {e}")),
    }
}

/// Initialise logging for the `start` subcommand.
///
/// JSON records go to `{logs_dir}/campaign-dispatch.log.YYYY-MM-DD` with the
/// current span's fields attached; stderr gets the compact form.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created or the filter
/// directive is invalid.
pub fn init_production(logs_dir: &Path, directive: &str) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!(
            "failed to create logs directory {}: {e}",
            logs_dir.display()
        )
    })?;
    let env_filter = filter(directive)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_writer(non_blocking);

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(console_layer)
        .init();

    Ok(LoggingGuard { _guard: guard })
}

/// Initialise stderr-only logging for one-shot subcommands.
///
/// Defaults to `warn` so command output on stdout stays clean.
pub fn init_cli() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
