//! `tracing` subscriber setup.
//!
//! Compact console output plus a daily-rotated file under the log
//! directory. The file layer is plain text or JSON lines.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::AppConfig;
use crate::constants::LOG_FILE_NAME;
use crate::error::{DuetError, DuetResult};

/// Flushes the file writer when dropped; hold it for the life of the process.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _worker: WorkerGuard,
}

fn filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// `level` accepts a bare level or a full directive such as
/// `"info,duet_realtime=debug"`; an unparsable value falls back to `info`.
/// Fails if a global subscriber is already set.
pub fn init_logging(level: &str, log_dir: &Path, json_output: bool) -> DuetResult<LogGuard> {
    std::fs::create_dir_all(log_dir)?;
    let (writer, worker) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME));

    let file_layer = if json_output {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_current_span(false)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter(level))
        .with(fmt::layer().compact())
        .with(file_layer)
        .try_init()
        .map_err(|e| DuetError::Internal(format!("logger already initialized: {e}")))?;

    tracing::info!(level, dir = %log_dir.display(), json = json_output, "logging ready");
    Ok(LogGuard { _worker: worker })
}

/// [`init_logging`] driven by the `[logging]` section; an empty
/// `directory` means the platform data directory.
pub fn init_from_config(config: &AppConfig) -> DuetResult<LogGuard> {
    let log_dir = config.effective_log_dir()?;
    init_logging(&config.logging.level, &log_dir, config.logging.json_output)
}

/// Console-only logger routed through the test harness writer.
/// Repeated calls are ignored.
pub fn init_console_logging(level: &str) {
    let _ = tracing_subscriber::registry()
        .with(filter(level))
        .with(fmt::layer().with_test_writer().compact())
        .try_init();
}
