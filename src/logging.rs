//! Tracing setup for the service and the one-shot subcommands.
//!
//! Harvest runs are long and chatty, so the service keeps two sinks: a
//! compact console stream for operators watching the process, and a JSONL
//! file stream under `{storage_root}/logs` for after-the-fact digging into a
//! specific run (grep by `query_id`). Files rotate daily, matching the
//! cadence of the harvest schedule, and are named `harvest.<date>.jsonl`.
//!
//! One-shot subcommands (`trigger`, `schema`) log to the console only.

use std::io::IsTerminal;
use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
///
/// The pool and HTTP internals are noisy at info level during a harvest;
/// everything of interest is logged under the crate's own targets.
const DEFAULT_DIRECTIVES: &str = "info,sqlx=warn,hyper=warn,hyper_util=warn,reqwest=warn";

/// Keeps the file writer alive.
///
/// The JSONL sink writes through a background worker; dropping this guard
/// flushes whatever is still buffered, so it must live until process exit.
pub struct LogGuard {
    _file_writer: WorkerGuard,
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Initialise both sinks for the `start` subcommand.
///
/// Returns a [`LogGuard`] the caller must hold for the process lifetime.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created or the rolling
/// appender rejects it.
pub fn init_service(logs_dir: &Path) -> anyhow::Result<LogGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("harvest")
        .filename_suffix("jsonl")
        .build(logs_dir)
        .with_context(|| format!("failed to open log file under {}", logs_dir.display()))?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let file_sink = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(false)
        .with_writer(file_writer);
    let console_sink = tracing_subscriber::fmt::layer()
        .compact()
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter())
        .with(file_sink)
        .with(console_sink)
        .init();

    Ok(LogGuard {
        _file_writer: guard,
    })
}

/// Console-only logging for one-shot subcommands.
///
/// No file sink and no timestamps; the output is read once and thrown away.
pub fn init_cli() {
    tracing_subscriber::fmt()
        .compact()
        .without_time()
        .with_ansi(std::io::stderr().is_terminal())
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .init();
}
