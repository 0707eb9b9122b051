//! Logging stack (A2): a console layer plus the four rolling log files
//! named in spec.md §6 (`supervisor_log`, `_statistics`, `_module_event`,
//! `_debug_log`).
//!
//! Statistics lines (spec.md §6 "Statistics log line formats") and module
//! lifecycle events (`[START]`/`[STOP]`/`AutoDisabled`) are routed to their
//! dedicated files by `tracing` target rather than by level, since both are
//! ordinary `info!` calls from the scheduler's point of view.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tracing_subscriber::filter::{filter_fn, Targets};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const STATS_TARGET: &str = "trapsupd::stats";
pub const MODULE_EVENT_TARGET: &str = "trapsupd::module_event";

const LOG_DIR_MODE: u32 = 0o775;

/// Keeps the non-blocking file writers alive for the process lifetime.
/// Dropping this flushes and closes the underlying appenders.
pub struct LoggingGuards {
    _supervisor: tracing_appender::non_blocking::WorkerGuard,
    _statistics: tracing_appender::non_blocking::WorkerGuard,
    _module_event: tracing_appender::non_blocking::WorkerGuard,
    _debug: tracing_appender::non_blocking::WorkerGuard,
}

/// Create `<logs_path>/` and `<logs_path>/modules_logs/` with the
/// `0775`/fallback-on-`EACCES`-or-`ENOENT` rule from spec.md §6.
pub fn prepare_logs_dir(logs_path: &Path) -> std::io::Result<PathBuf> {
    match std::fs::DirBuilder::new()
        .recursive(true)
        .mode(LOG_DIR_MODE)
        .create(logs_path)
    {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied || e.kind() == std::io::ErrorKind::NotFound => {
            let fallback = std::env::temp_dir().join("trapsupd-logs");
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(LOG_DIR_MODE)
                .create(&fallback)?;
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(LOG_DIR_MODE)
                .create(fallback.join("modules_logs"))?;
            return Ok(fallback);
        }
        Err(e) => return Err(e),
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(LOG_DIR_MODE)
        .create(logs_path.join("modules_logs"))?;
    Ok(logs_path.to_path_buf())
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global tracing subscriber. Returns the logs directory
/// actually used (after any fallback) and the appender guards.
pub fn init(logs_path: &Path, verbose: bool) -> anyhow::Result<(PathBuf, LoggingGuards)> {
    let logs_dir = prepare_logs_dir(logs_path)?;

    let supervisor_file = open_append(&logs_dir.join("supervisor_log"))?;
    let statistics_file = open_append(&logs_dir.join("supervisor_log_statistics"))?;
    let module_event_file = open_append(&logs_dir.join("supervisor_log_module_event"))?;
    let debug_file = open_append(&logs_dir.join("supervisor_debug_log"))?;

    let (supervisor_writer, supervisor_guard) = tracing_appender::non_blocking(supervisor_file);
    let (statistics_writer, statistics_guard) = tracing_appender::non_blocking(statistics_file);
    let (module_event_writer, module_event_guard) = tracing_appender::non_blocking(module_event_file);
    let (debug_writer, debug_guard) = tracing_appender::non_blocking(debug_file);

    let is_ambient = |target: &str| target != STATS_TARGET && target != MODULE_EVENT_TARGET;

    let supervisor_layer = fmt::layer()
        .with_writer(supervisor_writer)
        .with_ansi(false)
        .with_filter(filter_fn(move |meta| is_ambient(meta.target())));

    let statistics_layer = fmt::layer()
        .with_writer(statistics_writer)
        .with_ansi(false)
        .without_time()
        .with_target(false)
        .with_level(false)
        .with_filter(filter_fn(|meta| meta.target() == STATS_TARGET));

    let module_event_layer = fmt::layer()
        .with_writer(module_event_writer)
        .with_ansi(false)
        .with_target(false)
        .with_filter(filter_fn(|meta| meta.target() == MODULE_EVENT_TARGET));

    let debug_layer = fmt::layer()
        .with_writer(debug_writer)
        .with_ansi(false)
        .with_filter(Targets::new().with_default(tracing::Level::DEBUG));

    let console_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "info" })
    });
    let console_layer = fmt::layer().with_filter(console_filter);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(supervisor_layer)
        .with(statistics_layer)
        .with(module_event_layer)
        .with(debug_layer)
        .init();

    Ok((
        logs_dir,
        LoggingGuards {
            _supervisor: supervisor_guard,
            _statistics: statistics_guard,
            _module_event: module_event_guard,
            _debug: debug_guard,
        },
    ))
}
