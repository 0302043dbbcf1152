//! Tracing setup for `sqlcheck check`.
//!
//! Diagnostics go to stderr and to one log file per invocation under the
//! application's `logs/` directory; stdout carries only check results. The
//! file layer records worker thread names and logs each closed
//! `execution_tree` span, so one tree's controls can be followed by `run_id`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use time::{OffsetDateTime, UtcOffset, format_description::FormatItem, macros::format_description};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

use crate::app_dirs;
use crate::config::LoggingSettings;

/// Environment variable overriding the configured filter directives.
pub const LOG_FILTER_ENV: &str = "SQLCHECK_LOG";
const DEFAULT_FILTER: &str = "warn,sqlcheck=info";
const LOG_FILE_PREFIX: &str = "sqlcheck_";
const LOG_FILE_EXTENSION: &str = ".log";

static LOG_FILE: OnceLock<(WorkerGuard, PathBuf)> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Log directory unavailable: {0}")]
    Dirs(#[from] app_dirs::AppDirError),
    #[error("Failed to read log directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to remove old log file {path}: {source}")]
    RemoveFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to format log filename time: {0}")]
    FormatTime(#[from] time::error::Format),
    #[error("Invalid log filter '{directives}': {source}")]
    Filter {
        directives: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("Failed to install global tracing subscriber: {0}")]
    SetGlobal(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Install the global subscriber and return this invocation's log file.
///
/// A second call returns the file chosen by the first.
pub fn init(settings: &LoggingSettings) -> Result<PathBuf, LoggingError> {
    if let Some((_, path)) = LOG_FILE.get() {
        return Ok(path.clone());
    }

    let filter = build_filter(
        std::env::var(LOG_FILTER_ENV).ok().as_deref(),
        settings.filter.as_deref(),
    )?;
    let dir = app_dirs::logs_dir()?;
    let started = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let file_name = log_file_name(started, std::process::id())?;
    let (file_writer, guard) = tracing_appender::non_blocking(rolling::never(&dir, &file_name));
    let pruned = prune_logs(&dir, &file_name, settings.retain_files)?;

    let timer = build_timer();
    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_timer(timer.clone())
        .with_writer(std::io::stderr);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_timer(timer)
        .with_writer(file_writer);
    tracing::subscriber::set_global_default(
        Registry::default()
            .with(filter)
            .with(stderr_layer)
            .with(file_layer),
    )?;

    let path = dir.join(&file_name);
    let _ = LOG_FILE.set((guard, path.clone()));
    tracing::debug!(path = %path.display(), pruned, "Logging initialized");
    Ok(path)
}

/// Directives in effect: the environment override, then the configured
/// filter, then the default. Blank values are skipped.
fn filter_directives<'a>(env: Option<&'a str>, configured: Option<&'a str>) -> &'a str {
    [env, configured]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|directives| !directives.is_empty())
        .unwrap_or(DEFAULT_FILTER)
}

fn build_filter(env: Option<&str>, configured: Option<&str>) -> Result<EnvFilter, LoggingError> {
    let directives = filter_directives(env, configured);
    EnvFilter::try_new(directives).map_err(|source| LoggingError::Filter {
        directives: directives.to_string(),
        source,
    })
}

/// `sqlcheck_<local time>_<pid>.log`; names sort in launch order.
fn log_file_name(started: OffsetDateTime, pid: u32) -> Result<String, LoggingError> {
    const NAME_FORMAT: &[FormatItem<'_>] =
        format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
    let stamp = started.format(NAME_FORMAT)?;
    Ok(format!("{LOG_FILE_PREFIX}{stamp}_{pid}{LOG_FILE_EXTENSION}"))
}

/// Delete the oldest runner logs so at most `retain` remain, never touching
/// `current` or files the runner did not write. Returns how many were removed.
fn prune_logs(dir: &Path, current: &str, retain: usize) -> Result<usize, LoggingError> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map_err(|source| LoggingError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with(LOG_FILE_PREFIX) && name.ends_with(LOG_FILE_EXTENSION))
        .filter(|name| name != current)
        .collect();
    names.sort();
    // The current file counts against the limit.
    let keep = retain.saturating_sub(1);
    let excess = names.len().saturating_sub(keep);
    for name in &names[..excess] {
        let path = dir.join(name);
        fs::remove_file(&path).map_err(|source| LoggingError::RemoveFile { path, source })?;
    }
    Ok(excess)
}

fn build_timer() -> fmt::time::OffsetTime<time::format_description::BorrowedFormatItem<'static>> {
    const DISPLAY_FORMAT: &[FormatItem<'static>] =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]");
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    fmt::time::OffsetTime::new(offset, DISPLAY_FORMAT.into())
}
