use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound for `execution.max_parallel`; each unit holds a database session.
pub const MAX_PARALLEL_LIMIT: usize = 64;
const MAX_CANCEL_GRACE_SECONDS: u64 = 600;
const MAX_RETAINED_LOG_FILES: usize = 100;

/// Settings stored in `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub output: OutputSettings,
    #[serde(default)]
    pub dimensions: DimensionSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Settings {
    pub(crate) fn normalized(mut self) -> Self {
        self.execution.max_parallel = self.execution.max_parallel.clamp(1, MAX_PARALLEL_LIMIT);
        self.execution.cancel_grace_seconds = self
            .execution
            .cancel_grace_seconds
            .min(MAX_CANCEL_GRACE_SECONDS);
        self.logging.retain_files = self.logging.retain_files.clamp(1, MAX_RETAINED_LOG_FILES);
        self
    }
}

/// Concurrency and shutdown behaviour of a check run.
///
/// Config keys: `max_parallel`, `cancel_grace_seconds`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Maximum number of controls executing at once.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// How long in-flight controls may keep running after cancellation.
    #[serde(default = "default_cancel_grace_seconds")]
    pub cancel_grace_seconds: u64,
}

impl ExecutionSettings {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_seconds)
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            cancel_grace_seconds: default_cancel_grace_seconds(),
        }
    }
}

/// Terminal output preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Show the live status line while controls run.
    #[serde(default = "default_true")]
    pub progress: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            progress: default_true(),
        }
    }
}

/// Starting coordinate of the dimension color walk (xterm-256 cube).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSettings {
    #[serde(default = "default_start_row")]
    pub start_row: u8,
    #[serde(default = "default_start_column")]
    pub start_column: u8,
}

impl Default for DimensionSettings {
    fn default() -> Self {
        Self {
            start_row: default_start_row(),
            start_column: default_start_column(),
        }
    }
}

/// Log filter and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// `tracing` filter directives, e.g. `"warn,sqlcheck=debug"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Log files kept in the logs directory, this invocation's included.
    #[serde(default = "default_retain_files")]
    pub retain_files: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: None,
            retain_files: default_retain_files(),
        }
    }
}

fn default_retain_files() -> usize {
    10
}

fn default_max_parallel() -> usize {
    5
}

fn default_cancel_grace_seconds() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_start_row() -> u8 {
    crate::control::DEFAULT_START_ROW
}

fn default_start_column() -> u8 {
    crate::control::DEFAULT_START_COLUMN
}
