use thiserror::Error;

use crate::client::ClientError;
use crate::context::ContextError;
use crate::workspace::WorkspaceError;

/// Why a single control run ended in the `Error` state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlRunError {
    #[error("Failed to acquire a database session: {0}")]
    SessionAcquisition(String),
    #[error("Failed to resolve control query: {0}")]
    QueryResolution(String),
    #[error("Failed to set search path: {0}")]
    SearchPath(String),
    /// Transient failures persisted past the attempt cap.
    #[error("Backend unavailable after {attempts} attempts: {message}")]
    BackendConnectivity { attempts: u32, message: String },
    #[error("Query failed: {0}")]
    QueryDispatch(String),
    #[error("Control result is missing required columns: {}", missing.join(", "))]
    MissingRequiredColumns { missing: Vec<String> },
    #[error("Invalid control status '{value}'; expected one of ok, alarm, info, skip, error")]
    InvalidStatusValue { value: String },
    #[error("Result stream failed: {0}")]
    RowStream(String),
    #[error(transparent)]
    Cancelled(ContextError),
    #[error("control execution timed out")]
    TimedOut,
    #[error("Control run panicked: {0}")]
    Panicked(String),
}

impl ControlRunError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ControlRunError::Cancelled(_))
    }
}

/// Errors resolving a `--where` or `--tag` selector into a control set.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("--where and --tag cannot be used together")]
    Conflict,
    #[error("Tag filter '{0}' must have the form key=value")]
    MalformedTag(String),
    #[error("Tag key '{0}' may only contain letters, digits, '_' and '-'")]
    InvalidTagKey(String),
    #[error("--where predicate cannot be empty")]
    EmptyWhere,
    #[error("Failed to serialize control tags: {0}")]
    Tags(#[from] serde_json::Error),
    #[error("Control filter query failed: {0}")]
    Query(#[source] ClientError),
}

/// Invalid palette coordinates for the dimension color walk.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DimensionColorError {
    #[error("Color row {0} is out of range 0..=5")]
    RowOutOfRange(u8),
    #[error("Color column {0} is out of range 16..=51")]
    ColumnOutOfRange(u8),
}

/// Errors building an execution tree.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Colors(#[from] DimensionColorError),
}
