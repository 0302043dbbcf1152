//! Database access boundary used by the execution engine.
//!
//! The engine talks to a backend only through [`Client`] and [`Session`].
//! [`SqliteClient`] implements both on top of rusqlite, one connection per
//! session.

use std::any::Any;
use std::path::PathBuf;

use thiserror::Error;

use crate::context::{ContextError, RunContext};

mod search_path;
mod sqlite;
mod value;

pub use search_path::merge_search_path;
pub use sqlite::{SqliteClient, SqliteSession};
pub use value::{ColumnInfo, DataType, QueryRow, RowEvent, RowStream, SyncResult, Value};

/// Errors returned by a backend.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The database could not be opened.
    #[error("Failed to open database {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },
    /// The backend connection went away mid-request.
    #[error("Backend connection lost: {0}")]
    Connectivity(String),
    /// The backend is locked or busy.
    #[error("Database is busy, please retry")]
    Busy,
    /// The backend rejected or failed the query.
    #[error("Query failed: {0}")]
    Query(String),
    /// The request was cancelled or timed out.
    #[error(transparent)]
    Context(#[from] ContextError),
    /// Any other driver error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl ClientError {
    /// Transient failures are worth retrying from a fresh session.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Connectivity(_) | ClientError::Busy)
    }

    pub fn context_error(&self) -> Option<&ContextError> {
        match self {
            ClientError::Context(err) => Some(err),
            _ => None,
        }
    }
}

/// One exclusively owned backend connection. Dropping it releases it.
pub trait Session: Send {
    /// Backend identifier for the connection, for diagnostics.
    fn id(&self) -> u64;

    /// The session's current schema search path.
    fn search_path(&mut self) -> Result<Vec<String>, ClientError>;

    fn set_search_path(&mut self, path: &[String]) -> Result<(), ClientError>;

    /// Concrete access for the client that created the session.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Query backend shared by every control run of a tree.
pub trait Client: Send + Sync {
    fn acquire_session(&self, ctx: &RunContext) -> Result<Box<dyn Session>, ClientError>;

    /// Dispatch `query` on `session` and stream its rows.
    ///
    /// `ctx` bounds the dispatch; a stream outliving it is aborted by the
    /// consumer dropping it.
    fn execute_in_session(
        &self,
        ctx: &RunContext,
        session: &mut dyn Session,
        query: &str,
        params: &[Value],
    ) -> Result<RowStream, ClientError>;

    /// Merge a control's search path override with the session's current path.
    fn construct_search_path(
        &self,
        ctx: &RunContext,
        explicit: &[String],
        prefix: &[String],
        current: &[String],
    ) -> Result<Vec<String>, ClientError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        Ok(merge_search_path(explicit, prefix, current))
    }

    /// Run a query to completion outside any control session.
    fn execute_sync(&self, ctx: &RunContext, query: &str) -> Result<SyncResult, ClientError>;
}
