//! The control execution engine.
//!
//! An [`ExecutionTree`] mirrors the resolved mod/benchmark hierarchy as
//! [`ResultGroup`]s holding [`ControlRun`]s. Executing the tree walks it on the
//! calling thread and launches every run on its own worker, bounded by one
//! shared [`WeightedSemaphore`]. Runs push their counters up through their
//! ancestors; once every run settles, dimension colors are assigned.

use std::time::Duration;

mod arena;
mod control_run;
mod dimension_colors;
mod errors;
mod execution_tree;
mod filter;
mod lifecycle;
mod progress;
mod result_group;
mod result_row;
mod semaphore;
mod summary;

#[cfg(test)]
mod tests;

pub use arena::{GroupId, RunId, TreeArena};
pub use control_run::{ControlRun, ControlRunSnapshot, ControlRunState};
pub use dimension_colors::{
    DEFAULT_START_COLUMN, DEFAULT_START_ROW, DimensionColorGenerator, DimensionColorMap,
    FORBIDDEN_COLUMNS,
};
pub use errors::{ControlRunError, DimensionColorError, FilterError, TreeError};
pub use execution_tree::{ExecutionOptions, ExecutionTree};
pub use filter::{CONTROL_RELATION, ControlFilter, introspection_query, tag_predicate};
pub use lifecycle::{LifecycleEvent, LifecycleTimer};
pub use progress::{
    ControlHooks, ControlProgress, NoopHooks, ProgressCounts, StatusSink, StderrStatus,
    TracingStatus,
};
pub use result_group::{GroupChild, ROOT_GROUP_ID, ResultGroup};
pub use result_row::{ControlStatus, Dimension, ResultRow, validate_columns};
pub use semaphore::{SemaphorePermit, WeightedSemaphore};
pub use summary::{GroupSummary, StatusSummary};

/// Attempts per run before transient failures become fatal.
pub const MAX_CONTROL_RUN_ATTEMPTS: u32 = 2;

/// Deadline for a single control query.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(240);

/// Sessions per unit of `max_parallel`.
pub const PARALLELISM_MULTIPLIER: usize = 1;

/// Default wait for running controls after cancellation.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(30);
