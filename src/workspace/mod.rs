//! Control, benchmark and mod definitions plus the tree-shape boundary the
//! execution engine reads them through.
//!
//! The engine only depends on the [`Workspace`] trait. [`ModWorkspace`] is a
//! small TOML-backed implementation used by the command-line runner and the
//! integration tests.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

mod items;
mod loader;


pub use items::{Benchmark, Control, ModDefinition, ResolvedQuery, TreeItem};
pub use loader::ModWorkspace;

/// Argument that expands to every loaded mod.
pub const ALL_TARGETS: &str = "all";

/// Read-only view of the loaded control hierarchy.
pub trait Workspace: Send + Sync {
    /// Resolve a command-line target into the ordered root items to run.
    fn resolve_targets(&self, arg: &str) -> Result<Vec<TreeItem>, WorkspaceError>;

    /// Children of a mod or benchmark in declaration order. Controls have none.
    fn children(&self, item: &TreeItem) -> Vec<TreeItem>;

    /// SQL text and positional arguments for a control.
    fn resolve_query(&self, control: &Control) -> Result<ResolvedQuery, WorkspaceError>;

    /// Every control in load order.
    fn controls(&self) -> Vec<Arc<Control>>;
}

/// Errors raised while loading definitions or resolving names against them.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The mod location does not exist or holds no definition files.
    #[error("No mod definitions found at {0}")]
    NoDefinitions(PathBuf),
    /// Failed to read a definition file or directory.
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A definition file is not valid TOML or does not match the schema.
    #[error("Invalid mod definition at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// Two resources share a name.
    #[error("Duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },
    /// A child reference points at nothing.
    #[error("'{parent}' references unknown child '{child}'")]
    UnknownChild { parent: String, child: String },
    /// Benchmarks contain each other.
    #[error("Benchmark cycle detected through '{0}'")]
    Cycle(String),
    /// A control argument has a type that cannot be bound as a query parameter.
    #[error("Control '{control}' has an unsupported argument at position {index}")]
    UnsupportedArgument { control: String, index: usize },
    /// The command-line target matches no mod, benchmark or control.
    #[error("No mod, benchmark or control named '{0}'")]
    UnknownTarget(String),
    /// A short name matches resources in more than one mod.
    #[error("'{name}' is ambiguous; qualify it with one of: {candidates}")]
    AmbiguousTarget { name: String, candidates: String },
    /// A control has neither inline SQL nor a query reference.
    #[error("Control '{0}' defines no SQL")]
    MissingQuery(String),
    /// A control references a named query that does not exist or is empty.
    #[error("Control '{control}' references unknown or empty query '{query}'")]
    UnknownQuery { control: String, query: String },
}
