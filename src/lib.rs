//! Library exports for the `sqlcheck` runner, its tests and benchmarks.
/// Application directory resolution.
pub mod app_dirs;
/// Database client boundary and the SQLite implementation.
pub mod client;
/// Persistent settings.
pub mod config;
/// Cancellation and deadline tokens.
pub mod context;
/// Control execution engine.
pub mod control;
/// Logging setup.
pub mod logging;
/// Control, benchmark and mod definitions.
pub mod workspace;
