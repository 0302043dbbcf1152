//! Progress signalling for a running tree.

use std::io::Write;
use std::sync::{Mutex, MutexGuard};

use tracing::{info, warn};

use super::control_run::ControlRun;

/// Observer of tree and run lifecycle events.
///
/// Called synchronously from whichever thread produced the event.
pub trait ControlHooks: Send + Sync {
    fn on_start(&self, _total: usize) {}
    fn on_control_start(&self, _run: &ControlRun) {}
    fn on_control_complete(&self, _run: &ControlRun) {}
    fn on_control_error(&self, _run: &ControlRun) {}
    fn on_finish(&self) {}
}

/// Hooks that ignore every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl ControlHooks for NoopHooks {}

/// Destination for rendered status lines.
pub trait StatusSink: Send + Sync {
    fn publish(&self, line: &str);
    fn finish(&self, _line: &str) {}
}

/// Rewrites a single status line on stderr.
#[derive(Debug, Default)]
pub struct StderrStatus;

impl StatusSink for StderrStatus {
    fn publish(&self, line: &str) {
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "\r\x1b[2K{line}");
        let _ = stderr.flush();
    }

    fn finish(&self, line: &str) {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "\r\x1b[2K{line}");
    }
}

/// Sends status lines to the log.
#[derive(Debug, Default)]
pub struct TracingStatus;

impl StatusSink for TracingStatus {
    fn publish(&self, line: &str) {
        info!("{line}");
    }
}

/// Run counters tracked by [`ControlProgress`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProgressCounts {
    pub total: usize,
    pub pending: usize,
    pub executing: usize,
    pub complete: usize,
    pub error: usize,
}

impl ProgressCounts {
    pub fn status_line(&self) -> String {
        let noun = if self.total == 1 { "control" } else { "controls" };
        let errors = if self.error == 1 { "error" } else { "errors" };
        format!(
            "Running {} {noun}. ({} complete, {} running, {} pending, {} {errors})",
            self.total, self.complete, self.executing, self.pending, self.error
        )
    }
}

/// Hooks keeping run counters and republishing a status line on each change.
pub struct ControlProgress {
    counts: Mutex<ProgressCounts>,
    sink: Box<dyn StatusSink>,
}

impl ControlProgress {
    pub fn new(sink: impl StatusSink + 'static) -> Self {
        Self {
            counts: Mutex::new(ProgressCounts::default()),
            sink: Box::new(sink),
        }
    }

    pub fn counts(&self) -> ProgressCounts {
        *self.lock()
    }

    fn update(&self, apply: impl FnOnce(&mut ProgressCounts)) {
        let line = {
            let mut counts = self.lock();
            apply(&mut counts);
            counts.status_line()
        };
        self.sink.publish(&line);
    }

    /// Move one run out of `pending` or `executing`, depending on whether it started.
    fn settle(counts: &mut ProgressCounts, run: &ControlRun) {
        if run.attempts() == 0 {
            counts.pending = counts.pending.saturating_sub(1);
        } else {
            counts.executing = counts.executing.saturating_sub(1);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProgressCounts> {
        self.counts.lock().unwrap_or_else(|poisoned| {
            warn!("Progress lock poisoned; recovering.");
            poisoned.into_inner()
        })
    }
}

impl ControlHooks for ControlProgress {
    fn on_start(&self, total: usize) {
        self.update(|counts| {
            *counts = ProgressCounts {
                total,
                pending: total,
                ..ProgressCounts::default()
            };
        });
    }

    fn on_control_start(&self, _run: &ControlRun) {
        self.update(|counts| {
            counts.pending = counts.pending.saturating_sub(1);
            counts.executing += 1;
        });
    }

    fn on_control_complete(&self, run: &ControlRun) {
        self.update(|counts| {
            Self::settle(counts, run);
            counts.complete += 1;
        });
    }

    fn on_control_error(&self, run: &ControlRun) {
        self.update(|counts| {
            Self::settle(counts, run);
            counts.error += 1;
        });
    }

    fn on_finish(&self) {
        let line = self.lock().status_line();
        self.sink.finish(&line);
    }
}
