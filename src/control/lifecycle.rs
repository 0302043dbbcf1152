use std::time::{Duration, Instant};

/// A named checkpoint in a run's life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub name: String,
    pub at: Instant,
}

/// Ordered, timestamped checkpoints.
#[derive(Debug, Clone, Default)]
pub struct LifecycleTimer {
    events: Vec<LifecycleEvent>,
}

impl LifecycleTimer {
    pub fn add(&mut self, name: impl Into<String>) {
        self.events.push(LifecycleEvent {
            name: name.into(),
            at: Instant::now(),
        });
    }

    pub fn events(&self) -> &[LifecycleEvent] {
        &self.events
    }

    /// Time from the first checkpoint to the last.
    pub fn elapsed(&self) -> Duration {
        match (self.events.first(), self.events.last()) {
            (Some(first), Some(last)) => last.at.saturating_duration_since(first.at),
            _ => Duration::ZERO,
        }
    }
}
