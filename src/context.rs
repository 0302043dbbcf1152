//! Cancellation and deadline tokens shared between the tree walk and the
//! control workers.
//!
//! A [`RunContext`] carries an optional cancellation signal and an optional
//! deadline. Waiters race [`RunContext::cancelled`] and
//! [`RunContext::expired`] in `crossbeam_channel::select!`: the first
//! disconnects when the context is cancelled, the second yields a message once
//! the deadline passes. Contexts derived with [`RunContext::with_timeout_from`]
//! share their parent's cancellation signal.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::warn;

/// Why a context is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// The context was cancelled, optionally with a reason.
    Cancelled(Option<String>),
    /// The context deadline passed.
    DeadlineExceeded,
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::Cancelled(None) => f.write_str("context canceled"),
            ContextError::Cancelled(Some(reason)) => write!(f, "context canceled: {reason}"),
            ContextError::DeadlineExceeded => f.write_str("context deadline exceeded"),
        }
    }
}

impl std::error::Error for ContextError {}

struct CancelState {
    cause: Mutex<Option<ContextError>>,
    trigger: Mutex<Option<Sender<Instant>>>,
    done: Receiver<Instant>,
}

impl CancelState {
    fn cause(&self) -> Option<ContextError> {
        self.cause
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Cloneable cancellation/deadline token.
#[derive(Clone, Default)]
pub struct RunContext {
    cancel: Option<Arc<CancelState>>,
    deadline: Option<Instant>,
    derived: bool,
}

impl RunContext {
    /// A context that is never done.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that is done once any clone calls [`RunContext::cancel`].
    pub fn cancellable() -> Self {
        let (trigger, done) = crossbeam_channel::bounded(0);
        Self {
            cancel: Some(Arc::new(CancelState {
                cause: Mutex::new(None),
                trigger: Mutex::new(Some(trigger)),
                done,
            })),
            deadline: None,
            derived: false,
        }
    }

    /// A fresh context that expires after `timeout`.
    ///
    /// It does not inherit cancellation from any other context.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: None,
            deadline: Some(Instant::now() + timeout),
            derived: false,
        }
    }

    /// A child of `parent` that also expires after `timeout`.
    ///
    /// The child is done when the parent is cancelled, when the parent's own
    /// deadline passes, or when `timeout` elapses, whichever comes first. The
    /// child cannot cancel its parent.
    pub fn with_timeout_from(parent: &RunContext, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            cancel: parent.cancel.clone(),
            deadline: Some(parent.deadline.map_or(deadline, |own| own.min(deadline))),
            derived: true,
        }
    }

    /// Cancel the context. Only the first call records its reason; later calls
    /// and calls on derived contexts or contexts without a cancellation
    /// signal are no-ops.
    pub fn cancel(&self, reason: Option<String>) {
        if self.derived {
            return;
        }
        let Some(state) = &self.cancel else {
            return;
        };
        {
            let mut cause = state.cause.lock().unwrap_or_else(|poisoned| {
                warn!("Context cause lock poisoned; recovering.");
                poisoned.into_inner()
            });
            if cause.is_some() {
                return;
            }
            *cause = Some(ContextError::Cancelled(reason));
        }
        let mut trigger = state
            .trigger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        trigger.take();
    }

    /// Why the context is done, or `None` while it is live. Cancellation wins
    /// over an expired deadline.
    pub fn err(&self) -> Option<ContextError> {
        if let Some(cause) = self.cancel.as_ref().and_then(|state| state.cause()) {
            return Some(cause);
        }
        self.deadline
            .filter(|deadline| Instant::now() >= *deadline)
            .map(|_| ContextError::DeadlineExceeded)
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Channel that disconnects once the context is cancelled.
    pub fn cancelled(&self) -> Receiver<Instant> {
        match &self.cancel {
            Some(state) => state.done.clone(),
            None => crossbeam_channel::never(),
        }
    }

    /// Channel that yields once the deadline passes.
    pub fn expired(&self) -> Receiver<Instant> {
        match self.deadline {
            Some(deadline) => crossbeam_channel::at(deadline),
            None => crossbeam_channel::never(),
        }
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("cancellable", &self.cancel.is_some())
            .field("deadline", &self.deadline)
            .field("err", &self.err())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::select;

    #[test]
    fn cancel_wakes_blocked_select() {
        let ctx = RunContext::cancellable();
        let waiter = ctx.clone();
        let handle = std::thread::spawn(move || {
            let cancelled = waiter.cancelled();
            let (_tx, idle) = crossbeam_channel::unbounded::<()>();
            select! {
                recv(idle) -> _ => false,
                recv(cancelled) -> _ => true,
            }
        });
        std::thread::sleep(Duration::from_millis(20));
        ctx.cancel(Some("interrupted".into()));
        assert!(handle.join().unwrap());
        assert_eq!(
            ctx.err(),
            Some(ContextError::Cancelled(Some("interrupted".into())))
        );
        assert_eq!(ctx.err().unwrap().to_string(), "context canceled: interrupted");
    }

    #[test]
    fn first_cancel_reason_wins() {
        let ctx = RunContext::cancellable();
        ctx.cancel(None);
        ctx.cancel(Some("later".into()));
        assert_eq!(ctx.err(), Some(ContextError::Cancelled(None)));
    }

    #[test]
    fn deadline_context_expires_without_cancel() {
        let ctx = RunContext::with_timeout(Duration::from_millis(10));
        assert!(!ctx.is_done());
        assert!(ctx.expired().recv_timeout(Duration::from_secs(1)).is_ok());
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
        ctx.cancel(None);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[test]
    fn background_is_never_done() {
        let ctx = RunContext::background();
        ctx.cancel(None);
        assert!(ctx.err().is_none());
        assert!(ctx.cancelled().recv_timeout(Duration::from_millis(10)).is_err());
        assert!(ctx.expired().recv_timeout(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn derived_context_sees_parent_cancel_before_its_deadline() {
        let parent = RunContext::cancellable();
        let child = RunContext::with_timeout_from(&parent, Duration::from_secs(60));
        assert!(child.err().is_none());

        let waiter = child.clone();
        let handle = std::thread::spawn(move || {
            let cancelled = waiter.cancelled();
            let expired = waiter.expired();
            select! {
                recv(cancelled) -> _ => waiter.err(),
                recv(expired) -> _ => Some(ContextError::DeadlineExceeded),
            }
        });
        std::thread::sleep(Duration::from_millis(20));
        parent.cancel(Some("interrupted".into()));
        assert_eq!(
            handle.join().unwrap(),
            Some(ContextError::Cancelled(Some("interrupted".into())))
        );
    }

    #[test]
    fn derived_context_expires_on_its_own_and_keeps_parent_live() {
        let parent = RunContext::cancellable();
        let child = RunContext::with_timeout_from(&parent, Duration::from_millis(10));
        assert!(child.expired().recv_timeout(Duration::from_secs(1)).is_ok());
        assert_eq!(child.err(), Some(ContextError::DeadlineExceeded));
        child.cancel(Some("child".into()));
        assert!(parent.err().is_none());

        let bounded = RunContext::with_timeout(Duration::from_millis(5));
        let nested = RunContext::with_timeout_from(&bounded, Duration::from_secs(60));
        assert_eq!(nested.deadline(), bounded.deadline());
    }
}
