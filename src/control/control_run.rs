//! Execution of a single control.
//!
//! A run moves `Ready -> Started -> {Complete | Error}`. Each attempt acquires
//! its own session, resolves and dispatches the query under a per-query
//! deadline derived from the caller's context, and streams rows into
//! [`ResultRow`]s. Transient dispatch failures
//! start a new attempt from session acquisition until the attempt cap.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::select;
use tracing::{debug, warn};

use super::arena::{GroupId, RunEnv};
use super::errors::ControlRunError;
use super::lifecycle::LifecycleTimer;
use super::result_row::{ResultRow, validate_columns};
use super::summary::StatusSummary;
use super::MAX_CONTROL_RUN_ATTEMPTS;
use crate::client::{ClientError, RowEvent, Session};
use crate::context::{ContextError, RunContext};
use crate::workspace::Control;

/// Lifecycle state of a [`ControlRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRunState {
    Ready,
    Started,
    Complete,
    Error,
}

impl ControlRunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ControlRunState::Complete | ControlRunState::Error)
    }
}

#[derive(Debug, Default)]
struct RunInner {
    state: Option<ControlRunState>,
    summary: StatusSummary,
    rows: Vec<ResultRow>,
    lifecycle: LifecycleTimer,
    attempts: u32,
    error: Option<ControlRunError>,
    session_id: Option<u64>,
    started_at: Option<Instant>,
    duration: Option<Duration>,
}

/// Point-in-time copy of a run's mutable state.
#[derive(Debug, Clone)]
pub struct ControlRunSnapshot {
    pub name: String,
    pub state: ControlRunState,
    pub summary: StatusSummary,
    pub attempts: u32,
    pub error: Option<ControlRunError>,
    pub session_id: Option<u64>,
    pub duration: Option<Duration>,
}

/// One execution of one control.
#[derive(Debug)]
pub struct ControlRun {
    control: Arc<Control>,
    group: GroupId,
    inner: Mutex<RunInner>,
}

enum AttemptError {
    Transient(ClientError),
    Fatal(ControlRunError),
}

impl From<ControlRunError> for AttemptError {
    fn from(err: ControlRunError) -> Self {
        AttemptError::Fatal(err)
    }
}

enum StreamStep {
    Event(Option<RowEvent>),
    Cancelled,
    TimedOut,
}

impl ControlRun {
    pub(crate) fn new(control: Arc<Control>, group: GroupId) -> Self {
        Self {
            control,
            group,
            inner: Mutex::new(RunInner::default()),
        }
    }

    pub fn control(&self) -> &Arc<Control> {
        &self.control
    }

    pub fn name(&self) -> &str {
        &self.control.name
    }

    /// Group the run reports into.
    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn state(&self) -> ControlRunState {
        self.lock().state.unwrap_or(ControlRunState::Ready)
    }

    pub fn summary(&self) -> StatusSummary {
        self.lock().summary
    }

    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    pub fn error(&self) -> Option<ControlRunError> {
        self.lock().error.clone()
    }

    pub fn session_id(&self) -> Option<u64> {
        self.lock().session_id
    }

    pub fn duration(&self) -> Option<Duration> {
        self.lock().duration
    }

    pub fn lifecycle(&self) -> LifecycleTimer {
        self.lock().lifecycle.clone()
    }

    /// Result rows; bucketed by status once the run is terminal.
    pub fn rows(&self) -> Vec<ResultRow> {
        self.lock().rows.clone()
    }

    /// Borrow the rows without cloning them.
    pub fn with_rows<R>(&self, f: impl FnOnce(&[ResultRow]) -> R) -> R {
        f(&self.lock().rows)
    }

    pub fn snapshot(&self) -> ControlRunSnapshot {
        let inner = self.lock();
        ControlRunSnapshot {
            name: self.control.name.clone(),
            state: inner.state.unwrap_or(ControlRunState::Ready),
            summary: inner.summary,
            attempts: inner.attempts,
            error: inner.error.clone(),
            session_id: inner.session_id,
            duration: inner.duration,
        }
    }

    /// Run every attempt and publish the terminal outcome.
    pub(crate) fn execute(&self, ctx: &RunContext, env: &RunEnv) {
        match self.run_attempts(ctx, env) {
            Ok(()) => self.set_complete(env),
            Err(err) => self.set_error(env, err),
        }
    }

    /// Finish without running, as for a dry run.
    pub(crate) fn skip(&self, env: &RunEnv) {
        {
            let mut inner = self.lock();
            if inner.state.is_some_and(ControlRunState::is_terminal) {
                return;
            }
            inner.lifecycle.add("skipped");
            inner.state = Some(ControlRunState::Complete);
            inner.duration = Some(Duration::ZERO);
        }
        debug!(control = %self.control.name, "Control skipped");
        env.hooks.on_control_complete(self);
    }

    /// Record a terminal error unless the run already finished.
    pub(crate) fn set_error(&self, env: &RunEnv, err: ControlRunError) {
        let summary = {
            let mut inner = self.lock();
            if inner.state.is_some_and(ControlRunState::is_terminal) {
                warn!(control = %self.control.name, error = %err, "Ignoring error for finished control");
                return;
            }
            inner.summary.error += 1;
            inner.state = Some(ControlRunState::Error);
            inner.lifecycle.add("error");
            inner.duration = inner.started_at.map(|started| started.elapsed());
            inner.rows.sort_by_key(|row| row.status);
            inner.error = Some(err.clone());
            inner.summary
        };
        if err.is_cancellation() {
            debug!(control = %self.control.name, error = %err, "Control cancelled");
        } else {
            warn!(control = %self.control.name, error = %err, "Control failed");
        }
        self.publish(env, &summary);
        env.hooks.on_control_error(self);
    }

    fn set_complete(&self, env: &RunEnv) {
        let summary = {
            let mut inner = self.lock();
            inner.state = Some(ControlRunState::Complete);
            inner.lifecycle.add("complete");
            inner.duration = inner.started_at.map(|started| started.elapsed());
            inner.rows.sort_by_key(|row| row.status);
            inner.summary
        };
        debug!(
            control = %self.control.name,
            ok = summary.ok,
            alarm = summary.alarm,
            error = summary.error,
            "Control complete"
        );
        self.publish(env, &summary);
        env.hooks.on_control_complete(self);
    }

    fn publish(&self, env: &RunEnv, summary: &StatusSummary) {
        let group = env.arena.group(self.group);
        group.update_summary(&env.arena, summary);
        if let Some(severity) = self.control.severity.as_deref() {
            group.update_severity_counts(&env.arena, severity, summary);
        }
    }

    fn run_attempts(&self, ctx: &RunContext, env: &RunEnv) -> Result<(), ControlRunError> {
        loop {
            if let Some(err) = ctx.err() {
                return Err(ControlRunError::Cancelled(err));
            }
            self.begin_attempt(env);
            match self.attempt(ctx, env) {
                Ok(()) => return Ok(()),
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Transient(err)) => {
                    let attempts = self.attempts();
                    if attempts >= MAX_CONTROL_RUN_ATTEMPTS {
                        return Err(ControlRunError::BackendConnectivity {
                            attempts,
                            message: err.to_string(),
                        });
                    }
                    warn!(
                        control = %self.control.name,
                        attempt = attempts,
                        error = %err,
                        "Transient backend failure; retrying"
                    );
                }
            }
        }
    }

    fn begin_attempt(&self, env: &RunEnv) {
        let first = {
            let mut inner = self.lock();
            inner.attempts += 1;
            inner.lifecycle.add("started");
            let first = inner.state.is_none();
            if first {
                inner.state = Some(ControlRunState::Started);
                inner.started_at = Some(Instant::now());
            }
            first
        };
        if first {
            debug!(control = %self.control.name, "Control started");
            env.hooks.on_control_start(self);
        }
    }

    fn attempt(&self, ctx: &RunContext, env: &RunEnv) -> Result<(), AttemptError> {
        let mut session = env
            .client
            .acquire_session(ctx)
            .map_err(|err| match err.context_error() {
                Some(cause) => ControlRunError::Cancelled(cause.clone()),
                None => ControlRunError::SessionAcquisition(err.to_string()),
            })?;
        self.lock().session_id = Some(session.id());

        let query = env
            .workspace
            .resolve_query(&self.control)
            .map_err(|err| ControlRunError::QueryResolution(err.to_string()))?;
        if query.sql.trim().is_empty() {
            return Err(ControlRunError::QueryResolution(format!(
                "control '{}' resolved to empty SQL",
                self.control.name
            ))
            .into());
        }

        if self.control.has_search_path_override() {
            self.apply_search_path(ctx, env, session.as_mut())?;
        }

        let query_ctx = RunContext::with_timeout_from(ctx, env.query_timeout);
        let stream = env
            .client
            .execute_in_session(&query_ctx, session.as_mut(), &query.sql, &query.args)
            .map_err(|err| {
                if err.is_transient() {
                    return AttemptError::Transient(err);
                }
                AttemptError::Fatal(match err.context_error() {
                    Some(ContextError::DeadlineExceeded) => ControlRunError::TimedOut,
                    Some(cause) => ControlRunError::Cancelled(cause.clone()),
                    None => ControlRunError::QueryDispatch(err.to_string()),
                })
            })?;
        self.lock().lifecycle.add("dispatched");

        let rows = stream.receiver();
        let cancelled = query_ctx.cancelled();
        let deadline = query_ctx.expired();
        let mut validated = false;
        loop {
            let step = select! {
                recv(rows) -> event => StreamStep::Event(event.ok()),
                recv(cancelled) -> _ => StreamStep::Cancelled,
                recv(deadline) -> _ => StreamStep::TimedOut,
            };
            match step {
                StreamStep::Event(Some(RowEvent::Row(row))) => {
                    if !validated {
                        validate_columns(&row.columns)?;
                        validated = true;
                    }
                    let result = ResultRow::from_query_row(&row, self.control.clone())?;
                    let mut inner = self.lock();
                    inner.summary.record(result.status);
                    inner.rows.push(result);
                }
                StreamStep::Event(Some(RowEvent::Done)) => return Ok(()),
                StreamStep::Event(Some(RowEvent::Failed(err))) => {
                    return Err(ControlRunError::RowStream(err.to_string()).into());
                }
                StreamStep::Event(None) => {
                    return Err(ControlRunError::RowStream(
                        "result stream closed before completion".into(),
                    )
                    .into());
                }
                StreamStep::Cancelled => {
                    let cause = ctx.err().unwrap_or(ContextError::Cancelled(None));
                    return Err(ControlRunError::Cancelled(cause).into());
                }
                StreamStep::TimedOut => return Err(ControlRunError::TimedOut.into()),
            }
        }
    }

    fn apply_search_path(
        &self,
        ctx: &RunContext,
        env: &RunEnv,
        session: &mut dyn Session,
    ) -> Result<(), ControlRunError> {
        let search_path_error = |err: ClientError| ControlRunError::SearchPath(err.to_string());
        let current = session.search_path().map_err(search_path_error)?;
        let merged = env
            .client
            .construct_search_path(
                ctx,
                &self.control.search_path,
                &self.control.search_path_prefix,
                &current,
            )
            .map_err(search_path_error)?;
        session.set_search_path(&merged).map_err(search_path_error)?;
        debug!(control = %self.control.name, search_path = ?merged, "Applied search path");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, RunInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("Control run lock poisoned; recovering.");
            poisoned.into_inner()
        })
    }
}
