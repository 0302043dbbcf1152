use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{Span, debug, warn};

use super::arena::{GroupId, RunEnv, RunId, TreeArena};
use super::control_run::ControlRun;
use super::errors::ControlRunError;
use super::semaphore::WeightedSemaphore;
use super::summary::{GroupSummary, StatusSummary};
use crate::context::RunContext;

/// Group id of the synthetic root of every tree.
pub const ROOT_GROUP_ID: &str = "root_result_group";

/// A child slot in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupChild {
    Group(GroupId),
    Run(RunId),
}

/// Tree node mirroring one mod or benchmark.
#[derive(Debug)]
pub struct ResultGroup {
    pub group_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub(crate) parent: Option<GroupId>,
    pub(crate) children: Vec<GroupChild>,
    summary: Mutex<GroupSummary>,
}

impl ResultGroup {
    pub(crate) fn new(group_id: impl Into<String>, parent: Option<GroupId>) -> Self {
        Self {
            group_id: group_id.into(),
            title: None,
            description: None,
            tags: BTreeMap::new(),
            parent,
            children: Vec::new(),
            summary: Mutex::new(GroupSummary::default()),
        }
    }

    pub fn parent(&self) -> Option<GroupId> {
        self.parent
    }

    pub fn children(&self) -> &[GroupChild] {
        &self.children
    }

    pub fn child_group_ids(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.children.iter().filter_map(|child| match child {
            GroupChild::Group(id) => Some(*id),
            GroupChild::Run(_) => None,
        })
    }

    pub fn control_run_ids(&self) -> impl Iterator<Item = RunId> + '_ {
        self.children.iter().filter_map(|child| match child {
            GroupChild::Run(id) => Some(*id),
            GroupChild::Group(_) => None,
        })
    }

    /// Copy of the aggregated counters.
    pub fn summary(&self) -> GroupSummary {
        self.lock_summary().clone()
    }

    /// Add `summary` to this group, then to each ancestor in turn.
    pub fn update_summary(&self, arena: &TreeArena, summary: &StatusSummary) {
        let mut current = Some(self);
        while let Some(group) = current {
            group.lock_summary().add_status(summary);
            current = group.parent.map(|parent| arena.group(parent));
        }
    }

    /// Add `summary` to the `severity` band of this group and each ancestor.
    pub fn update_severity_counts(&self, arena: &TreeArena, severity: &str, summary: &StatusSummary) {
        let mut current = Some(self);
        while let Some(group) = current {
            group.lock_summary().add_severity(severity, summary);
            current = group.parent.map(|parent| arena.group(parent));
        }
    }

    /// Immediate child group with the given group id.
    pub fn child_group_by_name<'a>(&self, arena: &'a TreeArena, name: &str) -> Option<&'a ResultGroup> {
        self.child_group_ids()
            .map(|id| arena.group(id))
            .find(|group| group.group_id == name)
    }

    /// Immediate control run for the named control.
    pub fn control_run_by_name<'a>(&self, arena: &'a TreeArena, name: &str) -> Option<&'a ControlRun> {
        self.control_run_ids()
            .map(|id| arena.run(id))
            .find(|run| run.name() == name)
    }

    /// Depth-first search of the subtree, in declaration order.
    pub fn nested_child_group_by_name<'a>(
        &self,
        arena: &'a TreeArena,
        name: &str,
    ) -> Option<&'a ResultGroup> {
        for id in self.child_group_ids() {
            let group = arena.group(id);
            if group.group_id == name {
                return Some(group);
            }
            if let Some(found) = group.nested_child_group_by_name(arena, name) {
                return Some(found);
            }
        }
        None
    }

    pub fn nested_control_run_by_name<'a>(
        &self,
        arena: &'a TreeArena,
        name: &str,
    ) -> Option<&'a ControlRun> {
        self.all_control_runs(arena)
            .into_iter()
            .find(|run| run.name() == name)
    }

    /// Every run in the subtree, in document order.
    pub fn all_control_runs<'a>(&self, arena: &'a TreeArena) -> Vec<&'a ControlRun> {
        let mut runs = Vec::new();
        self.collect_runs(arena, &mut runs);
        runs
    }

    fn collect_runs<'a>(&self, arena: &'a TreeArena, runs: &mut Vec<&'a ControlRun>) {
        for child in &self.children {
            match child {
                GroupChild::Run(id) => runs.push(arena.run(*id)),
                GroupChild::Group(id) => arena.group(*id).collect_runs(arena, runs),
            }
        }
    }

    /// Launch the direct runs, then walk child groups.
    ///
    /// Returns the failures visible when the walk finishes; the root summary
    /// after settlement is authoritative.
    pub(crate) fn execute(
        &self,
        ctx: &RunContext,
        env: &Arc<RunEnv>,
        sem: &Arc<WeightedSemaphore>,
    ) -> u64 {
        for run_id in self.control_run_ids() {
            let run = env.arena.run(run_id);
            if let Some(cause) = ctx.err() {
                run.set_error(env, ControlRunError::Cancelled(cause));
                continue;
            }
            if env.dry_run {
                run.skip(env);
                continue;
            }
            let permit = match sem.acquire(ctx) {
                Ok(permit) => permit,
                Err(cause) => {
                    run.set_error(env, ControlRunError::Cancelled(cause));
                    continue;
                }
            };
            let worker_env = env.clone();
            let worker_ctx = ctx.clone();
            let span = Span::current();
            let spawned = std::thread::Builder::new()
                .name(format!("sqlcheck-control-{}", run_id.0))
                .spawn(move || {
                    let _permit = permit;
                    let _entered = span.enter();
                    let run = worker_env.arena.run(run_id);
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        run.execute(&worker_ctx, &worker_env);
                    }));
                    if let Err(payload) = outcome {
                        let message = panic_message(payload.as_ref());
                        run.set_error(&worker_env, ControlRunError::Panicked(message));
                    }
                });
            if let Err(err) = spawned {
                run.set_error(
                    env,
                    ControlRunError::QueryDispatch(format!("failed to start control worker: {err}")),
                );
            }
        }
        for group_id in self.child_group_ids() {
            env.arena.group(group_id).execute(ctx, env, sem);
        }
        let failed = self.lock_summary().status.failed_count();
        debug!(group = %self.group_id, failed, "Group walk finished");
        failed
    }

    fn lock_summary(&self) -> MutexGuard<'_, GroupSummary> {
        self.summary.lock().unwrap_or_else(|poisoned| {
            warn!("Result group summary lock poisoned; recovering.");
            poisoned.into_inner()
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
