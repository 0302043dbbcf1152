use std::sync::Arc;
use std::time::Duration;

use super::control_run::ControlRun;
use super::progress::ControlHooks;
use super::result_group::ResultGroup;
use crate::client::Client;
use crate::workspace::Workspace;

/// Index of a [`ResultGroup`] in its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub(crate) usize);

/// Index of a [`ControlRun`] in its tree, equal to its document position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub(crate) usize);

impl GroupId {
    pub const ROOT: GroupId = GroupId(0);
}

/// Flat storage for every group and run of one tree. Shape is fixed once built.
#[derive(Debug, Default)]
pub struct TreeArena {
    pub(crate) groups: Vec<ResultGroup>,
    pub(crate) runs: Vec<ControlRun>,
}

impl TreeArena {
    pub fn group(&self, id: GroupId) -> &ResultGroup {
        &self.groups[id.0]
    }

    pub fn run(&self, id: RunId) -> &ControlRun {
        &self.runs[id.0]
    }

    pub fn root(&self) -> &ResultGroup {
        self.group(GroupId::ROOT)
    }

    /// Every run in document order.
    pub fn runs(&self) -> &[ControlRun] {
        &self.runs
    }
}

/// Everything a worker needs to execute one run.
pub(crate) struct RunEnv {
    pub arena: TreeArena,
    pub client: Arc<dyn Client>,
    pub workspace: Arc<dyn Workspace>,
    pub hooks: Arc<dyn ControlHooks>,
    pub dry_run: bool,
    pub query_timeout: Duration,
}
