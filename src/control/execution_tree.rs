use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{info, info_span, warn};
use uuid::Uuid;

use super::arena::{GroupId, RunEnv, RunId, TreeArena};
use super::control_run::ControlRun;
use super::dimension_colors::{
    DEFAULT_START_COLUMN, DEFAULT_START_ROW, DimensionColorGenerator, DimensionColorMap,
};
use super::errors::TreeError;
use super::filter::ControlFilter;
use super::progress::ControlHooks;
use super::result_group::{GroupChild, ROOT_GROUP_ID, ResultGroup};
use super::semaphore::WeightedSemaphore;
use super::summary::GroupSummary;
use super::{DEFAULT_CANCEL_GRACE, PARALLELISM_MULTIPLIER, QUERY_TIMEOUT};
use crate::client::Client;
use crate::config::Settings;
use crate::context::RunContext;
use crate::workspace::{Control, TreeItem, Workspace};

/// Knobs for building and executing a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Maximum number of concurrently executing controls.
    pub max_parallel: usize,
    /// Mark every run complete without querying.
    pub dry_run: bool,
    pub filter: ControlFilter,
    /// How long a cancelled tree waits for running controls to return.
    pub cancel_grace: Duration,
    pub query_timeout: Duration,
    pub color_start_row: u8,
    pub color_start_column: u8,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_parallel: 5,
            dry_run: false,
            filter: ControlFilter::default(),
            cancel_grace: DEFAULT_CANCEL_GRACE,
            query_timeout: QUERY_TIMEOUT,
            color_start_row: DEFAULT_START_ROW,
            color_start_column: DEFAULT_START_COLUMN,
        }
    }
}

impl ExecutionOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let settings = settings.clone().normalized();
        Self {
            max_parallel: settings.execution.max_parallel,
            cancel_grace: settings.execution.cancel_grace(),
            color_start_row: settings.dimensions.start_row,
            color_start_column: settings.dimensions.start_column,
            ..Self::default()
        }
    }
}

/// A built, runnable result tree for one target.
pub struct ExecutionTree {
    env: Arc<RunEnv>,
    run_id: Uuid,
    target: String,
    max_parallel: usize,
    cancel_grace: Duration,
    filter: Option<BTreeSet<String>>,
    colors: DimensionColorGenerator,
    dimension_colors: DimensionColorMap,
    started_at: Option<SystemTime>,
    ended_at: Option<SystemTime>,
}

impl ExecutionTree {
    /// Resolve `target` and build the group/run tree beneath the synthetic root.
    ///
    /// A filter selector is evaluated first; a failing predicate aborts the
    /// build before anything runs.
    pub fn build(
        workspace: Arc<dyn Workspace>,
        client: Arc<dyn Client>,
        target: &str,
        options: ExecutionOptions,
        hooks: Arc<dyn ControlHooks>,
    ) -> Result<Self, TreeError> {
        let colors =
            DimensionColorGenerator::new(options.color_start_row, options.color_start_column)?;
        let filter = options.filter.resolve(
            &RunContext::background(),
            client.as_ref(),
            workspace.as_ref(),
        )?;
        let items = workspace.resolve_targets(target)?;

        let mut builder = TreeBuilder {
            workspace: workspace.as_ref(),
            filter: filter.as_ref(),
            arena: TreeArena::default(),
        };
        builder
            .arena
            .groups
            .push(ResultGroup::new(ROOT_GROUP_ID, None));
        for item in &items {
            builder.add_item(item, GroupId::ROOT, true);
        }
        let arena = builder.arena;
        info!(
            root = target,
            groups = arena.groups.len() - 1,
            controls = arena.runs.len(),
            "Built execution tree"
        );

        Ok(Self {
            env: Arc::new(RunEnv {
                arena,
                client,
                workspace,
                hooks,
                dry_run: options.dry_run,
                query_timeout: options.query_timeout,
            }),
            run_id: Uuid::new_v4(),
            target: target.to_string(),
            max_parallel: options.max_parallel.max(1),
            cancel_grace: options.cancel_grace,
            filter,
            colors,
            dimension_colors: DimensionColorMap::new(),
            started_at: None,
            ended_at: None,
        })
    }

    /// Run every control and wait for them to settle. Returns the number of
    /// failed results (`alarm + error`) at the root.
    pub fn execute(&mut self, ctx: &RunContext) -> u64 {
        let span = info_span!("execution_tree", run_id = %self.run_id, root = %self.target);
        let _entered = span.enter();
        self.started_at = Some(SystemTime::now());
        let total = self.env.arena.runs.len();
        let sem = Arc::new(WeightedSemaphore::new(
            self.max_parallel * PARALLELISM_MULTIPLIER,
        ));
        info!(total, max_parallel = self.max_parallel, "Executing controls");
        self.env.hooks.on_start(total);

        self.env.arena.root().execute(ctx, &self.env, &sem);
        self.wait_for_settle(ctx, &sem);

        let mut colors = self.colors.clone();
        colors.populate(self.env.arena.runs.iter());
        self.dimension_colors = colors.into_map();
        self.env.hooks.on_finish();
        self.ended_at = Some(SystemTime::now());

        let summary = self.summary();
        info!(
            ok = summary.status.ok,
            alarm = summary.status.alarm,
            info = summary.status.info,
            skip = summary.status.skip,
            error = summary.status.error,
            "Execution finished"
        );
        summary.status.failed_count()
    }

    /// Block until every permit is back; a cancelled caller waits at most the grace period.
    fn wait_for_settle(&self, ctx: &RunContext, sem: &WeightedSemaphore) {
        if !ctx.is_done() && sem.acquire_all(ctx).is_ok() {
            return;
        }
        warn!(
            grace_secs = self.cancel_grace.as_secs_f64(),
            "Execution cancelled; waiting for running controls"
        );
        let grace = RunContext::with_timeout(self.cancel_grace);
        if let Err(err) = sem.acquire_all(&grace) {
            warn!(
                error = %err,
                running = sem.capacity() - sem.available(),
                "Controls still running after grace period"
            );
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn arena(&self) -> &TreeArena {
        &self.env.arena
    }

    pub fn root(&self) -> &ResultGroup {
        self.env.arena.root()
    }

    pub fn group(&self, id: GroupId) -> &ResultGroup {
        self.env.arena.group(id)
    }

    pub fn run(&self, id: RunId) -> &ControlRun {
        self.env.arena.run(id)
    }

    /// Every run in document order.
    pub fn control_runs(&self) -> &[ControlRun] {
        self.env.arena.runs()
    }

    /// Short names selected by the filter, if one was given.
    pub fn filter(&self) -> Option<&BTreeSet<String>> {
        self.filter.as_ref()
    }

    pub fn summary(&self) -> GroupSummary {
        self.root().summary()
    }

    pub fn dimension_colors(&self) -> &DimensionColorMap {
        &self.dimension_colors
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<SystemTime> {
        self.ended_at
    }

    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.ended_at?);
        end.duration_since(start).ok()
    }
}

struct TreeBuilder<'a> {
    workspace: &'a dyn Workspace,
    filter: Option<&'a BTreeSet<String>>,
    arena: TreeArena,
}

impl TreeBuilder<'_> {
    fn add_item(&mut self, item: &TreeItem, parent: GroupId, top_level: bool) {
        match item {
            TreeItem::Control(control) => {
                if self.includes(control) {
                    let id = RunId(self.arena.runs.len());
                    self.arena.runs.push(ControlRun::new(control.clone(), parent));
                    self.arena.groups[parent.0].children.push(GroupChild::Run(id));
                }
            }
            TreeItem::Mod(_) | TreeItem::Benchmark(_) => {
                if !top_level && !self.contains_included(item) {
                    return;
                }
                let id = GroupId(self.arena.groups.len());
                let mut group = ResultGroup::new(item.name(), Some(parent));
                group.title = item.title().map(str::to_string);
                group.description = item.description().map(str::to_string);
                group.tags = item.tags().clone();
                self.arena.groups.push(group);
                self.arena.groups[parent.0].children.push(GroupChild::Group(id));
                for child in self.workspace.children(item) {
                    self.add_item(&child, id, false);
                }
            }
        }
    }

    fn includes(&self, control: &Control) -> bool {
        self.filter
            .is_none_or(|selected| selected.contains(&control.short_name))
    }

    fn contains_included(&self, item: &TreeItem) -> bool {
        match item {
            TreeItem::Control(control) => self.includes(control),
            _ => self
                .workspace
                .children(item)
                .iter()
                .any(|child| self.contains_included(child)),
        }
    }
}
