use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Sender, select};
use rand::Rng;

use super::*;
use crate::client::{
    Client, ClientError, ColumnInfo, DataType, QueryRow, RowEvent, RowStream, Session, SyncResult,
    Value,
};
use crate::context::{ContextError, RunContext};
use crate::workspace::{ModWorkspace, Workspace};

type Cells = Vec<(&'static str, Value)>;

#[derive(Clone)]
enum Script {
    Rows(Vec<Cells>),
    RowsThenFail(Vec<Cells>),
    Busy,
    Hang,
    /// Block dispatch until the query context is done.
    AwaitDone,
    /// Block dispatch for a fixed time regardless of the context.
    Stall(Duration),
    Panic,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Default)]
struct FakeClient {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    max_delay_ms: u64,
    counters: Arc<Counters>,
    sessions: AtomicU64,
    dispatches: AtomicUsize,
    selected: Vec<&'static str>,
    search_paths: Arc<Mutex<Vec<Vec<String>>>>,
    hung: Mutex<Vec<Sender<RowEvent>>>,
}

impl FakeClient {
    fn script(self, sql: &str, scripts: Vec<Script>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(sql.to_string(), scripts.into());
        self
    }

    /// Scripts are consumed in order; the last one repeats.
    fn next_script(&self, sql: &str) -> Script {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(sql) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap(),
            None => Script::Rows(vec![row("ok", sql)]),
        }
    }

    fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }
}

struct FakeSession {
    id: u64,
    path: Vec<String>,
    counters: Arc<Counters>,
    search_paths: Arc<Mutex<Vec<Vec<String>>>>,
}

impl Session for FakeSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn search_path(&mut self) -> Result<Vec<String>, ClientError> {
        Ok(self.path.clone())
    }

    fn set_search_path(&mut self, path: &[String]) -> Result<(), ClientError> {
        self.path = path.to_vec();
        self.search_paths.lock().unwrap().push(path.to_vec());
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Client for FakeClient {
    fn acquire_session(&self, ctx: &RunContext) -> Result<Box<dyn Session>, ClientError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(active, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            id: self.sessions.fetch_add(1, Ordering::SeqCst) + 1,
            path: vec!["main".into()],
            counters: self.counters.clone(),
            search_paths: self.search_paths.clone(),
        }))
    }

    fn execute_in_session(
        &self,
        ctx: &RunContext,
        _session: &mut dyn Session,
        query: &str,
        _params: &[Value],
    ) -> Result<RowStream, ClientError> {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        if self.max_delay_ms > 0 {
            let delay = rand::rng().random_range(1..=self.max_delay_ms);
            std::thread::sleep(Duration::from_millis(delay));
        }
        match self.next_script(query) {
            Script::Rows(rows) => {
                let mut events: Vec<RowEvent> = rows.into_iter().map(query_row).collect();
                events.push(RowEvent::Done);
                Ok(RowStream::from_events(events))
            }
            Script::RowsThenFail(rows) => {
                let mut events: Vec<RowEvent> = rows.into_iter().map(query_row).collect();
                events.push(RowEvent::Failed(ClientError::Query("disk I/O error".into())));
                Ok(RowStream::from_events(events))
            }
            Script::Busy => Err(ClientError::Busy),
            Script::Hang => {
                let (tx, rx) = crossbeam_channel::unbounded();
                self.hung.lock().unwrap().push(tx);
                Ok(RowStream::new(rx))
            }
            Script::AwaitDone => {
                let cancelled = ctx.cancelled();
                let expired = ctx.expired();
                select! {
                    recv(cancelled) -> _ => {}
                    recv(expired) -> _ => {}
                }
                Err(ctx.err().unwrap_or(ContextError::Cancelled(None)).into())
            }
            Script::Stall(delay) => {
                std::thread::sleep(delay);
                Ok(RowStream::from_events(vec![query_row(row("ok", query)), RowEvent::Done]))
            }
            Script::Panic => panic!("boom"),
        }
    }

    fn execute_sync(&self, _ctx: &RunContext, _query: &str) -> Result<SyncResult, ClientError> {
        Ok(SyncResult {
            columns: vec![ColumnInfo::new("resource_name", DataType::Text)],
            rows: self
                .selected
                .iter()
                .map(|name| vec![Value::Text(name.to_string())])
                .collect(),
        })
    }
}

fn row(status: &str, resource: &str) -> Cells {
    vec![
        ("resource", Value::Text(resource.into())),
        ("reason", Value::Text(format!("{resource} is {status}"))),
        ("status", Value::Text(status.into())),
    ]
}

fn row_in(status: &str, resource: &str, region: &str) -> Cells {
    let mut cells = row(status, resource);
    cells.push(("region", Value::Text(region.into())));
    cells
}

fn query_row(cells: Cells) -> RowEvent {
    let columns: Arc<[ColumnInfo]> = cells
        .iter()
        .map(|(name, value)| ColumnInfo::new(*name, DataType::of(value)))
        .collect();
    RowEvent::Row(QueryRow {
        columns,
        values: cells.into_iter().map(|(_, value)| value).collect(),
    })
}

const LOCAL_MOD: &str = r#"
[mod]
name = "local"
children = ["benchmark.b", "benchmark.other"]

[[benchmark]]
name = "b"
children = ["control.c1", "control.c2"]

[[benchmark]]
name = "other"
children = ["benchmark.nested", "benchmark.dropped", "control.c3"]

[[benchmark]]
name = "nested"
children = ["control.c4"]

[[benchmark]]
name = "dropped"
children = ["control.c5"]

[[control]]
name = "c1"
severity = "high"
sql = "c1"

[[control]]
name = "c2"
sql = "c2"

[[control]]
name = "c3"
severity = "low"
sql = "c3"
search_path_prefix = ["aws"]

[[control]]
name = "c4"
sql = "c4"

[[control]]
name = "c5"
sql = "c5"
"#;

fn options(max_parallel: usize) -> ExecutionOptions {
    ExecutionOptions {
        max_parallel,
        ..ExecutionOptions::default()
    }
}

fn build(
    toml: &str,
    target: &str,
    client: Arc<FakeClient>,
    options: ExecutionOptions,
) -> ExecutionTree {
    let workspace: Arc<dyn Workspace> = Arc::new(ModWorkspace::from_toml_str(toml).unwrap());
    ExecutionTree::build(workspace, client, target, options, Arc::new(NoopHooks)).unwrap()
}

fn statuses(run: &ControlRun) -> Vec<ControlStatus> {
    run.rows().iter().map(|row| row.status).collect()
}

fn assert_aggregates(tree: &ExecutionTree, group: &ResultGroup) -> StatusSummary {
    let mut expected = StatusSummary::default();
    for id in group.control_run_ids() {
        expected.add(&tree.run(id).summary());
    }
    for id in group.child_group_ids() {
        expected.add(&assert_aggregates(tree, tree.group(id)));
    }
    assert_eq!(group.summary().status, expected, "group {}", group.group_id);
    expected
}

#[test]
fn benchmark_counts_reach_the_root() {
    let client = Arc::new(FakeClient::default().script("c1", vec![Script::Rows(vec![row("alarm", "a")])]).script(
        "c2",
        vec![Script::Rows(vec![row("ok", "x"), row("ok", "y")])],
    ));
    let mut tree = build(LOCAL_MOD, "benchmark.b", client, options(2));
    let failed = tree.execute(&RunContext::background());

    assert_eq!(failed, 1);
    let summary = tree.summary();
    assert_eq!(summary.status.alarm, 1);
    assert_eq!(summary.status.ok, 2);
    assert_eq!(summary.status.failed_count(), 1);
    assert_eq!(summary.status.total_count(), 3);
    assert_eq!(summary.severity["high"].alarm, 1);
    assert_eq!(summary.severity.len(), 1);

    let root = tree.root();
    assert_eq!(root.group_id, ROOT_GROUP_ID);
    let benchmark = root
        .child_group_by_name(tree.arena(), "local.benchmark.b")
        .unwrap();
    assert_eq!(benchmark.summary(), summary);
    assert_aggregates(&tree, root);
}

#[test]
fn nested_groups_aggregate_and_empty_benchmarks_stay_out_of_filtered_trees() {
    let client = Arc::new(FakeClient {
        selected: vec!["c1", "c4"],
        ..FakeClient::default()
    }
    .script("c4", vec![Script::Rows(vec![row("error", "e"), row("info", "i")])]));
    let mut opts = options(3);
    opts.filter.where_clause = Some("severity = 'high' or title is null".into());
    let mut tree = build(LOCAL_MOD, "local", client, opts);

    let arena = tree.arena();
    let names: Vec<&str> = tree.control_runs().iter().map(ControlRun::name).collect();
    assert_eq!(names, ["local.control.c1", "local.control.c4"]);
    let other = tree
        .root()
        .nested_child_group_by_name(arena, "local.benchmark.other")
        .unwrap();
    assert!(other.child_group_by_name(arena, "local.benchmark.dropped").is_none());
    assert!(other.control_run_by_name(arena, "local.control.c3").is_none());
    assert!(tree
        .root()
        .nested_control_run_by_name(arena, "local.control.c4")
        .is_some());

    let failed = tree.execute(&RunContext::background());
    assert_eq!(failed, 1);
    assert_aggregates(&tree, tree.root());
}

#[test]
fn missing_columns_fail_the_run() {
    let client = Arc::new(FakeClient::default().script(
        "c1",
        vec![Script::Rows(vec![vec![("resource", Value::Text("r".into()))]])],
    ));
    let mut tree = build(LOCAL_MOD, "control.c1", client, options(1));
    assert_eq!(tree.execute(&RunContext::background()), 1);

    let run = &tree.control_runs()[0];
    assert_eq!(run.state(), ControlRunState::Error);
    assert_eq!(
        run.error(),
        Some(ControlRunError::MissingRequiredColumns {
            missing: vec!["reason".into(), "status".into()]
        })
    );
    assert_eq!(run.summary().error, 1);
    assert_eq!(tree.summary().severity["high"].error, 1);
}

#[test]
fn unknown_status_fails_the_run() {
    let client = Arc::new(
        FakeClient::default().script("c2", vec![Script::Rows(vec![row("passed", "r")])]),
    );
    let mut tree = build(LOCAL_MOD, "control.c2", client, options(1));
    tree.execute(&RunContext::background());
    assert_eq!(
        tree.control_runs()[0].error(),
        Some(ControlRunError::InvalidStatusValue {
            value: "passed".into()
        })
    );
}

#[test]
fn concurrent_sessions_never_exceed_max_parallel() {
    let max_parallel = 3;
    let mut toml = String::from("[mod]\nname = \"load\"\nchildren = [\"benchmark.all_checks\"]\n\n");
    let names: Vec<String> = (0..max_parallel * 4).map(|index| format!("check_{index}")).collect();
    let children: Vec<String> = names.iter().map(|name| format!("\"control.{name}\"")).collect();
    toml.push_str(&format!(
        "[[benchmark]]\nname = \"all_checks\"\nchildren = [{}]\n\n",
        children.join(", ")
    ));
    for name in &names {
        toml.push_str(&format!("[[control]]\nname = \"{name}\"\nsql = \"{name}\"\n\n"));
    }
    let client = Arc::new(FakeClient {
        max_delay_ms: 15,
        ..FakeClient::default()
    });
    let mut tree = build(&toml, "load", client.clone(), options(max_parallel));
    tree.execute(&RunContext::background());

    assert!(client.peak() <= max_parallel, "peak {}", client.peak());
    assert!(client.peak() >= 1);
    assert_eq!(tree.summary().status.ok, names.len() as u64);
    assert!(tree
        .control_runs()
        .iter()
        .all(|run| run.state() == ControlRunState::Complete));
    assert_eq!(client.counters.active.load(Ordering::SeqCst), 0);
}

#[test]
fn cancellation_stops_unstarted_runs_and_waits_for_running_ones() {
    let client = Arc::new(FakeClient::default().script("c1", vec![Script::Hang]));
    let mut tree = build(LOCAL_MOD, "benchmark.b", client.clone(), options(1));
    let ctx = RunContext::cancellable();
    let canceller = {
        let ctx = ctx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            ctx.cancel(Some("user interrupt".into()));
        })
    };
    let failed = tree.execute(&ctx);
    canceller.join().unwrap();

    let cause = ControlRunError::Cancelled(ContextError::Cancelled(Some("user interrupt".into())));
    let runs = tree.control_runs();
    assert_eq!(runs[0].attempts(), 1);
    assert_eq!(runs[1].attempts(), 0);
    for run in runs {
        assert_eq!(run.state(), ControlRunState::Error);
        assert_eq!(run.error(), Some(cause.clone()));
    }
    assert_eq!(failed, 2);
    assert_eq!(client.counters.active.load(Ordering::SeqCst), 0);
}

fn cancel_after(ctx: &RunContext, delay: Duration) -> std::thread::JoinHandle<()> {
    let ctx = ctx.clone();
    std::thread::spawn(move || {
        std::thread::sleep(delay);
        ctx.cancel(Some("user interrupt".into()));
    })
}

#[test]
fn cancel_during_dispatch_settles_before_execute_returns() {
    let client = Arc::new(FakeClient::default().script("c1", vec![Script::AwaitDone]));
    let mut opts = options(2);
    opts.cancel_grace = Duration::from_secs(30);
    let mut tree = build(LOCAL_MOD, "benchmark.b", client.clone(), opts);
    let ctx = RunContext::cancellable();
    let canceller = cancel_after(&ctx, Duration::from_millis(50));
    let started = std::time::Instant::now();
    let failed = tree.execute(&ctx);
    canceller.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(10), "{:?}", started.elapsed());
    let c1 = &tree.control_runs()[0];
    assert_eq!(c1.state(), ControlRunState::Error);
    assert_eq!(
        c1.error(),
        Some(ControlRunError::Cancelled(ContextError::Cancelled(Some(
            "user interrupt".into()
        ))))
    );
    assert!(tree.control_runs().iter().all(|run| run.state().is_terminal()));
    let root = assert_aggregates(&tree, tree.root());
    assert_eq!(failed, root.failed_count());
    assert!(root.error >= 1);
    assert_eq!(client.counters.active.load(Ordering::SeqCst), 0);
}

#[test]
fn run_ignoring_cancel_is_abandoned_after_the_grace_period() {
    let client = Arc::new(
        FakeClient::default().script("c2", vec![Script::Stall(Duration::from_secs(3))]),
    );
    let mut opts = options(1);
    opts.cancel_grace = Duration::from_millis(100);
    let mut tree = build(LOCAL_MOD, "control.c2", client, opts);
    let ctx = RunContext::cancellable();
    let canceller = cancel_after(&ctx, Duration::from_millis(50));
    let started = std::time::Instant::now();
    tree.execute(&ctx);
    let elapsed = started.elapsed();
    canceller.join().unwrap();

    assert!(elapsed >= Duration::from_millis(150), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
    assert_eq!(tree.control_runs()[0].state(), ControlRunState::Started);
}

#[test]
fn cancel_interrupts_a_slow_sqlite_query() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slow.db");
    rusqlite::Connection::open(&path).unwrap();
    let client = Arc::new(crate::client::SqliteClient::open(&path).unwrap());
    let workspace: Arc<dyn Workspace> = Arc::new(
        ModWorkspace::from_toml_str(
            r#"
[mod]
name = "slow"
children = ["control.spin"]

[[control]]
name = "spin"
sql = """
with recursive n(x) as (select 1 union all select x + 1 from n where x < 2000000000)
select 'ok' as status, 'r' as resource, 'spun' as reason from n where x = 2000000000
"""
"#,
        )
        .unwrap(),
    );
    let mut opts = options(1);
    opts.cancel_grace = Duration::from_secs(30);
    opts.query_timeout = Duration::from_secs(60);
    let mut tree =
        ExecutionTree::build(workspace, client, "slow", opts, Arc::new(NoopHooks)).unwrap();
    let ctx = RunContext::cancellable();
    let canceller = cancel_after(&ctx, Duration::from_millis(200));
    let started = std::time::Instant::now();
    assert_eq!(tree.execute(&ctx), 1);
    canceller.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(10), "{:?}", started.elapsed());
    let run = &tree.control_runs()[0];
    assert_eq!(run.state(), ControlRunState::Error);
    assert_eq!(
        run.error(),
        Some(ControlRunError::Cancelled(ContextError::Cancelled(Some(
            "user interrupt".into()
        ))))
    );
    assert_eq!(tree.summary().status.error, 1);
}

#[test]
fn pre_cancelled_context_dispatches_nothing() {
    let client = Arc::new(FakeClient::default());
    let mut tree = build(LOCAL_MOD, "local", client.clone(), options(2));
    let ctx = RunContext::cancellable();
    ctx.cancel(None);
    let failed = tree.execute(&ctx);

    assert_eq!(failed, tree.control_runs().len() as u64);
    assert_eq!(client.sessions.load(Ordering::SeqCst), 0);
    assert!(tree.control_runs().iter().all(|run| {
        run.error() == Some(ControlRunError::Cancelled(ContextError::Cancelled(None)))
    }));
}

#[test]
fn transient_failure_is_retried_once() {
    let client = Arc::new(FakeClient::default().script(
        "c2",
        vec![Script::Busy, Script::Rows(vec![row("ok", "r")])],
    ));
    let mut tree = build(LOCAL_MOD, "control.c2", client.clone(), options(1));
    assert_eq!(tree.execute(&RunContext::background()), 0);

    let run = &tree.control_runs()[0];
    assert_eq!(run.state(), ControlRunState::Complete);
    assert_eq!(run.attempts(), MAX_CONTROL_RUN_ATTEMPTS);
    assert_eq!(client.sessions.load(Ordering::SeqCst), 2);
}

#[test]
fn persistent_transient_failure_stops_at_the_attempt_cap() {
    let client = Arc::new(FakeClient::default().script("c2", vec![Script::Busy]));
    let mut tree = build(LOCAL_MOD, "control.c2", client.clone(), options(1));
    assert_eq!(tree.execute(&RunContext::background()), 1);

    let run = &tree.control_runs()[0];
    assert_eq!(run.attempts(), MAX_CONTROL_RUN_ATTEMPTS);
    assert_eq!(
        client.dispatches.load(Ordering::SeqCst),
        MAX_CONTROL_RUN_ATTEMPTS as usize
    );
    assert!(matches!(
        run.error(),
        Some(ControlRunError::BackendConnectivity { attempts, .. }) if attempts == MAX_CONTROL_RUN_ATTEMPTS
    ));
}

#[test]
fn rows_are_bucketed_by_status() {
    let client = Arc::new(FakeClient::default().script(
        "c2",
        vec![Script::Rows(vec![
            row("ok", "a"),
            row("error", "b"),
            row("alarm", "c"),
        ])],
    ));
    let mut tree = build(LOCAL_MOD, "control.c2", client, options(1));
    tree.execute(&RunContext::background());
    assert_eq!(
        statuses(&tree.control_runs()[0]),
        [ControlStatus::Error, ControlStatus::Alarm, ControlStatus::Ok]
    );
}

#[test]
fn dimension_colors_are_deterministic_and_distinct() {
    let make_client = || {
        Arc::new(
            FakeClient::default()
                .script(
                    "c1",
                    vec![Script::Rows(vec![
                        row_in("alarm", "a", "us"),
                        row_in("alarm", "b", "eu"),
                    ])],
                )
                .script(
                    "c2",
                    vec![Script::Rows(vec![
                        row_in("ok", "c", "eu"),
                        row_in("ok", "d", "ap"),
                    ])],
                ),
        )
    };
    let mut first = build(LOCAL_MOD, "benchmark.b", make_client(), options(2));
    let mut second = build(LOCAL_MOD, "benchmark.b", make_client(), options(1));
    first.execute(&RunContext::background());
    second.execute(&RunContext::background());

    let expected: BTreeMap<String, u8> = [("us", 175), ("eu", 177), ("ap", 181)]
        .into_iter()
        .map(|(value, code)| (value.to_string(), code))
        .collect();
    assert_eq!(first.dimension_colors()["region"], expected);
    assert_eq!(first.dimension_colors(), second.dimension_colors());
}

#[test]
fn dry_run_completes_without_sessions() {
    let client = Arc::new(FakeClient::default());
    let mut opts = options(2);
    opts.dry_run = true;
    let mut tree = build(LOCAL_MOD, "local", client.clone(), opts);
    assert_eq!(tree.execute(&RunContext::background()), 0);
    assert_eq!(client.sessions.load(Ordering::SeqCst), 0);
    for run in tree.control_runs() {
        assert_eq!(run.state(), ControlRunState::Complete);
        assert_eq!(run.summary(), StatusSummary::default());
    }
}

#[test]
fn slow_query_times_out() {
    let client = Arc::new(FakeClient::default().script("c2", vec![Script::Hang]));
    let mut opts = options(1);
    opts.query_timeout = Duration::from_millis(50);
    let mut tree = build(LOCAL_MOD, "control.c2", client, opts);
    assert_eq!(tree.execute(&RunContext::background()), 1);
    let run = &tree.control_runs()[0];
    assert_eq!(run.error(), Some(ControlRunError::TimedOut));
    assert_eq!(run.error().unwrap().to_string(), "control execution timed out");
}

#[test]
fn panicking_run_is_recorded_and_releases_its_permit() {
    let client = Arc::new(FakeClient::default().script("c1", vec![Script::Panic]));
    let mut tree = build(LOCAL_MOD, "benchmark.b", client, options(1));
    assert_eq!(tree.execute(&RunContext::background()), 1);
    let runs = tree.control_runs();
    assert_eq!(runs[0].error(), Some(ControlRunError::Panicked("boom".into())));
    assert_eq!(runs[1].state(), ControlRunState::Complete);
}

#[test]
fn partial_rows_survive_a_stream_failure() {
    let client = Arc::new(FakeClient::default().script(
        "c2",
        vec![Script::RowsThenFail(vec![row("ok", "a"), row("alarm", "b")])],
    ));
    let mut tree = build(LOCAL_MOD, "control.c2", client, options(1));
    assert_eq!(tree.execute(&RunContext::background()), 2);
    let run = &tree.control_runs()[0];
    assert!(matches!(run.error(), Some(ControlRunError::RowStream(_))));
    let summary = run.summary();
    assert_eq!((summary.ok, summary.alarm, summary.error), (1, 1, 1));
}

#[test]
fn search_path_prefix_is_applied_to_the_session() {
    let client = Arc::new(FakeClient::default());
    let mut tree = build(LOCAL_MOD, "control.c3", client.clone(), options(1));
    tree.execute(&RunContext::background());
    assert_eq!(
        *client.search_paths.lock().unwrap(),
        vec![vec!["aws".to_string(), "main".to_string()]]
    );
    assert!(tree.control_runs()[0].session_id().is_some());
}

#[derive(Clone, Default)]
struct Lines(Arc<Mutex<Vec<String>>>);

impl StatusSink for Lines {
    fn publish(&self, line: &str) {
        self.0.lock().unwrap().push(line.to_string());
    }
}

#[test]
fn progress_counts_every_run() {
    let lines = Lines::default();
    let progress = Arc::new(ControlProgress::new(lines.clone()));
    let workspace: Arc<dyn Workspace> = Arc::new(ModWorkspace::from_toml_str(LOCAL_MOD).unwrap());
    let client = Arc::new(FakeClient::default().script("c2", vec![Script::Busy]));
    let mut tree = ExecutionTree::build(
        workspace,
        client,
        "benchmark.b",
        options(2),
        progress.clone(),
    )
    .unwrap();
    tree.execute(&RunContext::background());

    let counts = progress.counts();
    assert_eq!(
        counts,
        ProgressCounts {
            total: 2,
            pending: 0,
            executing: 0,
            complete: 1,
            error: 1,
        }
    );
    let lines = lines.0.lock().unwrap();
    assert_eq!(lines.first().unwrap(), "Running 2 controls. (0 complete, 0 running, 2 pending, 0 errors)");
}

#[test]
fn conflicting_filters_abort_the_build() {
    let workspace: Arc<dyn Workspace> = Arc::new(ModWorkspace::from_toml_str(LOCAL_MOD).unwrap());
    let mut opts = options(1);
    opts.filter = ControlFilter {
        where_clause: Some("1 = 1".into()),
        tags: vec!["service=s3".into()],
    };
    let result = ExecutionTree::build(
        workspace,
        Arc::new(FakeClient::default()),
        "local",
        opts,
        Arc::new(NoopHooks),
    );
    assert!(matches!(
        result.err(),
        Some(TreeError::Filter(FilterError::Conflict))
    ));
}
