//! End to end runs of a two operator plan, with and without failures.
//!
//! The `collector` writes to an external sink that remembers the last
//! window it wrote, which is how a sink makes replayed windows
//! harmless. Every run must deliver each number exactly once, in
//! order.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tidewater::dataflow::LogicalPlan;
use tidewater::errors::PersistenceError;
use tidewater::errors::WorkerFailure;
use tidewater::heartbeat::HeartbeatBatch;
use tidewater::heartbeat::MonitoringSink;
use tidewater::operators::CheckpointListener;
use tidewater::operators::Emission;
use tidewater::operators::Emitter;
use tidewater::operators::Operator;
use tidewater::operators::Tuple;
use tidewater::recovery::CheckpointInfo;
use tidewater::recovery::CheckpointStore;
use tidewater::recovery::InMemStore;
use tidewater::recovery::OperatorId;
use tidewater::recovery::SqliteStore;
use tidewater::recovery::StateBytes;
use tidewater::BoxError;
use tidewater::ExecutionError;
use tidewater::LocalCluster;
use tidewater::WindowId;

const VALUES: u64 = 30;

/// Everything that outlives operator instances.
#[derive(Default)]
struct Shared {
    output: Mutex<Vec<u64>>,
    /// Last window written to `output`.
    high_water: Mutex<Option<WindowId>>,
    first_checkpoint: Mutex<Option<WindowId>>,
    commits: Mutex<Vec<WindowId>>,
    source_failed: AtomicBool,
    collector_failed: AtomicBool,
}

impl Shared {
    fn output(&self) -> Vec<u64> {
        self.output.lock().clone()
    }

    fn assert_commits_increase(&self) {
        let commits = self.commits.lock();
        assert!(
            commits.windows(2).all(|pair| pair[0] < pair[1]),
            "commits went backwards: {commits:?}"
        );
    }
}

struct Counter {
    next: u64,
    limit: u64,
    fail_at: Option<u64>,
    shared: Arc<Shared>,
}

impl Operator for Counter {
    fn emit(&mut self, _window: WindowId, out: &mut Emitter) -> Result<Emission, BoxError> {
        if self.fail_at == Some(self.next) && !self.shared.source_failed.swap(true, Ordering::SeqCst) {
            return Err(format!("source gave up at {}", self.next).into());
        }
        if self.next < self.limit {
            out.emit(json!(self.next));
            self.next += 1;
        }
        Ok(if self.next >= self.limit {
            Emission::Done
        } else {
            Emission::More
        })
    }

    fn snapshot(&self) -> Result<StateBytes, BoxError> {
        Ok(StateBytes::ser(&self.next)?)
    }

    fn restore(&mut self, state: StateBytes) -> Result<(), BoxError> {
        self.next = state.de()?;
        Ok(())
    }
}

struct Collector {
    pending: Vec<u64>,
    windows: u64,
    fail_commit: bool,
    shared: Arc<Shared>,
}

impl Operator for Collector {
    fn begin_window(&mut self, _window: WindowId) -> Result<(), BoxError> {
        self.pending.clear();
        Ok(())
    }

    fn process(&mut self, _port: usize, tuple: Tuple, _out: &mut Emitter) -> Result<(), BoxError> {
        let value = tuple.payload.as_u64().ok_or("payload is not a number")?;
        self.pending.push(value);
        Ok(())
    }

    fn end_window(&mut self, window: WindowId, _out: &mut Emitter) -> Result<(), BoxError> {
        let mut high_water = self.shared.high_water.lock();
        if high_water.map_or(true, |written| window > written) {
            self.shared.output.lock().extend(self.pending.drain(..));
            *high_water = Some(window);
        }
        self.windows += 1;
        Ok(())
    }

    fn snapshot(&self) -> Result<StateBytes, BoxError> {
        Ok(StateBytes::ser(&self.windows)?)
    }

    fn restore(&mut self, state: StateBytes) -> Result<(), BoxError> {
        self.windows = state.de()?;
        Ok(())
    }

    fn as_checkpoint_listener(&mut self) -> Option<&mut dyn CheckpointListener> {
        Some(self)
    }
}

impl CheckpointListener for Collector {
    fn checkpointed(&mut self, window: WindowId) -> Result<(), BoxError> {
        self.shared.first_checkpoint.lock().get_or_insert(window);
        Ok(())
    }

    fn committed(&mut self, window: WindowId) -> Result<(), BoxError> {
        let past_first = self
            .shared
            .first_checkpoint
            .lock()
            .map_or(false, |first| window > first);
        if self.fail_commit && past_first && !self.shared.collector_failed.swap(true, Ordering::SeqCst) {
            return Err(format!("commit listener failed at {window}").into());
        }
        self.shared.commits.lock().push(window);
        Ok(())
    }
}

#[derive(Clone, Copy, Default)]
struct Scenario {
    limit: u64,
    source_fail_at: Option<u64>,
    fail_commit: bool,
    inline: bool,
    source_window_count: Option<u32>,
    collector_window_count: Option<u32>,
    window_millis: Option<u64>,
    heartbeat_millis: Option<u64>,
}

impl Scenario {
    fn new() -> Self {
        Self {
            limit: VALUES,
            ..Default::default()
        }
    }
}

fn build_plan(shared: &Arc<Shared>, scenario: Scenario) -> LogicalPlan {
    tidewater::logging::setup_logging(Some("warn")).unwrap();

    let mut plan = LogicalPlan::new().unwrap();
    let keys = plan.keys().clone();
    {
        let app = plan.attributes();
        app.attr(&keys.checkpoint_window_count).unwrap().set(2);
        // Shorter than production windows to keep the suite fast;
        // `collector_failure_recovered_at_production_window_size` runs
        // at 300 ms.
        app.attr(&keys.streaming_window_size_millis)
            .unwrap()
            .set(scenario.window_millis.unwrap_or(20));
        app.attr(&keys.heartbeat_interval_millis)
            .unwrap()
            .set(scenario.heartbeat_millis.unwrap_or(50));
    }

    let source_shared = shared.clone();
    let source = plan
        .add_operator("source", move || Counter {
            next: 0,
            limit: scenario.limit,
            fail_at: scenario.source_fail_at,
            shared: source_shared.clone(),
        })
        .unwrap()
        .attributes();
    source.attr(&keys.idle_timeout_millis).unwrap().set(50);
    if let Some(count) = scenario.source_window_count {
        source
            .attr(&keys.operator_checkpoint_window_count)
            .unwrap()
            .set(count);
    }

    let collector_shared = shared.clone();
    let collector = plan
        .add_operator("collector", move || Collector {
            pending: Vec::new(),
            windows: 0,
            fail_commit: scenario.fail_commit,
            shared: collector_shared.clone(),
        })
        .unwrap()
        .attributes();
    collector.attr(&keys.idle_timeout_millis).unwrap().set(50);
    if let Some(count) = scenario.collector_window_count {
        collector
            .attr(&keys.operator_checkpoint_window_count)
            .unwrap()
            .set(count);
    }

    plan.add_stream("numbers", "source", &["collector"])
        .unwrap()
        .set_inline(scenario.inline);
    plan
}

fn expected() -> Vec<u64> {
    (0..VALUES).collect()
}

/// Every window id each operator reported through heartbeats.
#[derive(Default)]
struct WindowsSeen(Mutex<BTreeMap<OperatorId, BTreeSet<WindowId>>>);

impl WindowsSeen {
    fn of(&self, operator: &str) -> BTreeSet<WindowId> {
        self.0
            .lock()
            .get(&OperatorId::new(operator))
            .cloned()
            .unwrap_or_default()
    }
}

impl MonitoringSink for WindowsSeen {
    fn forward(&self, batch: &HeartbeatBatch) {
        self.0
            .lock()
            .entry(batch.operator.clone())
            .or_default()
            .extend(batch.samples.iter().map(|sample| sample.window_id));
    }
}

#[test]
fn no_failure_delivers_everything_once() {
    let shared = Arc::new(Shared::default());
    let plan = build_plan(&shared, Scenario::new());
    let summary = LocalCluster::new(plan, Arc::new(InMemStore::new()))
        .run()
        .unwrap();

    assert_eq!(shared.output(), expected());
    assert_eq!(summary.restarts, 0);
    assert!(!summary.terminated);
    assert!(summary.committed.contains_key(&OperatorId::new("collector")));
    shared.assert_commits_increase();
}

#[test]
fn collector_failure_is_recovered() {
    let shared = Arc::new(Shared::default());
    let plan = build_plan(
        &shared,
        Scenario {
            fail_commit: true,
            ..Scenario::new()
        },
    );
    let summary = LocalCluster::new(plan, Arc::new(InMemStore::new()))
        .run()
        .unwrap();

    assert!(shared.collector_failed.load(Ordering::SeqCst));
    assert_eq!(summary.restarts, 1);
    assert_eq!(shared.output(), expected());
    shared.assert_commits_increase();
}

#[test]
fn inline_collector_failure_restarts_whole_unit() {
    let shared = Arc::new(Shared::default());
    let plan = build_plan(
        &shared,
        Scenario {
            fail_commit: true,
            inline: true,
            ..Scenario::new()
        },
    );
    let summary = LocalCluster::new(plan, Arc::new(InMemStore::new()))
        .run()
        .unwrap();

    assert_eq!(summary.restarts, 1);
    assert_eq!(shared.output(), expected());
    shared.assert_commits_increase();
}

#[test]
fn source_failure_replays_identical_windows() {
    let shared = Arc::new(Shared::default());
    let plan = build_plan(
        &shared,
        Scenario {
            source_fail_at: Some(10),
            ..Scenario::new()
        },
    );
    let summary = LocalCluster::new(plan, Arc::new(InMemStore::new()))
        .run()
        .unwrap();

    assert!(shared.source_failed.load(Ordering::SeqCst));
    assert_eq!(summary.restarts, 1);
    assert_eq!(shared.output(), expected());
    shared.assert_commits_increase();
}

#[test]
fn terminate_handle_stops_endless_run() {
    let shared = Arc::new(Shared::default());
    let plan = build_plan(
        &shared,
        Scenario {
            limit: u64::MAX,
            ..Scenario::new()
        },
    );
    let cluster = LocalCluster::new(plan, Arc::new(InMemStore::new()));
    let handle = cluster.terminate_handle();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        handle.terminate();
    });
    let summary = cluster.run().unwrap();
    stopper.join().unwrap();

    assert!(summary.terminated);
    assert_eq!(summary.restarts, 0);
    let output = shared.output();
    assert!(!output.is_empty());
    assert_eq!(output, (0..output.len() as u64).collect::<Vec<_>>());
}

#[test]
fn resumes_from_sqlite_after_termination() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.sqlite3");
    let shared = Arc::new(Shared::default());
    let scenario = Scenario {
        source_window_count: Some(1),
        collector_window_count: Some(3),
        ..Scenario::new()
    };

    let cluster = LocalCluster::new(
        build_plan(&shared, scenario),
        Arc::new(SqliteStore::open(&path).unwrap()),
    );
    let handle = cluster.terminate_handle();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(250));
        handle.terminate();
    });
    cluster.run().unwrap();
    stopper.join().unwrap();

    let summary = LocalCluster::new(
        build_plan(&shared, scenario),
        Arc::new(SqliteStore::open(&path).unwrap()),
    )
    .run()
    .unwrap();

    assert!(!summary.terminated);
    assert_eq!(shared.output(), expected());
}

/// Delegates everything but refuses to save.
struct ReadOnlyStore(InMemStore);

impl CheckpointStore for ReadOnlyStore {
    fn save(
        &self,
        _operator: &OperatorId,
        _window: WindowId,
        _state: &StateBytes,
    ) -> Result<CheckpointInfo, PersistenceError> {
        Err(PersistenceError::Unavailable("read only".to_owned()))
    }

    fn load(
        &self,
        operator: &OperatorId,
        window: WindowId,
    ) -> Result<Option<(WindowId, StateBytes)>, PersistenceError> {
        self.0.load(operator, window)
    }

    fn list(&self, operator: &OperatorId) -> Result<Vec<CheckpointInfo>, PersistenceError> {
        self.0.list(operator)
    }

    fn purge_before(
        &self,
        operator: &OperatorId,
        window: WindowId,
    ) -> Result<usize, PersistenceError> {
        self.0.purge_before(operator, window)
    }

    fn discard_after(
        &self,
        operator: &OperatorId,
        keep_through: Option<WindowId>,
    ) -> Result<usize, PersistenceError> {
        self.0.discard_after(operator, keep_through)
    }
}

#[test]
fn persistent_backup_failures_exhaust_restarts() {
    let shared = Arc::new(Shared::default());
    let plan = build_plan(
        &shared,
        Scenario {
            limit: u64::MAX,
            source_window_count: Some(1),
            collector_window_count: Some(1),
            ..Scenario::new()
        },
    );
    {
        let keys = plan.keys().clone();
        let app = plan.attributes();
        app.attr(&keys.checkpoint_max_failures).unwrap().set(2);
        app.attr(&keys.operator_max_restarts).unwrap().set(1);
    }

    let err = LocalCluster::new(plan, Arc::new(ReadOnlyStore(InMemStore::new())))
        .run()
        .unwrap_err();
    match err {
        ExecutionError::RestartsExhausted {
            budget,
            source: WorkerFailure::BackupsExhausted { attempts, .. },
            ..
        } => {
            assert_eq!(budget, 1);
            assert_eq!(attempts, 2);
        }
        other => panic!("expected exhausted restarts, got {other}"),
    }
}

#[test]
fn collector_failure_recovered_at_production_window_size() {
    for inline in [false, true] {
        let shared = Arc::new(Shared::default());
        let plan = build_plan(
            &shared,
            Scenario {
                limit: 10,
                fail_commit: true,
                inline,
                window_millis: Some(300),
                ..Scenario::new()
            },
        );
        let summary = LocalCluster::new(plan, Arc::new(InMemStore::new()))
            .run()
            .unwrap();

        assert!(shared.collector_failed.load(Ordering::SeqCst), "inline: {inline}");
        assert_eq!(summary.restarts, 1, "inline: {inline}");
        assert_eq!(shared.output(), (0..10).collect::<Vec<_>>(), "inline: {inline}");
        shared.assert_commits_increase();
    }
}

#[test]
fn replaced_instance_heartbeats_are_forwarded() {
    let shared = Arc::new(Shared::default());
    let plan = build_plan(
        &shared,
        Scenario {
            fail_commit: true,
            // Only redeploys and the end of the run drain heartbeats.
            heartbeat_millis: Some(60_000),
            ..Scenario::new()
        },
    );
    let seen = Arc::new(WindowsSeen::default());
    let summary = LocalCluster::new(plan, Arc::new(InMemStore::new()))
        .with_sink(seen.clone())
        .run()
        .unwrap();

    assert_eq!(summary.restarts, 1);
    let source = seen.of("source");
    assert_eq!(source.len() as u64, VALUES);
    // Windows before the restored checkpoint were only ever processed
    // by the failed instance.
    assert_eq!(seen.of("collector"), source);
}
