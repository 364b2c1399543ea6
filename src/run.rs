//! Running a plan in the current process.
//!
//! [`LocalCluster::run`] is the root of all the action. It deploys one
//! worker thread per operator and then turns the calling thread into
//! the supervisor, which:
//!
//! - receives worker events,
//! - ticks the [`CheckpointCoordinator`],
//! - drains heartbeats into the [`HeartbeatReporter`] and asks
//!   workers for reports,
//! - redeploys the execution unit of a failed operator.
//!
//! Restarting
//! ----------
//!
//! When an operator fails, every unfinished operator of its unit is
//! terminated, joined and started again from its newest checkpoint.
//! Other units keep running; the stream buffers between them hold
//! every window not yet committed by all consumers, so a restarted
//! operator can re-read its inputs and its re-published output is
//! dropped as already seen.
//!
//! Each operator may fail `operator_max_restarts` times. One more
//! failure ends the run with [`ExecutionError::RestartsExhausted`].

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;

use crate::attributes::defaults;
use crate::attributes::ApplicationScope;
use crate::buffer::StreamBuffer;
use crate::context::ExecutionContext;
use crate::coordinator::CheckpointCoordinator;
use crate::dataflow::LogicalPlan;
use crate::dataflow::StreamId;
use crate::dataflow::Topology;
use crate::errors::ConfigError;
use crate::errors::ExecutionError;
use crate::heartbeat::HeartbeatReporter;
use crate::heartbeat::LoggingSink;
use crate::heartbeat::MonitoringSink;
use crate::recovery::CheckpointStore;
use crate::recovery::OperatorId;
use crate::window::WindowId;
use crate::worker;
use crate::worker::Resume;
use crate::worker::WorkerEvent;
use crate::worker::WorkerEventKind;
use crate::worker::WorkerSpec;

/// Prefix of environment variables overriding application
/// attributes, e.g. `TIDEWATER_CHECKPOINT_WINDOW_COUNT`.
pub const ENV_PREFIX: &str = "TIDEWATER_";

/// Stops a running [`LocalCluster`] from another thread.
#[derive(Debug, Clone)]
pub struct TerminateHandle(Arc<AtomicBool>);

impl TerminateHandle {
    /// Ask every worker to stop at its next boundary. The run then
    /// returns normally.
    pub fn terminate(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// What happened during a run that didn't fail.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Operator failures recovered from.
    pub restarts: u32,
    /// Last committed window of every operator that had one.
    pub committed: BTreeMap<OperatorId, WindowId>,
    /// Stopped through a [`TerminateHandle`] rather than finishing.
    pub terminated: bool,
}

pub struct LocalCluster {
    plan: LogicalPlan,
    store: Arc<dyn CheckpointStore>,
    reporter: HeartbeatReporter,
    terminate: Arc<AtomicBool>,
}

impl LocalCluster {
    pub fn new(plan: LogicalPlan, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            plan,
            store,
            reporter: HeartbeatReporter::new(vec![Arc::new(LoggingSink)]),
            terminate: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Also forward heartbeats to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn MonitoringSink>) -> Self {
        self.reporter.add_sink(sink);
        self
    }

    pub fn terminate_handle(&self) -> TerminateHandle {
        TerminateHandle(self.terminate.clone())
    }

    /// Run the plan until every operator finished, the run was
    /// terminated, or it failed.
    ///
    /// Blocks the calling thread, which acts as the supervisor.
    #[tracing::instrument(name = "local_cluster", skip_all)]
    pub fn run(self) -> Result<RunSummary, ExecutionError> {
        let Self {
            plan,
            store,
            reporter,
            terminate,
        } = self;

        let app = plan.attributes();
        let keys = plan.keys().clone();
        let overridden = app.apply_env_overrides::<ApplicationScope>(ENV_PREFIX)?;
        if overridden > 0 {
            tracing::info!("Applied {overridden} attribute overrides from the environment");
        }

        let units = plan.assign_units()?;
        let topology = Arc::new(plan.validate()?);
        let buffers: HashMap<StreamId, Arc<StreamBuffer>> = topology
            .streams()
            .map(|stream| (stream.clone(), Arc::new(StreamBuffer::new(stream.to_string()))))
            .collect();

        let app_window_count =
            app.attr_value(&keys.checkpoint_window_count, defaults::CHECKPOINT_WINDOW_COUNT);
        let window_counts: HashMap<OperatorId, u32> = plan
            .operators()
            .iter()
            .map(|meta| {
                let count = meta
                    .attributes()
                    .attr_value(&keys.operator_checkpoint_window_count, app_window_count);
                (meta.id().clone(), count)
            })
            .collect();
        let mut coordinator = CheckpointCoordinator::new(
            topology.clone(),
            store.clone(),
            buffers.clone(),
            &window_counts,
        )?;
        let resume = coordinator.resume_points()?;

        let window_width = Duration::from_millis(app.attr_value(
            &keys.streaming_window_size_millis,
            defaults::STREAMING_WINDOW_SIZE_MILLIS,
        ));
        if window_width.is_zero() {
            return Err(ConfigError::invalid_value(
                keys.streaming_window_size_millis.name(),
                "must be at least 1",
            )
            .into());
        }
        let heartbeat_interval = Duration::from_millis(
            app.attr_value(&keys.heartbeat_interval_millis, defaults::HEARTBEAT_INTERVAL_MILLIS)
                .max(1),
        );
        let (events_tx, events_rx) = mpsc::channel();

        let mut supervisor = Supervisor {
            unit_of: units
                .iter()
                .flat_map(|unit| unit.operators.iter().map(|op| (op.clone(), unit.index)))
                .collect(),
            units: units
                .into_iter()
                .map(|unit| (unit.index, unit.operators))
                .collect(),
            max_backup_failures: app
                .attr_value(&keys.checkpoint_max_failures, defaults::CHECKPOINT_MAX_FAILURES),
            max_restarts: app
                .attr_value(&keys.operator_max_restarts, defaults::OPERATOR_MAX_RESTARTS),
            start_window: WindowId::starting_at(Utc::now()),
            plan: &plan,
            topology,
            store,
            buffers,
            coordinator,
            reporter,
            events_tx,
            events_rx,
            window_width,
            heartbeat_interval,
            deployed: BTreeMap::new(),
            restarts: HashMap::new(),
            total_restarts: 0,
        };
        tracing::info!(
            "Starting {} operators in {} units at {}",
            supervisor.unit_of.len(),
            supervisor.units.len(),
            supervisor.start_window
        );

        let ops: Vec<OperatorId> = supervisor.topology.order().to_vec();
        for op in &ops {
            let resume = match resume.get(op).copied().flatten() {
                Some(window) => Resume::At(window),
                None => Resume::Fresh,
            };
            if let Err(err) = supervisor.deploy(op, resume) {
                supervisor.terminate_all();
                return Err(err);
            }
        }

        match supervisor.supervise(&terminate) {
            Ok(summary) => Ok(summary),
            Err(err) => {
                tracing::error!("Run failed: {err}");
                supervisor.terminate_all();
                Err(err)
            }
        }
    }
}

struct Deployed {
    unit: usize,
    ctx: Arc<ExecutionContext>,
    handle: Option<JoinHandle<()>>,
    incarnation: u32,
    running: bool,
    finished: bool,
}

impl Deployed {
    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                // Panics are caught in the worker; this is the event
                // send itself panicking.
                tracing::error!("Worker thread of {} died", self.ctx.operator());
            }
        }
    }
}

struct Supervisor<'a> {
    plan: &'a LogicalPlan,
    topology: Arc<Topology>,
    store: Arc<dyn CheckpointStore>,
    buffers: HashMap<StreamId, Arc<StreamBuffer>>,
    coordinator: CheckpointCoordinator,
    reporter: HeartbeatReporter,
    events_tx: Sender<WorkerEvent>,
    events_rx: Receiver<WorkerEvent>,
    units: BTreeMap<usize, Vec<OperatorId>>,
    unit_of: HashMap<OperatorId, usize>,
    start_window: WindowId,
    window_width: Duration,
    heartbeat_interval: Duration,
    max_backup_failures: u32,
    max_restarts: u32,
    deployed: BTreeMap<OperatorId, Deployed>,
    restarts: HashMap<OperatorId, u32>,
    total_restarts: u32,
}

impl<'a> Supervisor<'a> {
    fn deploy(&mut self, op: &OperatorId, resume: Resume) -> Result<(), ExecutionError> {
        let meta = self
            .plan
            .operator(op.as_str())
            .ok_or_else(|| ConfigError::invalid_plan(format!("unknown operator `{op}`")))?;
        if let Some(prev) = self.deployed.get(op) {
            // Forward what the replaced instance recorded since the last
            // heartbeat before its context is dropped.
            self.reporter.drain(std::iter::once(prev.ctx.as_ref()));
        }
        let keys = self.plan.keys();
        let idle_timeout = Duration::from_millis(
            meta.attributes()
                .attr_value(&keys.idle_timeout_millis, defaults::IDLE_TIMEOUT_MILLIS)
                .max(1),
        );
        let ctx = Arc::new(ExecutionContext::new(
            op.clone(),
            meta.attributes_arc(),
            idle_timeout,
        ));
        let unit = self.unit_of.get(op).copied().unwrap_or_default();
        let incarnation = self
            .deployed
            .get(op)
            .map_or(0, |prev| prev.incarnation + 1);

        let spec = WorkerSpec {
            operator: meta.build(),
            ctx: ctx.clone(),
            store: self.store.clone(),
            inputs: self
                .topology
                .inputs(op)
                .iter()
                .filter_map(|stream| self.buffers.get(stream).cloned())
                .collect(),
            output: self
                .topology
                .output(op)
                .and_then(|stream| self.buffers.get(stream).cloned()),
            events: self.events_tx.clone(),
            incarnation,
            resume,
            start_window: self.start_window,
            window_width: self.window_width,
            max_backup_failures: self.max_backup_failures,
        };
        let handle = worker::spawn(unit, spec).map_err(|source| ExecutionError::Spawn {
            operator: op.clone(),
            source,
        })?;
        tracing::debug!("Deployed {op} in unit {unit}, incarnation {incarnation}, {resume:?}");

        self.coordinator.attach(op, ctx.clone());
        self.deployed.insert(
            op.clone(),
            Deployed {
                unit,
                ctx,
                handle: Some(handle),
                incarnation,
                running: true,
                finished: false,
            },
        );
        Ok(())
    }

    /// Stop every unfinished operator of `unit` and start it again
    /// from its newest checkpoint.
    fn redeploy_unit(&mut self, unit: usize) -> Result<(), ExecutionError> {
        let ops = self.units.get(&unit).cloned().unwrap_or_default();
        for op in &ops {
            if let Some(deployed) = self.deployed.get(op) {
                if deployed.running {
                    deployed.ctx.request_terminate();
                }
            }
        }
        for op in &ops {
            if let Some(deployed) = self.deployed.get_mut(op) {
                deployed.join();
                deployed.running = false;
                self.coordinator.detach(op);
            }
        }
        for op in &ops {
            let finished = self.deployed.get(op).map_or(false, |d| d.finished);
            if !finished {
                self.deploy(op, Resume::Latest)?;
            }
        }
        Ok(())
    }

    fn handle(&mut self, event: WorkerEvent) -> Result<(), ExecutionError> {
        let WorkerEvent {
            operator,
            incarnation,
            kind,
        } = event;
        // Durable no matter which instance wrote it.
        if let WorkerEventKind::Checkpointed(info) = &kind {
            self.coordinator.on_checkpointed(&operator, info);
            return Ok(());
        }
        let Some(deployed) = self.deployed.get_mut(&operator) else {
            return Ok(());
        };
        if deployed.incarnation != incarnation {
            tracing::trace!("Ignoring {kind:?} of replaced {operator} incarnation {incarnation}");
            return Ok(());
        }

        match kind {
            WorkerEventKind::Checkpointed(_) => {}
            WorkerEventKind::Report {
                last_window,
                windows_processed,
            } => {
                tracing::trace!("{operator} at {last_window:?} after {windows_processed} windows");
            }
            WorkerEventKind::Finished => {
                deployed.running = false;
                deployed.finished = true;
                deployed.join();
                self.coordinator.detach(&operator);
            }
            WorkerEventKind::Terminated => {
                deployed.running = false;
                deployed.join();
                self.coordinator.detach(&operator);
            }
            WorkerEventKind::Failed(failure) => {
                deployed.running = false;
                deployed.join();
                let unit = deployed.unit;
                self.coordinator.detach(&operator);

                let restarts = self.restarts.entry(operator.clone()).or_default();
                *restarts += 1;
                if *restarts > self.max_restarts {
                    return Err(ExecutionError::RestartsExhausted {
                        operator,
                        budget: self.max_restarts,
                        source: failure,
                    });
                }
                tracing::warn!(
                    "Restarting unit {unit} after failure {}/{} of {operator}: {failure}",
                    restarts,
                    self.max_restarts
                );
                self.total_restarts += 1;
                self.redeploy_unit(unit)?;
            }
            WorkerEventKind::Panicked(msg) => {
                deployed.running = false;
                deployed.join();
                tracing::error!("{operator} panicked: {msg}");
                return Err(ExecutionError::Panicked(operator));
            }
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.deployed.values().any(|deployed| deployed.running)
    }

    fn supervise(&mut self, terminate: &AtomicBool) -> Result<RunSummary, ExecutionError> {
        let poll = self.window_width.min(self.heartbeat_interval);
        let mut last_heartbeat = Instant::now();
        let mut terminating = false;

        while self.is_running() {
            match self.events_rx.recv_timeout(poll) {
                Ok(event) => {
                    self.handle(event)?;
                    while let Ok(event) = self.events_rx.try_recv() {
                        self.handle(event)?;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                // We hold a sender ourselves.
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if !terminating && terminate.load(Ordering::Acquire) {
                tracing::info!("Terminating run");
                terminating = true;
            }
            if terminating {
                for deployed in self.deployed.values().filter(|d| d.running) {
                    deployed.ctx.request_terminate();
                }
            }

            if let Err(err) = self.coordinator.tick() {
                tracing::warn!("Checkpoint coordination failed, retrying next tick: {err}");
            }
            if last_heartbeat.elapsed() >= self.heartbeat_interval {
                self.heartbeat();
                last_heartbeat = Instant::now();
            }
        }

        // Pick up the final checkpoints.
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle(event)?;
        }
        self.coordinator.tick()?;
        self.heartbeat();

        let committed = self
            .topology
            .order()
            .iter()
            .filter_map(|op| {
                let window = self.coordinator.state(op)?.last_committed()?;
                Some((op.clone(), window))
            })
            .collect();
        let summary = RunSummary {
            restarts: self.total_restarts,
            committed,
            terminated: terminating,
        };
        tracing::info!("Run complete: {summary:?}");
        Ok(summary)
    }

    fn heartbeat(&mut self) {
        self.reporter
            .drain(self.deployed.values().map(|deployed| deployed.ctx.as_ref()));
        for deployed in self.deployed.values().filter(|d| d.running) {
            deployed.ctx.request_report();
        }
    }

    /// Stop and join everything still running.
    fn terminate_all(&mut self) {
        for deployed in self.deployed.values().filter(|d| d.running) {
            deployed.ctx.request_terminate();
        }
        for deployed in self.deployed.values_mut() {
            deployed.join();
            deployed.running = false;
        }
    }
}
