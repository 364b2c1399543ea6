//! Definition of a worker: the thread driving one operator instance.
//!
//! The worker runs its operator one window at a time. Between two
//! windows it is at its **boundary**, the only point where it looks at
//! what the rest of the system wants from it: an outstanding request
//! on its [`ExecutionContext`] and any commit the coordinator posted.
//! Waiting for input is bounded by the idle timeout, so a starved
//! worker still comes back to its boundary regularly.
//!
//! Workers never report to the supervisor by returning; everything
//! goes over the event channel, tagged with the incarnation so events
//! of a replaced instance can be told apart.

use std::panic::AssertUnwindSafe;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::buffer::Next;
use crate::buffer::StreamBuffer;
use crate::context::ExecutionContext;
use crate::context::RequestType;
use crate::errors::prepend_tname;
use crate::errors::BoxError;
use crate::errors::ListenerError;
use crate::errors::PersistenceError;
use crate::errors::WorkerFailure;
use crate::metrics::WorkerMetrics;
use crate::operators::Emission;
use crate::operators::Emitter;
use crate::operators::Operator;
use crate::operators::Tuple;
use crate::recovery::CheckpointInfo;
use crate::recovery::CheckpointStore;
use crate::recovery::OperatorId;
use crate::window::WindowClock;
use crate::window::WindowId;
use crate::with_timer;

/// Something a worker tells the supervisor.
#[derive(Debug)]
pub(crate) struct WorkerEvent {
    pub(crate) operator: OperatorId,
    pub(crate) incarnation: u32,
    pub(crate) kind: WorkerEventKind,
}

#[derive(Debug)]
pub(crate) enum WorkerEventKind {
    Checkpointed(CheckpointInfo),
    /// Answer to a report request.
    Report {
        last_window: Option<WindowId>,
        windows_processed: u64,
    },
    /// Every input ended and the output was closed.
    Finished,
    Terminated,
    Failed(WorkerFailure),
    Panicked(String),
}

/// Where a new instance picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resume {
    /// From the start of the run.
    Fresh,
    /// From the newest checkpoint in the store, if any.
    Latest,
    /// From the newest checkpoint at or before a window.
    At(WindowId),
}

/// Everything a worker thread needs.
pub(crate) struct WorkerSpec {
    pub(crate) operator: Box<dyn Operator>,
    pub(crate) ctx: Arc<ExecutionContext>,
    pub(crate) store: Arc<dyn CheckpointStore>,
    /// Input buffers in port order.
    pub(crate) inputs: Vec<Arc<StreamBuffer>>,
    pub(crate) output: Option<Arc<StreamBuffer>>,
    pub(crate) events: Sender<WorkerEvent>,
    pub(crate) incarnation: u32,
    pub(crate) resume: Resume,
    /// First window a source generates when there's nothing to
    /// resume from.
    pub(crate) start_window: WindowId,
    pub(crate) window_width: Duration,
    pub(crate) max_backup_failures: u32,
}

/// Start a worker thread named `unit-{unit}:{operator}`.
pub(crate) fn spawn(unit: usize, spec: WorkerSpec) -> std::io::Result<JoinHandle<()>> {
    let name = format!("unit-{unit}:{}", spec.ctx.operator());
    std::thread::Builder::new().name(name).spawn(move || {
        let events = spec.events.clone();
        let operator = spec.ctx.operator().clone();
        let incarnation = spec.incarnation;
        let ctx = spec.ctx.clone();

        let kind = match std::panic::catch_unwind(AssertUnwindSafe(move || Worker::new(spec).run())) {
            Ok(Ok(Exit::Finished)) => WorkerEventKind::Finished,
            Ok(Ok(Exit::Terminated)) => WorkerEventKind::Terminated,
            Ok(Err(failure)) => WorkerEventKind::Failed(failure),
            Err(panic) => {
                ctx.retire();
                let msg = if let Some(msg) = panic.downcast_ref::<String>() {
                    msg.clone()
                } else if let Some(msg) = panic.downcast_ref::<&str>() {
                    (*msg).to_owned()
                } else {
                    "unknown panic payload".to_owned()
                };
                tracing::error!("{}", prepend_tname(msg.clone()).trim_end());
                WorkerEventKind::Panicked(msg)
            }
        };
        let event = WorkerEvent {
            operator,
            incarnation,
            kind,
        };
        if let Err(err) = events.send(event) {
            // Supervisor already gave up on the run.
            tracing::trace!("Dropping worker event: {:?}", err.0);
        }
    })
}

enum Exit {
    Finished,
    Terminated,
}

enum Step {
    Processed,
    Idle,
    Ended,
}

struct Input {
    buffer: Arc<StreamBuffer>,
    /// Last window read from this port.
    cursor: Option<WindowId>,
    ended: bool,
}

fn operator_failure(operator: &OperatorId, phase: &'static str, source: BoxError) -> WorkerFailure {
    WorkerFailure::Operator {
        operator: operator.clone(),
        phase,
        source,
    }
}

fn payload_bytes(tuple: &Tuple) -> u64 {
    tuple.payload.to_string().len() as u64
}

struct Worker {
    operator: Box<dyn Operator>,
    ctx: Arc<ExecutionContext>,
    store: Arc<dyn CheckpointStore>,
    inputs: Vec<Input>,
    output: Option<Arc<StreamBuffer>>,
    events: Sender<WorkerEvent>,
    incarnation: u32,
    resume: Resume,
    clock: WindowClock,
    /// Next window a source generates, `None` once window ids run out.
    next_source_window: Option<WindowId>,
    /// Last window fully processed; what a snapshot would cover.
    last_window: Option<WindowId>,
    last_checkpoint: Option<WindowId>,
    backup_failures: u32,
    max_backup_failures: u32,
    metrics: WorkerMetrics,
}

impl Worker {
    fn new(spec: WorkerSpec) -> Self {
        let metrics = WorkerMetrics::new(spec.ctx.operator());
        Self {
            operator: spec.operator,
            inputs: spec
                .inputs
                .into_iter()
                .map(|buffer| Input {
                    buffer,
                    cursor: None,
                    ended: false,
                })
                .collect(),
            output: spec.output,
            ctx: spec.ctx,
            store: spec.store,
            events: spec.events,
            incarnation: spec.incarnation,
            resume: spec.resume,
            clock: WindowClock::new(spec.window_width),
            next_source_window: Some(spec.start_window),
            last_window: None,
            last_checkpoint: None,
            backup_failures: 0,
            max_backup_failures: spec.max_backup_failures.max(1),
            metrics,
        }
    }

    fn send(&self, kind: WorkerEventKind) {
        let event = WorkerEvent {
            operator: self.ctx.operator().clone(),
            incarnation: self.incarnation,
            kind,
        };
        if self.events.send(event).is_err() {
            tracing::trace!("Supervisor gone, dropping event");
        }
    }

    fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }

    #[tracing::instrument(
        name = "worker",
        skip_all,
        fields(operator = %self.ctx.operator(), incarnation = self.incarnation)
    )]
    fn run(mut self) -> Result<Exit, WorkerFailure> {
        tracing::info!("Worker start");
        let res = self.start().and_then(|()| self.run_loop());
        self.operator.teardown();
        self.ctx.retire();
        match &res {
            Ok(Exit::Finished) => tracing::info!("Worker finished at {:?}", self.last_window),
            Ok(Exit::Terminated) => tracing::info!("Worker terminated at {:?}", self.last_window),
            Err(err) => tracing::error!("Worker failed: {err}"),
        }
        res
    }

    fn start(&mut self) -> Result<(), WorkerFailure> {
        let operator = self.ctx.operator().clone();
        let restore_err = |source: PersistenceError| WorkerFailure::Restore {
            operator: operator.clone(),
            source,
        };
        let snapshot = match self.resume {
            Resume::Fresh => None,
            Resume::Latest => self.store.load_latest(&operator).map_err(restore_err)?,
            Resume::At(window) => self.store.load(&operator, window).map_err(restore_err)?,
        };
        if let Some((window, state)) = snapshot {
            tracing::info!("Restoring from checkpoint at {window}");
            self.operator
                .restore(state)
                .map_err(|source| operator_failure(&operator, "restore", source))?;
            self.last_window = Some(window);
            self.last_checkpoint = Some(window);
            self.next_source_window = window.next();
            for input in &mut self.inputs {
                input.cursor = Some(window);
            }
        } else {
            tracing::debug!("No checkpoint to restore, starting at {:?}", self.next_source_window);
        }
        self.operator
            .setup(&self.ctx)
            .map_err(|source| operator_failure(&operator, "setup", source))
    }

    fn run_loop(&mut self) -> Result<Exit, WorkerFailure> {
        loop {
            match self.ctx.take_request() {
                RequestType::Terminate => return Ok(Exit::Terminated),
                RequestType::Backup => self.backup()?,
                RequestType::Report => {
                    self.send(WorkerEventKind::Report {
                        last_window: self.last_window,
                        windows_processed: self.ctx.windows_processed(),
                    });
                    self.ctx.complete_request(RequestType::Report);
                }
                RequestType::Undefined => {}
            }
            self.deliver_commit()?;

            let step = if self.is_source() {
                self.step_source()?
            } else {
                self.step_consumer()?
            };
            if let Step::Ended = step {
                self.final_checkpoint()?;
                if let Some(output) = &self.output {
                    output.end();
                }
                return Ok(Exit::Finished);
            }
        }
    }

    fn step_source(&mut self) -> Result<Step, WorkerFailure> {
        let Some(window) = self.next_source_window else {
            tracing::warn!("No window ids left after {:?}, ending source", self.last_window);
            return Ok(Step::Ended);
        };
        let remaining = self.clock.remaining();
        if !remaining.is_zero() {
            std::thread::sleep(remaining.min(self.ctx.idle_timeout()));
            return Ok(Step::Idle);
        }
        self.clock.start_window();

        let res = with_timer!(
            self.metrics.window_duration,
            self.metrics.labels,
            self.generate(window)
        );
        let (out, emission) = res?;
        let out = out.into_tuples();
        let bytes = out.iter().map(payload_bytes).sum();
        let tuples = out.len() as u64;
        self.finish_window(window, out, tuples, bytes);
        self.next_source_window = window.next();

        Ok(match emission {
            Emission::More => Step::Processed,
            Emission::Done => Step::Ended,
        })
    }

    fn generate(&mut self, window: WindowId) -> Result<(Emitter, Emission), WorkerFailure> {
        let mut out = Emitter::new(window);
        self.operator
            .begin_window(window)
            .map_err(|source| operator_failure(self.ctx.operator(), "begin_window", source))?;
        let emission = self
            .operator
            .emit(window, &mut out)
            .map_err(|source| operator_failure(self.ctx.operator(), "emit", source))?;
        self.operator
            .end_window(window, &mut out)
            .map_err(|source| operator_failure(self.ctx.operator(), "end_window", source))?;
        Ok((out, emission))
    }

    fn step_consumer(&mut self) -> Result<Step, WorkerFailure> {
        let timeout = self.ctx.idle_timeout();
        let mut pending = false;
        let mut heads = Vec::with_capacity(self.inputs.len());
        for (port, input) in self.inputs.iter_mut().enumerate() {
            if input.ended {
                continue;
            }
            match input.buffer.next_after(input.cursor, timeout) {
                Next::Window(window, tuples) => heads.push((port, window, tuples)),
                Next::Pending => pending = true,
                Next::Ended => {
                    tracing::debug!("Input {port} ({}) ended", input.buffer.name());
                    input.ended = true;
                }
            }
        }
        if pending {
            return Ok(Step::Idle);
        }
        // Windows line up across ports, so only the oldest is taken
        // now; the others are read again next time.
        let Some(window) = heads.iter().map(|(_, window, _)| *window).min() else {
            return Ok(Step::Ended);
        };
        let batch: Vec<_> = heads
            .into_iter()
            .filter(|(_, head, _)| *head == window)
            .map(|(port, _, tuples)| (port, tuples))
            .collect();

        let res = with_timer!(
            self.metrics.window_duration,
            self.metrics.labels,
            self.process_window(window, &batch)
        );
        let (out, tuples, bytes) = res?;
        for (port, _) in &batch {
            self.inputs[*port].cursor = Some(window);
        }
        self.finish_window(window, out.into_tuples(), tuples, bytes);
        Ok(Step::Processed)
    }

    fn process_window(
        &mut self,
        window: WindowId,
        batch: &[(usize, Arc<Vec<Tuple>>)],
    ) -> Result<(Emitter, u64, u64), WorkerFailure> {
        let mut out = Emitter::new(window);
        let mut tuples = 0;
        let mut bytes = 0;
        self.operator
            .begin_window(window)
            .map_err(|source| operator_failure(self.ctx.operator(), "begin_window", source))?;
        for (port, input) in batch {
            for tuple in input.iter() {
                tuples += 1;
                bytes += payload_bytes(tuple);
                self.operator
                    .process(*port, tuple.clone(), &mut out)
                    .map_err(|source| operator_failure(self.ctx.operator(), "process", source))?;
            }
        }
        self.operator
            .end_window(window, &mut out)
            .map_err(|source| operator_failure(self.ctx.operator(), "end_window", source))?;
        Ok((out, tuples, bytes))
    }

    fn finish_window(&mut self, window: WindowId, out: Vec<Tuple>, tuples: u64, bytes: u64) {
        if let Some(output) = &self.output {
            output.publish(window, out);
        }
        self.ctx.report(tuples, bytes, window);
        self.last_window = Some(window);
        tracing::trace!("Processed {window}: {tuples} tuples, {bytes} bytes");
    }

    /// Snapshot and hand the state to the agent of the outstanding
    /// request.
    fn backup(&mut self) -> Result<(), WorkerFailure> {
        let window = match self.last_window {
            Some(window) if self.last_checkpoint != Some(window) => window,
            // Nothing new since the last checkpoint.
            _ => {
                self.ctx.complete_request(RequestType::Backup);
                return Ok(());
            }
        };
        let state = match self.operator.snapshot() {
            Ok(state) => state,
            Err(source) => {
                self.ctx.complete_request(RequestType::Backup);
                return Err(operator_failure(self.ctx.operator(), "snapshot", source));
            }
        };

        let res = with_timer!(
            self.metrics.backup_duration,
            self.metrics.labels,
            self.ctx.backup(window, state)
        );
        match res {
            Ok(Some(info)) => {
                self.backup_failures = 0;
                self.last_checkpoint = Some(window);
                tracing::debug!("Checkpointed at {window}, {} bytes", info.size);
                self.send(WorkerEventKind::Checkpointed(info));
                if let Some(listener) = self.operator.as_checkpoint_listener() {
                    listener
                        .checkpointed(window)
                        .map_err(|source| ListenerError::Checkpointed {
                            operator: self.ctx.operator().clone(),
                            window,
                            source,
                        })?;
                }
            }
            Ok(None) => {}
            Err(err) => {
                self.backup_failures += 1;
                self.metrics.backups_failed.add(1, &self.metrics.labels);
                if self.backup_failures >= self.max_backup_failures {
                    return Err(WorkerFailure::BackupsExhausted {
                        operator: self.ctx.operator().clone(),
                        attempts: self.backup_failures,
                        source: err,
                    });
                }
                tracing::warn!(
                    "Backup at {window} failed ({}/{}), retrying at next interval: {err}",
                    self.backup_failures,
                    self.max_backup_failures
                );
            }
        }
        Ok(())
    }

    /// Checkpoint the last window before finishing, so everything
    /// this instance did can be committed.
    fn final_checkpoint(&mut self) -> Result<(), WorkerFailure> {
        if self.last_window.is_none() || self.last_window == self.last_checkpoint {
            return Ok(());
        }
        if self.ctx.request() != RequestType::Backup {
            let agent = Arc::new(crate::recovery::StoreBackupAgent::new(self.store.clone()));
            self.ctx.request_backup(agent);
        }
        self.backup()
    }

    fn deliver_commit(&mut self) -> Result<(), WorkerFailure> {
        let Some(window) = self.ctx.take_commit() else {
            return Ok(());
        };
        tracing::debug!("Committed {window}");
        if let Some(listener) = self.operator.as_checkpoint_listener() {
            listener
                .committed(window)
                .map_err(|source| ListenerError::Committed {
                    operator: self.ctx.operator().clone(),
                    window,
                    source,
                })?;
        }
        Ok(())
    }
}
