//! Checkpoint scheduling, commit tracking and garbage collection.
//!
//! The coordinator runs on the supervisor thread and never touches an
//! operator. Every tick it:
//!
//! 1. Requests a backup from each operator that has processed at
//!    least K windows since the last request. K is the operator's
//!    `checkpoint_window_count`, falling back to the application's.
//!
//! 2. Recomputes each operator's **recovery point**: its newest
//!    checkpoint that isn't after the recovery point of any operator
//!    it feeds. Sinks use their newest checkpoint. Walking the plan in
//!    reverse topological order means every upstream recovery point is
//!    at or before every downstream one, so restoring everything to its
//!    recovery point is a consistent cut. Every operator reachable
//!    downstream has checkpointed at or beyond it, so this is also the
//!    window committed for the operator.
//!
//! 3. Posts newly committed windows to the operators' contexts and
//!    garbage collects: checkpoints before the committed one are
//!    deleted from the store, and stream windows at or before every
//!    consumer's committed window are dropped from the buffers.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer::StreamBuffer;
use crate::context::ExecutionContext;
use crate::dataflow::StreamId;
use crate::dataflow::Topology;
use crate::errors::PersistenceError;
use crate::recovery::BackupAgent;
use crate::recovery::CheckpointInfo;
use crate::recovery::CheckpointState;
use crate::recovery::CheckpointStore;
use crate::recovery::OperatorId;
use crate::recovery::StoreBackupAgent;
use crate::window::WindowId;

struct Tracked {
    ctx: Option<Arc<ExecutionContext>>,
    state: CheckpointState,
    /// Windows of this operator's checkpoints still in the store.
    checkpoints: BTreeSet<WindowId>,
    window_count: u32,
    /// `windows_processed` of the context at the last request.
    request_base: u64,
}

pub struct CheckpointCoordinator {
    topology: Arc<Topology>,
    store: Arc<dyn CheckpointStore>,
    agent: Arc<dyn BackupAgent>,
    operators: BTreeMap<OperatorId, Tracked>,
    buffers: HashMap<StreamId, Arc<StreamBuffer>>,
}

impl CheckpointCoordinator {
    /// Picks up any checkpoints already in `store`, so a run over an
    /// existing SQLite file resumes where the last one stopped.
    pub fn new(
        topology: Arc<Topology>,
        store: Arc<dyn CheckpointStore>,
        buffers: HashMap<StreamId, Arc<StreamBuffer>>,
        window_counts: &HashMap<OperatorId, u32>,
    ) -> Result<Self, PersistenceError> {
        let mut operators = BTreeMap::new();
        for op in topology.order() {
            let checkpoints: BTreeSet<_> = store
                .list(op)?
                .into_iter()
                .map(|info| info.window_id)
                .collect();
            let mut state = CheckpointState::default();
            if let Some(latest) = checkpoints.last() {
                tracing::info!("Found checkpoints of {op} up to {latest}");
                state.advance_checkpointed(*latest);
            }
            operators.insert(
                op.clone(),
                Tracked {
                    ctx: None,
                    state,
                    checkpoints,
                    window_count: window_counts.get(op).copied().unwrap_or(1).max(1),
                    request_base: 0,
                },
            );
        }
        Ok(Self {
            topology,
            agent: Arc::new(StoreBackupAgent::new(store.clone())),
            store,
            operators,
            buffers,
        })
    }

    /// Start tracking a newly deployed instance.
    pub fn attach(&mut self, op: &OperatorId, ctx: Arc<ExecutionContext>) {
        if let Some(tracked) = self.operators.get_mut(op) {
            tracked.ctx = Some(ctx);
            tracked.request_base = 0;
        }
    }

    /// Stop requesting anything from an instance that's gone.
    pub fn detach(&mut self, op: &OperatorId) {
        if let Some(tracked) = self.operators.get_mut(op) {
            tracked.ctx = None;
        }
    }

    pub fn on_checkpointed(&mut self, op: &OperatorId, info: &CheckpointInfo) {
        if let Some(tracked) = self.operators.get_mut(op) {
            tracked.checkpoints.insert(info.window_id);
            if tracked.state.advance_checkpointed(info.window_id) {
                tracing::debug!("{op} checkpointed at {}", info.window_id);
            }
        }
    }

    pub fn state(&self, op: &OperatorId) -> Option<CheckpointState> {
        self.operators.get(op).map(|tracked| tracked.state)
    }

    /// Checkpoints of an operator currently in the store.
    pub fn checkpoints(&self, op: &OperatorId) -> Result<Vec<CheckpointInfo>, PersistenceError> {
        self.store.list(op)
    }

    pub fn tick(&mut self) -> Result<(), PersistenceError> {
        self.request_backups();
        self.commit()
    }

    fn request_backups(&mut self) {
        for (op, tracked) in self.operators.iter_mut() {
            let Some(ctx) = &tracked.ctx else {
                continue;
            };
            let processed = ctx.windows_processed();
            if processed.saturating_sub(tracked.request_base) < u64::from(tracked.window_count) {
                continue;
            }
            if ctx.request_backup(self.agent.clone()) {
                tracing::trace!("Requested backup of {op} after {processed} windows");
                tracked.request_base = processed;
            }
        }
    }

    /// Recovery point of every operator; see the module docs.
    pub fn recovery_points(&self) -> HashMap<OperatorId, Option<WindowId>> {
        let mut points: HashMap<OperatorId, Option<WindowId>> = HashMap::new();
        for op in self.topology.order().iter().rev() {
            let mut bound = None;
            let mut blocked = false;
            for downstream in self.topology.direct_downstream(op) {
                match points.get(downstream).copied().flatten() {
                    Some(point) => bound = Some(bound.map_or(point, |b: WindowId| b.min(point))),
                    // A consumer that would replay from the start needs
                    // everything from us too.
                    None => blocked = true,
                }
            }
            let checkpoints = &self.operators[op].checkpoints;
            let point = if blocked {
                None
            } else {
                match bound {
                    None => checkpoints.last().copied(),
                    Some(bound) => checkpoints.range(..=bound).next_back().copied(),
                }
            };
            points.insert(op.clone(), point);
        }
        points
    }

    fn commit(&mut self) -> Result<(), PersistenceError> {
        let points = self.recovery_points();
        let mut newly_committed = Vec::new();
        for (op, tracked) in self.operators.iter_mut() {
            let Some(window) = points.get(op).copied().flatten() else {
                continue;
            };
            if !tracked.state.advance_committed(window) {
                continue;
            }
            tracing::debug!("Committed {op} at {window}");
            if let Some(ctx) = &tracked.ctx {
                ctx.post_commit(window);
            }
            newly_committed.push((op.clone(), window));
        }

        for (op, window) in newly_committed {
            let purged = self.store.purge_before(&op, window)?;
            if purged > 0 {
                tracing::trace!("Purged {purged} checkpoints of {op} before {window}");
            }
            if let Some(tracked) = self.operators.get_mut(&op) {
                tracked.checkpoints = tracked.checkpoints.split_off(&window);
            }
        }

        for (stream, buffer) in &self.buffers {
            let through = self
                .topology
                .consumers(stream)
                .iter()
                .map(|op| self.operators.get(op).and_then(|t| t.state.last_committed()))
                .collect::<Option<Vec<_>>>()
                .and_then(|committed| committed.into_iter().min());
            if let Some(through) = through {
                let purged = buffer.purge_through(through);
                if purged > 0 {
                    tracing::trace!("Purged {purged} windows of stream {stream} through {through}");
                }
            }
        }
        Ok(())
    }

    /// Pick the cut a run over a pre-populated store resumes from, and
    /// make the store agree with it.
    ///
    /// Called once before the first deployment. An operator without a
    /// recovery point starts over from the run's first window, and a
    /// fresh run's window ids share nothing with the old ones, so
    /// everything connected to it starts over too. Checkpoints newer
    /// than the cut are discarded so a later restart can't pick them
    /// up.
    pub fn resume_points(&mut self) -> Result<HashMap<OperatorId, Option<WindowId>>, PersistenceError> {
        let mut points = self.recovery_points();
        loop {
            let mut changed = false;
            for op in self.topology.order() {
                let fresh_upstream = points.get(op).copied().flatten().is_none();
                for downstream in self.topology.direct_downstream(op) {
                    let blocked = points.get(downstream).copied().flatten().is_none();
                    if fresh_upstream != blocked {
                        points.insert(op.clone(), None);
                        points.insert(downstream.clone(), None);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        for (op, tracked) in self.operators.iter_mut() {
            let point = points.get(op).copied().flatten();
            let discarded = self.store.discard_after(op, point)?;
            if discarded > 0 {
                tracing::info!("Discarded {discarded} checkpoints of {op} newer than resume point {point:?}");
            }
            tracked.checkpoints = match point {
                Some(point) => {
                    let mut kept = std::mem::take(&mut tracked.checkpoints);
                    kept.retain(|window| *window <= point);
                    kept
                }
                None => BTreeSet::new(),
            };
            tracked.state = CheckpointState::default();
            if let Some(point) = point {
                tracked.state.advance_checkpointed(point);
            }
        }
        self.commit()?;
        Ok(points)
    }
}

#[cfg(test)]
use crate::recovery::InMemStore;
#[cfg(test)]
use crate::recovery::StateBytes;

#[cfg(test)]
fn w(seq: u32) -> WindowId {
    WindowId::new(50, seq)
}

#[cfg(test)]
fn chain() -> (Arc<Topology>, HashMap<StreamId, Arc<StreamBuffer>>) {
    use crate::dataflow::LogicalPlan;
    use crate::operators::Operator;

    struct Nop;
    impl Operator for Nop {}

    let mut plan = LogicalPlan::new().unwrap();
    for name in ["src", "mid", "sink"] {
        plan.add_operator(name, || Nop).unwrap();
    }
    plan.add_stream("a", "src", &["mid"]).unwrap();
    plan.add_stream("b", "mid", &["sink"]).unwrap();
    let topo = plan.validate().unwrap();
    let buffers = topo
        .streams()
        .map(|s| (s.clone(), Arc::new(StreamBuffer::new(s.to_string()))))
        .collect();
    (Arc::new(topo), buffers)
}

#[cfg(test)]
fn checkpoint(
    coord: &mut CheckpointCoordinator,
    store: &InMemStore,
    op: &str,
    seq: u32,
) {
    let op = OperatorId::new(op);
    let info = store.save(&op, w(seq), &StateBytes::empty()).unwrap();
    coord.on_checkpointed(&op, &info);
}

#[cfg(test)]
fn test_context(op: &str) -> Arc<ExecutionContext> {
    use crate::attributes::AttributeStore;
    use crate::attributes::KeyRegistry;

    Arc::new(ExecutionContext::new(
        OperatorId::new(op),
        Arc::new(AttributeStore::new(Arc::new(KeyRegistry::new()))),
        std::time::Duration::from_millis(10),
    ))
}

#[test]
fn commit_waits_for_every_downstream() {
    let (topo, buffers) = chain();
    let store = Arc::new(InMemStore::new());
    let mut coord =
        CheckpointCoordinator::new(topo, store.clone(), buffers, &HashMap::new()).unwrap();
    let src_ctx = test_context("src");
    coord.attach(&OperatorId::new("src"), src_ctx.clone());

    checkpoint(&mut coord, &store, "src", 4);
    checkpoint(&mut coord, &store, "mid", 2);
    coord.tick().unwrap();
    // `sink` never checkpointed, so nothing upstream of it commits.
    assert_eq!(src_ctx.take_commit(), None);

    checkpoint(&mut coord, &store, "sink", 6);
    coord.tick().unwrap();
    let points = coord.recovery_points();
    assert_eq!(points[&OperatorId::new("sink")], Some(w(6)));
    assert_eq!(points[&OperatorId::new("mid")], Some(w(2)));
    // Bounded by mid's recovery point, not just sink's.
    assert_eq!(points[&OperatorId::new("src")], None);
    assert_eq!(src_ctx.take_commit(), None);

    checkpoint(&mut coord, &store, "src", 1);
    coord.tick().unwrap();
    assert_eq!(src_ctx.take_commit(), Some(w(1)));
}

#[test]
fn commits_only_move_forward_and_gc_keeps_committed() {
    let (topo, buffers) = chain();
    let store = Arc::new(InMemStore::new());
    let buffer_b = buffers.values().find(|b| b.name() == "b").unwrap().clone();
    let mut coord =
        CheckpointCoordinator::new(topo, store.clone(), buffers, &HashMap::new()).unwrap();
    let sink_ctx = test_context("sink");
    coord.attach(&OperatorId::new("sink"), sink_ctx.clone());
    for seq in 1..=5 {
        buffer_b.publish(w(seq), vec![]);
    }

    checkpoint(&mut coord, &store, "sink", 2);
    checkpoint(&mut coord, &store, "sink", 4);
    coord.tick().unwrap();
    assert_eq!(sink_ctx.take_commit(), Some(w(4)));
    coord.tick().unwrap();
    assert_eq!(sink_ctx.take_commit(), None);

    let sink = OperatorId::new("sink");
    let left: Vec<_> = store
        .list(&sink)
        .unwrap()
        .into_iter()
        .map(|i| i.window_id)
        .collect();
    assert_eq!(left, vec![w(4)]);
    assert_eq!(buffer_b.len(), 1);
    assert_eq!(coord.state(&sink).unwrap().last_committed(), Some(w(4)));
}

#[test]
fn backups_requested_every_k_windows() {
    let (topo, buffers) = chain();
    let store = Arc::new(InMemStore::new());
    let counts = HashMap::from([(OperatorId::new("src"), 3)]);
    let mut coord = CheckpointCoordinator::new(topo, store, buffers, &counts).unwrap();
    let ctx = test_context("src");
    coord.attach(&OperatorId::new("src"), ctx.clone());

    ctx.report(0, 0, w(1));
    ctx.report(0, 0, w(2));
    coord.tick().unwrap();
    assert_eq!(ctx.take_request(), crate::context::RequestType::Undefined);
    ctx.report(0, 0, w(3));
    coord.tick().unwrap();
    assert_eq!(ctx.take_request(), crate::context::RequestType::Backup);
}

#[test]
fn pending_report_does_not_delay_backup() {
    let (topo, buffers) = chain();
    let store = Arc::new(InMemStore::new());
    let counts = HashMap::from([(OperatorId::new("src"), 1)]);
    let mut coord = CheckpointCoordinator::new(topo, store, buffers, &counts).unwrap();
    let ctx = test_context("src");
    coord.attach(&OperatorId::new("src"), ctx.clone());

    assert!(ctx.request_report());
    ctx.report(0, 0, w(1));
    coord.tick().unwrap();
    assert_eq!(ctx.take_request(), crate::context::RequestType::Backup);
}

#[test]
fn resume_points_come_from_existing_store() {
    let (topo, buffers) = chain();
    let store = Arc::new(InMemStore::new());
    for (op, seqs) in [("src", vec![2, 4, 6]), ("mid", vec![3, 5]), ("sink", vec![4, 7])] {
        for seq in seqs {
            store
                .save(&OperatorId::new(op), w(seq), &StateBytes::empty())
                .unwrap();
        }
    }
    let mut coord =
        CheckpointCoordinator::new(topo, store.clone(), buffers, &HashMap::new()).unwrap();
    let points = coord.resume_points().unwrap();
    assert_eq!(points[&OperatorId::new("sink")], Some(w(7)));
    assert_eq!(points[&OperatorId::new("mid")], Some(w(5)));
    assert_eq!(points[&OperatorId::new("src")], Some(w(4)));
    // 6 is past the cut and 2 is garbage once 4 is committed.
    let left: Vec<_> = store
        .list(&OperatorId::new("src"))
        .unwrap()
        .into_iter()
        .map(|i| i.window_id)
        .collect();
    assert_eq!(left, vec![w(4)]);
    assert_eq!(
        coord.state(&OperatorId::new("src")).unwrap().last_committed(),
        Some(w(4))
    );
}

#[test]
fn fresh_upstream_restarts_everything_connected() {
    let (topo, buffers) = chain();
    let store = Arc::new(InMemStore::new());
    for (op, seq) in [("src", 6), ("mid", 3), ("sink", 7)] {
        store
            .save(&OperatorId::new(op), w(seq), &StateBytes::empty())
            .unwrap();
    }
    let mut coord =
        CheckpointCoordinator::new(topo, store.clone(), buffers, &HashMap::new()).unwrap();
    let points = coord.resume_points().unwrap();
    // `src` has nothing at or before `mid`'s 3.
    assert!(points.values().all(Option::is_none), "{points:?}");
    for op in ["src", "mid", "sink"] {
        assert!(store.list(&OperatorId::new(op)).unwrap().is_empty());
    }
}
