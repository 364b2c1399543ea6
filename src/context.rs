//! Per-operator runtime state shared between a worker and the
//! supervisor.
//!
//! The worker owns the operator. Everyone else talks to it only
//! through its [`ExecutionContext`]: the coordinator posts requests
//! and commits, the heartbeat reporter drains samples. The worker
//! looks at all of it at its next window boundary, so nothing here
//! ever calls into the operator directly.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;

use crate::attributes::AttributeStore;
use crate::errors::PersistenceError;
use crate::recovery::BackupAgent;
use crate::recovery::BackupCommand;
use crate::recovery::CheckpointInfo;
use crate::recovery::OperatorId;
use crate::recovery::StateBytes;
use crate::window::WindowId;

/// Samples kept per operator before the oldest are dropped.
pub const HEARTBEAT_CAPACITY: usize = 1024;

/// Processing counters for one window.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatSample {
    pub window_id: WindowId,
    pub tuples: u64,
    pub bytes: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Bounded FIFO of samples that drops the oldest when full.
#[derive(Debug)]
pub struct HeartbeatRing {
    samples: VecDeque<HeartbeatSample>,
    capacity: usize,
}

impl HeartbeatRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample. If full, the oldest sample is removed first
    /// and returned.
    pub fn push(&mut self, sample: HeartbeatSample) -> Option<HeartbeatSample> {
        let dropped = if self.samples.len() == self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        dropped
    }

    /// Move every sample into `dest`, oldest first.
    pub fn drain_into(&mut self, dest: &mut Vec<HeartbeatSample>) -> usize {
        let count = self.samples.len();
        dest.extend(self.samples.drain(..));
        count
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// What the worker should do at its next boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    Undefined = 0,
    Report = 1,
    Backup = 2,
    /// Once set, never cleared.
    Terminate = 3,
}

impl RequestType {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Report,
            2 => Self::Backup,
            3 => Self::Terminate,
            _ => Self::Undefined,
        }
    }
}

pub struct ExecutionContext {
    operator: OperatorId,
    attributes: Arc<AttributeStore>,
    idle_timeout: Duration,
    request: AtomicU8,
    /// Set together with a [`RequestType::Backup`] request, under
    /// this lock, so the worker never sees the request without it.
    backup_agent: Mutex<Option<Arc<dyn BackupAgent>>>,
    heartbeats: Mutex<HeartbeatRing>,
    dropped_samples: AtomicU64,
    last_processed: Mutex<Option<WindowId>>,
    windows_processed: AtomicU64,
    pending_commit: Mutex<Option<WindowId>>,
    retired: AtomicBool,
}

impl ExecutionContext {
    pub fn new(operator: OperatorId, attributes: Arc<AttributeStore>, idle_timeout: Duration) -> Self {
        Self {
            operator,
            attributes,
            idle_timeout,
            request: AtomicU8::new(RequestType::Undefined as u8),
            backup_agent: Mutex::new(None),
            heartbeats: Mutex::new(HeartbeatRing::new(HEARTBEAT_CAPACITY)),
            dropped_samples: AtomicU64::new(0),
            last_processed: Mutex::new(None),
            windows_processed: AtomicU64::new(0),
            pending_commit: Mutex::new(None),
            retired: AtomicBool::new(false),
        }
    }

    pub fn operator(&self) -> &OperatorId {
        &self.operator
    }

    /// Operator-scoped attributes.
    pub fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    /// Longest the worker blocks waiting for input before returning
    /// to its boundary.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Record that `window` was processed.
    pub fn report(&self, tuples: u64, bytes: u64, window: WindowId) {
        let sample = HeartbeatSample {
            window_id: window,
            tuples,
            bytes,
            recorded_at: Utc::now(),
        };
        if let Some(dropped) = self.heartbeats.lock().push(sample) {
            self.dropped_samples.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                "Heartbeat ring of {} full, dropped sample for {}",
                self.operator,
                dropped.window_id
            );
        }
        *self.last_processed.lock() = Some(window);
        self.windows_processed.fetch_add(1, Ordering::AcqRel);
    }

    /// Move all buffered heartbeat samples into `dest`.
    pub fn drain_heartbeat_counters(&self, dest: &mut Vec<HeartbeatSample>) -> usize {
        self.heartbeats.lock().drain_into(dest)
    }

    /// Samples lost to ring overflow so far.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples.load(Ordering::Relaxed)
    }

    pub fn last_processed(&self) -> Option<WindowId> {
        *self.last_processed.lock()
    }

    pub fn windows_processed(&self) -> u64 {
        self.windows_processed.load(Ordering::Acquire)
    }

    pub fn request(&self) -> RequestType {
        RequestType::from_u8(self.request.load(Ordering::Acquire))
    }

    fn transition(&self, from: RequestType, to: RequestType) -> bool {
        self.request
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Ask for a backup at the next boundary, to be performed by
    /// `agent`.
    ///
    /// A later call before the backup happens replaces the agent. A
    /// pending report is overridden. Refused only once terminated or
    /// retired.
    pub fn request_backup(&self, agent: Arc<dyn BackupAgent>) -> bool {
        let mut slot = self.backup_agent.lock();
        if self.is_retired() {
            return false;
        }
        let mut current = self.request.load(Ordering::Acquire);
        loop {
            if current == RequestType::Terminate as u8 {
                return false;
            }
            match self.request.compare_exchange_weak(
                current,
                RequestType::Backup as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        *slot = Some(agent);
        true
    }

    pub fn request_report(&self) -> bool {
        !self.is_retired() && self.transition(RequestType::Undefined, RequestType::Report)
    }

    /// Ask the worker to tear down and exit. Overrides any outstanding
    /// request.
    pub fn request_terminate(&self) {
        let prev = self
            .request
            .swap(RequestType::Terminate as u8, Ordering::AcqRel);
        if prev != RequestType::Terminate as u8 {
            tracing::debug!("Requested termination of {}", self.operator);
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.request() == RequestType::Terminate
    }

    /// Read the outstanding request at a boundary. It stays set until
    /// [`Self::complete_request`].
    pub fn take_request(&self) -> RequestType {
        self.request()
    }

    /// Mark a report or backup request as handled.
    pub fn complete_request(&self, handled: RequestType) {
        if handled != RequestType::Terminate {
            self.transition(handled, RequestType::Undefined);
        }
    }

    /// Fulfil a backup request with a snapshot taken after `window`.
    ///
    /// Returns `Ok(None)` if there was no agent to perform it. The
    /// request is completed whether or not persisting worked; the
    /// coordinator will ask again at the next interval. A request made
    /// while this one ran stays pending.
    pub fn backup(
        &self,
        window: WindowId,
        state: StateBytes,
    ) -> Result<Option<CheckpointInfo>, PersistenceError> {
        let agent = self.backup_agent.lock().take();
        let res = match agent {
            Some(agent) => agent
                .execute(BackupCommand {
                    operator: self.operator.clone(),
                    window_id: window,
                    state,
                })
                .map(Some),
            None => Ok(None),
        };
        let slot = self.backup_agent.lock();
        if slot.is_none() {
            self.complete_request(RequestType::Backup);
        }
        res
    }

    /// Deliver a commit. Keeps only the newest undelivered window.
    pub fn post_commit(&self, window: WindowId) -> bool {
        let mut pending = self.pending_commit.lock();
        if pending.map_or(true, |prev| window > prev) {
            *pending = Some(window);
            true
        } else {
            false
        }
    }

    /// Newest undelivered commit, if any.
    pub fn take_commit(&self) -> Option<WindowId> {
        self.pending_commit.lock().take()
    }

    /// Stop accepting requests. Called when the operator instance is
    /// done for good.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        self.backup_agent.lock().take();
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("operator", &self.operator)
            .field("request", &self.request())
            .field("last_processed", &self.last_processed())
            .field("windows_processed", &self.windows_processed())
            .field("retired", &self.is_retired())
            .finish()
    }
}

#[cfg(test)]
fn test_context() -> ExecutionContext {
    use crate::attributes::KeyRegistry;

    let store = AttributeStore::new(Arc::new(KeyRegistry::new()));
    ExecutionContext::new(OperatorId::new("op"), Arc::new(store), Duration::from_millis(10))
}

#[cfg(test)]
fn sample(seq: u32) -> HeartbeatSample {
    HeartbeatSample {
        window_id: WindowId::new(1, seq),
        tuples: u64::from(seq),
        bytes: 0,
        recorded_at: Utc::now(),
    }
}

#[test]
fn ring_drops_oldest_when_full() {
    let mut ring = HeartbeatRing::new(HEARTBEAT_CAPACITY);
    for seq in 0..HEARTBEAT_CAPACITY as u32 {
        assert_eq!(ring.push(sample(seq)), None);
    }
    let dropped = ring.push(sample(5000)).unwrap();
    assert_eq!(dropped.window_id, WindowId::new(1, 0));
    assert_eq!(ring.len(), HEARTBEAT_CAPACITY);

    let mut out = Vec::new();
    assert_eq!(ring.drain_into(&mut out), HEARTBEAT_CAPACITY);
    assert_eq!(out.first().unwrap().window_id, WindowId::new(1, 1));
    assert_eq!(out.last().unwrap().window_id, WindowId::new(1, 5000));
    assert!(ring.is_empty());
}

#[test]
fn report_overflow_is_counted_not_failed() {
    let ctx = test_context();
    for seq in 0..1030 {
        ctx.report(1, 8, WindowId::new(1, seq));
    }
    assert_eq!(ctx.dropped_samples(), 6);
    assert_eq!(ctx.windows_processed(), 1030);
    assert_eq!(ctx.last_processed(), Some(WindowId::new(1, 1029)));

    let mut out = Vec::new();
    assert_eq!(ctx.drain_heartbeat_counters(&mut out), HEARTBEAT_CAPACITY);
    assert_eq!(ctx.drain_heartbeat_counters(&mut out), 0);
}

#[cfg(test)]
struct Tagged {
    tag: u32,
    ran: Arc<Mutex<Vec<u32>>>,
}

#[cfg(test)]
impl BackupAgent for Tagged {
    fn execute(&self, command: BackupCommand) -> Result<CheckpointInfo, PersistenceError> {
        self.ran.lock().push(self.tag);
        Ok(CheckpointInfo {
            window_id: command.window_id,
            size: command.state.len(),
            created_at: Utc::now(),
        })
    }
}

#[test]
fn backup_overrides_pending_report() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let ctx = test_context();
    assert_eq!(ctx.take_request(), RequestType::Undefined);
    assert!(ctx.request_report());
    assert!(ctx.request_backup(Arc::new(Tagged { tag: 1, ran: ran.clone() })));
    assert_eq!(ctx.take_request(), RequestType::Backup);
    // A report can't displace the backup.
    assert!(!ctx.request_report());
    // Completing the stale report leaves the backup pending.
    ctx.complete_request(RequestType::Report);
    assert_eq!(ctx.take_request(), RequestType::Backup);

    let info = ctx
        .backup(WindowId::new(1, 4), StateBytes::empty())
        .unwrap()
        .unwrap();
    assert_eq!(info.window_id, WindowId::new(1, 4));
    assert_eq!(*ran.lock(), vec![1]);
    assert_eq!(ctx.take_request(), RequestType::Undefined);
}

#[test]
fn later_backup_request_replaces_agent() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let ctx = test_context();
    assert!(ctx.request_backup(Arc::new(Tagged { tag: 1, ran: ran.clone() })));
    assert!(ctx.request_backup(Arc::new(Tagged { tag: 2, ran: ran.clone() })));
    assert!(ctx.backup(WindowId::new(1, 1), StateBytes::empty()).unwrap().is_some());
    assert_eq!(*ran.lock(), vec![2]);
    assert_eq!(ctx.take_request(), RequestType::Undefined);
}

#[test]
fn backup_requested_during_backup_stays_pending() {
    struct Rerequest {
        ctx: Arc<ExecutionContext>,
        ran: Arc<Mutex<Vec<u32>>>,
    }
    impl BackupAgent for Rerequest {
        fn execute(&self, command: BackupCommand) -> Result<CheckpointInfo, PersistenceError> {
            self.ran.lock().push(1);
            self.ctx.request_backup(Arc::new(Tagged {
                tag: 2,
                ran: self.ran.clone(),
            }));
            Ok(CheckpointInfo {
                window_id: command.window_id,
                size: 0,
                created_at: Utc::now(),
            })
        }
    }

    let ran = Arc::new(Mutex::new(Vec::new()));
    let ctx = Arc::new(test_context());
    assert!(ctx.request_backup(Arc::new(Rerequest {
        ctx: ctx.clone(),
        ran: ran.clone(),
    })));
    ctx.backup(WindowId::new(1, 1), StateBytes::empty()).unwrap();
    assert_eq!(ctx.take_request(), RequestType::Backup);
    ctx.backup(WindowId::new(1, 2), StateBytes::empty()).unwrap();
    assert_eq!(*ran.lock(), vec![1, 2]);
    assert_eq!(ctx.take_request(), RequestType::Undefined);
}

#[test]
fn backup_refused_once_terminated() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let ctx = test_context();
    ctx.request_terminate();
    assert!(!ctx.request_backup(Arc::new(Tagged { tag: 1, ran: ran.clone() })));
    assert_eq!(ctx.take_request(), RequestType::Terminate);
    assert_eq!(ctx.backup(WindowId::new(1, 1), StateBytes::empty()).unwrap(), None);
    assert!(ran.lock().is_empty());
}

#[test]
fn terminate_is_absorbing() {
    let ctx = test_context();
    assert!(ctx.request_report());
    ctx.request_terminate();
    assert!(ctx.is_terminated());
    ctx.complete_request(RequestType::Report);
    ctx.complete_request(RequestType::Terminate);
    assert!(!ctx.request_report());
    assert_eq!(ctx.take_request(), RequestType::Terminate);
}

#[test]
fn backup_without_agent_is_noop() {
    let ctx = test_context();
    assert_eq!(ctx.backup(WindowId::new(1, 1), StateBytes::empty()).unwrap(), None);
}

#[test]
fn backup_failure_still_completes_request() {
    struct Broken;
    impl BackupAgent for Broken {
        fn execute(&self, _command: BackupCommand) -> Result<CheckpointInfo, PersistenceError> {
            Err(PersistenceError::Unavailable("disk on fire".to_owned()))
        }
    }

    let ctx = test_context();
    assert!(ctx.request_backup(Arc::new(Broken)));
    assert!(ctx.backup(WindowId::new(1, 1), StateBytes::empty()).is_err());
    assert_eq!(ctx.take_request(), RequestType::Undefined);
}

#[test]
fn commit_mailbox_keeps_newest() {
    let ctx = test_context();
    assert!(ctx.post_commit(WindowId::new(1, 2)));
    assert!(ctx.post_commit(WindowId::new(1, 4)));
    assert!(!ctx.post_commit(WindowId::new(1, 3)));
    assert_eq!(ctx.take_commit(), Some(WindowId::new(1, 4)));
    assert_eq!(ctx.take_commit(), None);
}

#[test]
fn retired_context_refuses_requests() {
    let ctx = test_context();
    ctx.retire();
    assert!(!ctx.request_report());
    assert!(ctx.is_retired());
}
