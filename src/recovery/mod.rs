//! Checkpointing and recovery of operator state.
//!
//! Because recovery requires coordination at many points in
//! execution, not all code for it lives here. The
//! [`crate::coordinator`] decides when to checkpoint and what is
//! committed, and the [`crate::worker`] loop performs backups and
//! restores at window boundaries. An overview of it is given here,
//! though.
//!
//! Architecture
//! ------------
//!
//! Each operator's state is **snapshotted** at a window boundary
//! every K windows, when the coordinator asks for it, and durably
//! saved in a [`CheckpointStore`] keyed by `(operator, window)`. The
//! snapshot is opaque [`StateBytes`] so different operators can keep
//! different state types without Rust type gymnastics.
//!
//! The coordinator hands each worker a [`BackupAgent`] with the
//! request. At the boundary the worker snapshots its operator, wraps
//! it in a [`BackupCommand`] and gives it to the agent, which does the
//! actual write. Nothing about backup is a callback into the operator
//! other than the snapshot itself.
//!
//! A window is **committed** for an operator once every operator
//! reachable downstream of it has checkpointed at or beyond that
//! window; nothing at or before it will ever be replayed to that
//! operator again. Commits are always one of the operator's own
//! checkpoint windows.
//!
//! Garbage Collection
//! ------------------
//!
//! Once a window is committed for an operator we'll never need to
//! recover it to anything older. All of its checkpoints strictly
//! before the committed one are deleted. The committed one is kept,
//! since it's the state we'd restore if the operator failed right
//! now.
//!
//! Resume
//! ------
//!
//! A failed operator is rebuilt from the newest checkpoint in the
//! store. It then re-reads its inputs from the window after that
//! checkpoint. Sources instead resume generating at the window after
//! it, and since [`crate::window::WindowId::next`] is deterministic
//! they produce exactly the windows they produced the first time.
//! Downstream buffers drop windows they already hold, so the replay
//! is invisible past the restarted operator.

use std::sync::Arc;

use crate::errors::PersistenceError;
use crate::window::WindowId;

pub(crate) mod model;
pub(crate) mod store;

pub use model::CheckpointInfo;
pub use model::CheckpointState;
pub use model::OperatorId;
pub use model::StateBytes;
pub use store::in_mem::InMemStore;
pub use store::sqlite::SqliteStore;
pub use store::CheckpointStore;

/// A request to persist one snapshot.
#[derive(Debug, Clone)]
pub struct BackupCommand {
    pub operator: OperatorId,
    pub window_id: WindowId,
    pub state: StateBytes,
}

/// Whatever performs backups on behalf of a worker.
pub trait BackupAgent: Send + Sync {
    fn execute(&self, command: BackupCommand) -> Result<CheckpointInfo, PersistenceError>;
}

/// Writes backups synchronously to a [`CheckpointStore`].
pub struct StoreBackupAgent {
    store: Arc<dyn CheckpointStore>,
}

impl StoreBackupAgent {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }
}

impl BackupAgent for StoreBackupAgent {
    fn execute(&self, command: BackupCommand) -> Result<CheckpointInfo, PersistenceError> {
        let BackupCommand {
            operator,
            window_id,
            state,
        } = command;
        tracing::trace!("Backing up {operator} at {window_id}");
        self.store.save(&operator, window_id, &state)
    }
}

#[test]
fn store_agent_writes_through() {
    let store = Arc::new(InMemStore::new());
    let agent = StoreBackupAgent::new(store.clone());
    let operator = OperatorId::new("op");
    let info = agent
        .execute(BackupCommand {
            operator: operator.clone(),
            window_id: WindowId::new(1, 3),
            state: StateBytes::ser(&7u8).unwrap(),
        })
        .unwrap();
    assert_eq!(info.window_id, WindowId::new(1, 3));
    assert_eq!(
        store.load_latest(&operator).unwrap().map(|(w, _)| w),
        Some(WindowId::new(1, 3))
    );
}
