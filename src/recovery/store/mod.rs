//! Implementations of checkpoint stores.
//!
//! A store is modeled as a K-V table from `(OperatorId, WindowId)` to
//! a state snapshot. See [`super::model`] for the types involved.
//!
//! Implement [`CheckpointStore`] to make a new store. Stores are
//! shared between the coordinator and every worker thread, so all
//! methods take `&self`.

use crate::errors::PersistenceError;
use crate::recovery::model::*;
use crate::window::WindowId;

pub(crate) mod in_mem;
pub(crate) mod sqlite;

pub trait CheckpointStore: Send + Sync {
    /// Persist a snapshot, replacing any previous snapshot of the
    /// same operator at the same window.
    fn save(
        &self,
        operator: &OperatorId,
        window: WindowId,
        state: &StateBytes,
    ) -> Result<CheckpointInfo, PersistenceError>;

    /// Newest snapshot taken at or before `window`.
    fn load(
        &self,
        operator: &OperatorId,
        window: WindowId,
    ) -> Result<Option<(WindowId, StateBytes)>, PersistenceError>;

    /// Newest snapshot overall.
    fn load_latest(
        &self,
        operator: &OperatorId,
    ) -> Result<Option<(WindowId, StateBytes)>, PersistenceError> {
        self.load(operator, WindowId::from_raw(u64::MAX))
    }

    /// All snapshots of an operator, oldest first.
    fn list(&self, operator: &OperatorId) -> Result<Vec<CheckpointInfo>, PersistenceError>;

    /// Delete every snapshot strictly older than `window`. Returns the
    /// number deleted.
    fn purge_before(&self, operator: &OperatorId, window: WindowId)
        -> Result<usize, PersistenceError>;

    /// Delete every snapshot newer than `keep_through`, or all of
    /// them if `None`. Used when a run resumes to an older cut than
    /// the newest snapshots.
    fn discard_after(
        &self,
        operator: &OperatorId,
        keep_through: Option<WindowId>,
    ) -> Result<usize, PersistenceError>;
}
