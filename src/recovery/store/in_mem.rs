//! Checkpoint store with all data in memory.
//!
//! Nothing survives the process, so this only recovers from operator
//! failures, not from a crash of the whole run. That's all a
//! [`crate::run::LocalCluster`] can restart anyway.

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;

use super::CheckpointStore;
use crate::errors::PersistenceError;
use crate::recovery::model::*;
use crate::window::WindowId;

#[derive(Debug, Default)]
pub struct InMemStore {
    db: Mutex<HashMap<OperatorId, BTreeMap<WindowId, (CheckpointInfo, StateBytes)>>>,
}

impl InMemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemStore {
    fn save(
        &self,
        operator: &OperatorId,
        window: WindowId,
        state: &StateBytes,
    ) -> Result<CheckpointInfo, PersistenceError> {
        let info = CheckpointInfo {
            window_id: window,
            size: state.len(),
            created_at: Utc::now(),
        };
        tracing::trace!("Saving {info:?} for {operator}");
        self.db
            .lock()
            .entry(operator.clone())
            .or_default()
            .insert(window, (info.clone(), state.clone()));
        Ok(info)
    }

    fn load(
        &self,
        operator: &OperatorId,
        window: WindowId,
    ) -> Result<Option<(WindowId, StateBytes)>, PersistenceError> {
        Ok(self.db.lock().get(operator).and_then(|snaps| {
            snaps
                .range(..=window)
                .next_back()
                .map(|(window, (_info, state))| (*window, state.clone()))
        }))
    }

    fn list(&self, operator: &OperatorId) -> Result<Vec<CheckpointInfo>, PersistenceError> {
        Ok(self
            .db
            .lock()
            .get(operator)
            .map(|snaps| snaps.values().map(|(info, _state)| info.clone()).collect())
            .unwrap_or_default())
    }

    fn purge_before(
        &self,
        operator: &OperatorId,
        window: WindowId,
    ) -> Result<usize, PersistenceError> {
        let mut db = self.db.lock();
        let Some(snaps) = db.get_mut(operator) else {
            return Ok(0);
        };
        // `split_off` returns the part to keep, so swap it back in.
        let keep = snaps.split_off(&window);
        let garbage = std::mem::replace(snaps, keep);
        Ok(garbage.len())
    }

    fn discard_after(
        &self,
        operator: &OperatorId,
        keep_through: Option<WindowId>,
    ) -> Result<usize, PersistenceError> {
        let mut db = self.db.lock();
        let Some(snaps) = db.get_mut(operator) else {
            return Ok(0);
        };
        let discarded = match keep_through {
            Some(window) => match window.next() {
                Some(after) => snaps.split_off(&after),
                None => BTreeMap::new(),
            },
            None => std::mem::take(snaps),
        };
        Ok(discarded.len())
    }
}

#[cfg(test)]
fn w(seq: u32) -> WindowId {
    WindowId::new(100, seq)
}

#[test]
fn load_finds_newest_at_or_before() {
    let store = InMemStore::new();
    let op = OperatorId::new("op1");
    for seq in [2, 4, 6] {
        store
            .save(&op, w(seq), &StateBytes::ser(&seq).unwrap())
            .unwrap();
    }

    let (window, state) = store.load(&op, w(5)).unwrap().unwrap();
    assert_eq!(window, w(4));
    assert_eq!(state.de::<u32>().unwrap(), 4);
    assert_eq!(store.load(&op, w(4)).unwrap().unwrap().0, w(4));
    assert!(store.load(&op, w(1)).unwrap().is_none());
    assert_eq!(store.load_latest(&op).unwrap().unwrap().0, w(6));
    assert!(store.load_latest(&OperatorId::new("op2")).unwrap().is_none());
}

#[test]
fn purge_keeps_window_and_newer() {
    let store = InMemStore::new();
    let op = OperatorId::new("op1");
    for seq in [1, 2, 3, 5] {
        store.save(&op, w(seq), &StateBytes::empty()).unwrap();
    }

    assert_eq!(store.purge_before(&op, w(3)).unwrap(), 2);
    let found: Vec<_> = store
        .list(&op)
        .unwrap()
        .into_iter()
        .map(|info| info.window_id)
        .collect();
    assert_eq!(found, vec![w(3), w(5)]);
    assert_eq!(store.purge_before(&OperatorId::new("none"), w(3)).unwrap(), 0);
}

#[test]
fn save_replaces_same_window() {
    let store = InMemStore::new();
    let op = OperatorId::new("op1");
    store.save(&op, w(1), &StateBytes::ser(&"x").unwrap()).unwrap();
    store.save(&op, w(1), &StateBytes::ser(&"y").unwrap()).unwrap();
    assert_eq!(store.list(&op).unwrap().len(), 1);
    let (_, state) = store.load_latest(&op).unwrap().unwrap();
    assert_eq!(state.de::<String>().unwrap(), "y");
}

#[test]
fn discard_after_drops_newer() {
    let store = InMemStore::new();
    let op = OperatorId::new("op1");
    for seq in [1, 2, 3] {
        store.save(&op, w(seq), &StateBytes::empty()).unwrap();
    }
    assert_eq!(store.discard_after(&op, Some(w(1))).unwrap(), 2);
    assert_eq!(store.load_latest(&op).unwrap().unwrap().0, w(1));
    assert_eq!(store.discard_after(&op, None).unwrap(), 1);
    assert!(store.list(&op).unwrap().is_empty());
}

#[test]
fn discard_after_last_window_keeps_all() {
    let store = InMemStore::new();
    let op = OperatorId::new("op1");
    let last = WindowId::new(u32::MAX, u32::MAX);
    store.save(&op, w(1), &StateBytes::empty()).unwrap();
    store.save(&op, last, &StateBytes::empty()).unwrap();
    assert_eq!(store.discard_after(&op, Some(last)).unwrap(), 0);
    assert_eq!(store.list(&op).unwrap().len(), 2);
}
