//! Data model of the recovery system.
//!
//! A checkpoint store is a K-V mapping from `(OperatorId, WindowId)`
//! to [`StateBytes`].

use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::window::WindowId;

/// Unique name of an operator in a plan.
///
/// Checkpoints are keyed off of this so state is never mixed between
/// operators.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperatorId(pub(crate) String);

impl OperatorId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperatorId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A snapshot of one operator's state.
///
/// The recovery system only deals in bytes so each operator can keep
/// whatever state type it wants.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBytes(pub(crate) Vec<u8>);

impl StateBytes {
    /// State of an operator that keeps none.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Serialize operator state into bytes the recovery system can
    /// store.
    pub fn ser<T: Serialize>(obj: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_vec(obj).map(Self)
    }

    /// Deserialize bytes from the recovery system back into operator
    /// state.
    pub fn de<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for StateBytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "StateBytes({} bytes)", self.0.len())
    }
}

/// Metadata about one persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub window_id: WindowId,
    /// Size of the snapshot in bytes.
    pub size: usize,
    pub created_at: DateTime<Utc>,
}

/// Per-operator checkpoint progress.
///
/// Both windows only ever move forward, and nothing is committed that
/// wasn't checkpointed first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointState {
    last_checkpointed: Option<WindowId>,
    last_committed: Option<WindowId>,
}

impl CheckpointState {
    pub fn last_checkpointed(&self) -> Option<WindowId> {
        self.last_checkpointed
    }

    pub fn last_committed(&self) -> Option<WindowId> {
        self.last_committed
    }

    /// Returns `true` if this moved the checkpointed window forward.
    pub fn advance_checkpointed(&mut self, window: WindowId) -> bool {
        if self.last_checkpointed.map_or(true, |last| window > last) {
            self.last_checkpointed = Some(window);
            true
        } else {
            false
        }
    }

    /// Returns `true` if this moved the committed window forward.
    ///
    /// Refuses to commit past the last checkpointed window.
    pub fn advance_committed(&mut self, window: WindowId) -> bool {
        let checkpointed = self.last_checkpointed.map_or(false, |last| window <= last);
        let forward = self.last_committed.map_or(true, |last| window > last);
        if checkpointed && forward {
            self.last_committed = Some(window);
            true
        } else {
            false
        }
    }
}

#[test]
fn state_bytes_round_trip_operator_state() {
    let state = (3u64, vec!["a".to_owned()]);
    let bytes = StateBytes::ser(&state).unwrap();
    assert_eq!(bytes.de::<(u64, Vec<String>)>().unwrap(), state);
    assert!(bytes.de::<String>().is_err());
}

#[test]
fn checkpoint_state_is_monotonic() {
    let mut state = CheckpointState::default();
    assert!(!state.advance_committed(WindowId::new(1, 1)));

    assert!(state.advance_checkpointed(WindowId::new(1, 2)));
    assert!(!state.advance_checkpointed(WindowId::new(1, 2)));
    assert!(!state.advance_checkpointed(WindowId::new(1, 1)));

    assert!(state.advance_committed(WindowId::new(1, 1)));
    assert!(!state.advance_committed(WindowId::new(1, 1)));
    // Can't pass the checkpointed window.
    assert!(!state.advance_committed(WindowId::new(1, 3)));
    assert!(state.advance_committed(WindowId::new(1, 2)));
    assert_eq!(state.last_committed(), Some(WindowId::new(1, 2)));
}
