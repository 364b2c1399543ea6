//! The operator programming model.
//!
//! An operator is driven one window at a time by its worker thread:
//! [`Operator::begin_window`], then every input tuple of the window
//! through [`Operator::process`] (or a single [`Operator::emit`] call
//! for sources), then [`Operator::end_window`]. Between two windows
//! the worker may [`Operator::snapshot`] the operator for a
//! checkpoint.
//!
//! Operators that need to know when their checkpoints are durable or
//! committed implement [`CheckpointListener`] and return themselves
//! from [`Operator::as_checkpoint_listener`].

use serde::Deserialize;
use serde::Serialize;

use crate::context::ExecutionContext;
use crate::errors::BoxError;
use crate::recovery::StateBytes;
use crate::window::WindowId;

/// Identity of a tuple: the window it was produced in and its
/// position within that window's output.
///
/// Replaying a window deterministically reproduces the same ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TupleId {
    pub window: WindowId,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    pub id: TupleId,
    pub payload: serde_json::Value,
}

/// Collects a window's output tuples and numbers them.
#[derive(Debug)]
pub struct Emitter {
    window: WindowId,
    tuples: Vec<Tuple>,
}

impl Emitter {
    pub(crate) fn new(window: WindowId) -> Self {
        Self {
            window,
            tuples: Vec::new(),
        }
    }

    pub fn window(&self) -> WindowId {
        self.window
    }

    pub fn emit(&mut self, payload: serde_json::Value) {
        let index = self.tuples.len() as u32;
        self.tuples.push(Tuple {
            id: TupleId {
                window: self.window,
                index,
            },
            payload,
        });
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub(crate) fn into_tuples(self) -> Vec<Tuple> {
        self.tuples
    }
}

/// What a source did in [`Operator::emit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emission {
    /// There will be more windows.
    More,
    /// This was the last window; the output stream ends after it.
    Done,
}

/// Callbacks about the durability of an operator's own checkpoints.
///
/// Both are invoked on the operator's worker thread at a window
/// boundary. An error from either is fatal to the operator instance,
/// which is then restarted from its last good checkpoint.
pub trait CheckpointListener {
    /// The snapshot taken after `window` was persisted.
    fn checkpointed(&mut self, window: WindowId) -> Result<(), BoxError>;

    /// Nothing at or before `window` will be replayed to this
    /// operator again.
    fn committed(&mut self, window: WindowId) -> Result<(), BoxError>;
}

/// A unit of processing in a plan.
///
/// All methods default to doing nothing, so a stateless pass-through
/// operator only has to implement [`Operator::process`].
pub trait Operator: Send {
    fn setup(&mut self, _context: &ExecutionContext) -> Result<(), BoxError> {
        Ok(())
    }

    fn begin_window(&mut self, _window: WindowId) -> Result<(), BoxError> {
        Ok(())
    }

    /// Handle one tuple arriving on input `port`. Ports are numbered
    /// in the order streams into this operator were added to the plan.
    fn process(&mut self, _port: usize, _tuple: Tuple, _out: &mut Emitter) -> Result<(), BoxError> {
        Ok(())
    }

    /// Produce this window's tuples. Only called on operators without
    /// inputs.
    fn emit(&mut self, _window: WindowId, _out: &mut Emitter) -> Result<Emission, BoxError> {
        Ok(Emission::Done)
    }

    fn end_window(&mut self, _window: WindowId, _out: &mut Emitter) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called once when the operator is shut down, whether it finished,
    /// was terminated or is about to be replaced after a failure.
    fn teardown(&mut self) {}

    /// State as of the end of the last window.
    fn snapshot(&self) -> Result<StateBytes, BoxError> {
        Ok(StateBytes::empty())
    }

    /// Replace state with a snapshot. Called before
    /// [`Operator::setup`].
    fn restore(&mut self, _state: StateBytes) -> Result<(), BoxError> {
        Ok(())
    }

    /// Return `Some(self)` to receive checkpoint notifications.
    fn as_checkpoint_listener(&mut self) -> Option<&mut dyn CheckpointListener> {
        None
    }
}

/// Builds fresh operator instances, once at deploy time and again for
/// every restart.
pub type OperatorFactory = std::sync::Arc<dyn Fn() -> Box<dyn Operator> + Send + Sync>;

#[test]
fn emitter_numbers_tuples_within_window() {
    let window = WindowId::new(9, 1);
    let mut out = Emitter::new(window);
    out.emit(serde_json::json!("a"));
    out.emit(serde_json::json!("b"));
    let ids: Vec<_> = out.into_tuples().into_iter().map(|t| t.id).collect();
    assert_eq!(
        ids,
        vec![TupleId { window, index: 0 }, TupleId { window, index: 1 }]
    );
}

#[test]
fn listener_capability_is_optional() {
    struct Plain;
    impl Operator for Plain {}

    struct Listening(Vec<WindowId>);
    impl Operator for Listening {
        fn as_checkpoint_listener(&mut self) -> Option<&mut dyn CheckpointListener> {
            Some(self)
        }
    }
    impl CheckpointListener for Listening {
        fn checkpointed(&mut self, window: WindowId) -> Result<(), BoxError> {
            self.0.push(window);
            Ok(())
        }

        fn committed(&mut self, _window: WindowId) -> Result<(), BoxError> {
            Err("nope".into())
        }
    }

    let mut ops: Vec<Box<dyn Operator>> = vec![Box::new(Plain), Box::new(Listening(vec![]))];
    assert!(ops[0].as_checkpoint_listener().is_none());
    let listener = ops[1].as_checkpoint_listener().unwrap();
    listener.checkpointed(WindowId::new(1, 1)).unwrap();
    assert!(listener.committed(WindowId::new(1, 1)).is_err());
}
