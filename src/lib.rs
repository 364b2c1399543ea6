//! Checkpointing and recovery for windowed stream processing.
//!
//! A [`dataflow::LogicalPlan`] of [`operators::Operator`]s connected by
//! streams is run by a [`run::LocalCluster`]. Tuples flow in discrete,
//! ordered windows. Every K windows each operator's state is saved in a
//! [`recovery::CheckpointStore`]; a failed operator is rebuilt from its
//! newest checkpoint and replays the windows after it, without any
//! tuple being lost or seen twice further downstream.
//!
//! Start with [`run`] for the moving parts and [`recovery`] for how
//! checkpoints, commits and resume fit together.

#[macro_use]
pub mod metrics;

pub mod attributes;
pub mod buffer;
pub mod context;
pub mod coordinator;
pub mod dataflow;
pub mod errors;
pub mod heartbeat;
pub mod logging;
pub mod operators;
pub mod recovery;
pub mod run;
pub mod window;
pub(crate) mod worker;

pub use crate::errors::BoxError;
pub use crate::errors::ExecutionError;
pub use crate::run::LocalCluster;
pub use crate::run::RunSummary;
pub use crate::run::TerminateHandle;
pub use crate::window::WindowId;
