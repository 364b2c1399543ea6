//! Error taxonomy.
//!
//! There are four classes of trouble and they are handled very
//! differently:
//!
//! - [`ConfigError`] is fatal at setup and never retried.
//! - [`PersistenceError`] comes out of a backup and is retried at the
//!   next scheduled checkpoint interval. Too many in a row escalate
//!   into a [`WorkerFailure`].
//! - [`ListenerError`] is a failing checkpoint or commit callback. It
//!   is fatal to the owning operator, which is torn down and restarted
//!   from its last good checkpoint.
//! - Heartbeat ring overflow is not an error at all; see
//!   [`crate::context::HeartbeatRing::push`].

use std::panic::Location;

use crate::recovery::model::OperatorId;
use crate::window::WindowId;

/// Boxed error returned by operator and listener code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Misconfiguration detected while setting up attributes or plans.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{location} invalid scope: store is bound to `{bound}` but key `{key}` is in `{requested}`")]
    ScopeMismatch {
        location: String,
        bound: &'static str,
        requested: &'static str,
        key: String,
    },
    #[error("{location} unknown key: `{name}` is not registered in scope `{scope}`")]
    UnknownKey {
        location: String,
        scope: &'static str,
        name: String,
    },
    #[error("{location} key `{name}` is already registered in scope `{scope}`")]
    DuplicateKey {
        location: String,
        scope: &'static str,
        name: String,
    },
    #[error("{location} key `{name}` holds a different value type than requested")]
    TypeMismatch { location: String, name: String },
    #[error("{location} invalid value for `{name}`: {reason}")]
    InvalidValue {
        location: String,
        name: String,
        reason: String,
    },
    #[error("{location} invalid plan: {reason}")]
    InvalidPlan { location: String, reason: String },
    #[error("invalid log level: {0}")]
    LogLevel(String),
}

impl ConfigError {
    #[track_caller]
    pub(crate) fn invalid_plan(reason: impl Into<String>) -> Self {
        Self::InvalidPlan {
            location: caller(),
            reason: reason.into(),
        }
    }

    #[track_caller]
    pub(crate) fn invalid_value(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            location: caller(),
            name: name.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Failure writing or reading a checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("checkpoint database migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),
    #[error("error encoding operator state: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("checkpoint for {operator} at window {window} is corrupt: {reason}")]
    Corrupt {
        operator: OperatorId,
        window: WindowId,
        reason: String,
    },
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// A checkpoint listener callback failed.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("`checkpointed({window})` failed on {operator}: {source}")]
    Checkpointed {
        operator: OperatorId,
        window: WindowId,
        source: BoxError,
    },
    #[error("`committed({window})` failed on {operator}: {source}")]
    Committed {
        operator: OperatorId,
        window: WindowId,
        source: BoxError,
    },
}

/// Something fatal happened to a single operator instance.
///
/// The supervisor reacts to all of these by tearing the instance down
/// and redeploying it from its last good checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum WorkerFailure {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("{operator} failed {attempts} consecutive backups, last error: {source}")]
    BackupsExhausted {
        operator: OperatorId,
        attempts: u32,
        source: PersistenceError,
    },
    #[error("{operator} failed in `{phase}`: {source}")]
    Operator {
        operator: OperatorId,
        phase: &'static str,
        source: BoxError,
    },
    #[error("{operator} could not be restored: {source}")]
    Restore {
        operator: OperatorId,
        source: PersistenceError,
    },
}

/// Failure of a whole run.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("{operator} exceeded its restart budget of {budget}; last failure: {source}")]
    RestartsExhausted {
        operator: OperatorId,
        budget: u32,
        source: WorkerFailure,
    },
    #[error("unable to spawn worker thread for {operator}: {source}")]
    Spawn {
        operator: OperatorId,
        source: std::io::Error,
    },
    #[error("worker thread for {0} panicked")]
    Panicked(OperatorId),
}

/// Location of whoever called the `#[track_caller]` function that
/// called this, formatted as `(file:line:col)`.
#[track_caller]
pub(crate) fn caller() -> String {
    prepend_caller(Location::caller(), "")
}

/// Prepend '({caller}) ' to the message.
fn prepend_caller(caller: &Location, msg: &str) -> String {
    if msg.is_empty() {
        format!("({caller})")
    } else {
        format!("({caller}) {msg}")
    }
}

/// Prepend the name of the current thread to each line, if present.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines().map(|line| format!("<{tname}> {line}\n")).collect()
}

#[test]
fn caller_points_at_call_site() {
    let err = ConfigError::invalid_plan("no operators");
    let msg = err.to_string();
    assert!(msg.contains("errors.rs"), "{msg}");
    assert!(msg.ends_with("invalid plan: no operators"), "{msg}");
}

#[test]
fn prepend_tname_tags_every_line() {
    let out = std::thread::Builder::new()
        .name("unit-0:source".to_owned())
        .spawn(|| prepend_tname("one\ntwo".to_owned()))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(out, "<unit-0:source> one\n<unit-0:source> two\n");
}
