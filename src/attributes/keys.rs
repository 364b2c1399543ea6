//! Built-in scopes and the keys the runtime itself reads.

use super::AttributeKey;
use super::KeyRegistry;
use super::Scope;
use crate::errors::ConfigError;

/// Attributes of a whole application plan.
pub struct ApplicationScope;

impl Scope for ApplicationScope {
    const NAME: &'static str = "application";
}

/// Attributes of a single operator.
pub struct OperatorScope;

impl Scope for OperatorScope {
    const NAME: &'static str = "operator";
}

/// Values used when a key is absent from its store.
pub mod defaults {
    pub const CHECKPOINT_WINDOW_COUNT: u32 = 60;
    pub const STREAMING_WINDOW_SIZE_MILLIS: u64 = 500;
    /// Unbounded: every operator can get its own unit.
    pub const CONTAINERS_MAX_COUNT: u32 = u32::MAX;
    pub const HEARTBEAT_INTERVAL_MILLIS: u64 = 1000;
    pub const CHECKPOINT_MAX_FAILURES: u32 = 3;
    pub const OPERATOR_MAX_RESTARTS: u32 = 5;
    pub const IDLE_TIMEOUT_MILLIS: u64 = 1000;
}

/// Handles to every key the runtime reads.
///
/// Registered once per [`KeyRegistry`]; planning code and the runtime
/// share the same instance.
#[derive(Debug, Clone)]
pub struct StandardKeys {
    /// Windows between two backup requests.
    pub checkpoint_window_count: AttributeKey<ApplicationScope, u32>,
    pub streaming_window_size_millis: AttributeKey<ApplicationScope, u64>,
    /// Cap on the number of execution units.
    pub containers_max_count: AttributeKey<ApplicationScope, u32>,
    pub heartbeat_interval_millis: AttributeKey<ApplicationScope, u64>,
    /// Consecutive failed backups before the operator is failed.
    pub checkpoint_max_failures: AttributeKey<ApplicationScope, u32>,
    pub operator_max_restarts: AttributeKey<ApplicationScope, u32>,
    /// Longest a worker waits for input before going back to its
    /// window boundary.
    pub idle_timeout_millis: AttributeKey<OperatorScope, u64>,
    /// Per-operator override of the application-wide checkpoint
    /// cadence.
    pub operator_checkpoint_window_count: AttributeKey<OperatorScope, u32>,
}

impl StandardKeys {
    pub fn register(registry: &KeyRegistry) -> Result<Self, ConfigError> {
        Ok(Self {
            checkpoint_window_count: registry.register("checkpoint_window_count")?,
            streaming_window_size_millis: registry.register("streaming_window_size_millis")?,
            containers_max_count: registry.register("containers_max_count")?,
            heartbeat_interval_millis: registry.register("heartbeat_interval_millis")?,
            checkpoint_max_failures: registry.register("checkpoint_max_failures")?,
            operator_max_restarts: registry.register("operator_max_restarts")?,
            idle_timeout_millis: registry.register("idle_timeout_millis")?,
            operator_checkpoint_window_count: registry.register("checkpoint_window_count")?,
        })
    }
}

#[test]
fn registers_in_both_scopes() {
    let registry = KeyRegistry::new();
    let keys = StandardKeys::register(&registry).unwrap();
    assert_eq!(keys.checkpoint_window_count.scope(), ApplicationScope::id());
    assert_eq!(keys.operator_checkpoint_window_count.scope(), OperatorScope::id());
    assert_eq!(
        registry.names(OperatorScope::id()),
        vec!["checkpoint_window_count", "idle_timeout_millis"]
    );
    assert_eq!(registry.names(ApplicationScope::id()).len(), 6);
}

#[test]
fn registering_twice_fails() {
    let registry = KeyRegistry::new();
    StandardKeys::register(&registry).unwrap();
    assert!(matches!(
        StandardKeys::register(&registry),
        Err(ConfigError::DuplicateKey { .. })
    ));
}
