//! Scoped, typed configuration attributes.
//!
//! Planning code registers [`AttributeKey`]s in a [`KeyRegistry`],
//! fills an [`AttributeStore`] with values, and hands the store to
//! the runtime. Workers read values back with
//! [`AttributeStore::attr_value`], falling back to a default when
//! nothing was set.
//!
//! Each key belongs to a **scope**: a zero-sized marker type such as
//! [`ApplicationScope`] or [`OperatorScope`]. A store is bound to the
//! scope of the first key used with it and rejects keys of any other
//! scope afterwards.
//!
//! There is no process-wide key table. The registry is an ordinary
//! value owned by whoever bootstraps the plan and shared by [`Arc`]
//! with every store that needs to resolve keys by name (for
//! [`AttributeStore::copy_to`] and
//! [`AttributeStore::from_value_map`]).

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::caller;
use crate::errors::ConfigError;

pub(crate) mod keys;
pub(crate) mod store;

pub use keys::defaults;
pub use keys::ApplicationScope;
pub use keys::OperatorScope;
pub use keys::StandardKeys;
pub use store::AttributeSlot;
pub use store::AttributeStore;

/// Marker trait for attribute scopes.
pub trait Scope: 'static {
    /// Human readable scope name used in errors and logs.
    const NAME: &'static str;

    fn id() -> ScopeId {
        ScopeId {
            type_id: TypeId::of::<Self>(),
            name: Self::NAME,
        }
    }
}

/// Runtime identity of a [`Scope`].
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ScopeId {
    type_id: TypeId,
    name: &'static str,
}

impl ScopeId {
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Everything an attribute value needs to be stored, compared,
/// shared across threads and shipped in a value map.
pub trait AttrValue:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> AttrValue for T where
    T: Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Typed, scoped name of an attribute.
///
/// Only obtainable from [`KeyRegistry::register`] or
/// [`KeyRegistry::lookup`], so every key in use is known to some
/// registry.
pub struct AttributeKey<S, T> {
    name: Arc<str>,
    _marker: PhantomData<fn() -> (S, T)>,
}

impl<S, T> AttributeKey<S, T> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<S: Scope, T> AttributeKey<S, T> {
    pub fn scope(&self) -> ScopeId {
        S::id()
    }
}

impl<S, T> Clone for AttributeKey<S, T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<S: Scope, T> fmt::Debug for AttributeKey<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", S::NAME, self.name)
    }
}

/// Registry of all known keys, by scope and name.
#[derive(Default)]
pub struct KeyRegistry {
    keys: RwLock<HashMap<(ScopeId, String), Arc<dyn ErasedKey>>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new key.
    ///
    /// Registering the same `(scope, name)` twice is a configuration
    /// error, even with the same value type.
    #[track_caller]
    pub fn register<S: Scope, T: AttrValue>(
        &self,
        name: &str,
    ) -> Result<AttributeKey<S, T>, ConfigError> {
        let location = caller();
        let mut keys = self.keys.write();
        let entry = (S::id(), name.to_owned());
        if keys.contains_key(&entry) {
            return Err(ConfigError::DuplicateKey {
                location,
                scope: S::NAME,
                name: name.to_owned(),
            });
        }
        let key = AttributeKey::<S, T> {
            name: Arc::from(name),
            _marker: PhantomData,
        };
        keys.insert(entry, Arc::new(TypedKey(key.clone())));
        tracing::trace!("Registered attribute key {key:?}");
        Ok(key)
    }

    /// Find a previously registered key with a known value type.
    #[track_caller]
    pub fn lookup<S: Scope, T: AttrValue>(
        &self,
        name: &str,
    ) -> Result<AttributeKey<S, T>, ConfigError> {
        let location = caller();
        let erased = self.resolve(S::id(), name).ok_or_else(|| ConfigError::UnknownKey {
            location: location.clone(),
            scope: S::NAME,
            name: name.to_owned(),
        })?;
        if erased.value_type() != TypeId::of::<T>() {
            return Err(ConfigError::TypeMismatch {
                location,
                name: name.to_owned(),
            });
        }
        Ok(AttributeKey {
            name: Arc::from(name),
            _marker: PhantomData,
        })
    }

    pub(crate) fn resolve(&self, scope: ScopeId, name: &str) -> Option<Arc<dyn ErasedKey>> {
        self.keys.read().get(&(scope, name.to_owned())).cloned()
    }

    /// Names of all keys registered in a scope.
    pub fn names(&self, scope: ScopeId) -> Vec<String> {
        let mut names: Vec<_> = self
            .keys
            .read()
            .keys()
            .filter(|(key_scope, _)| *key_scope == scope)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Type-erased view of a registered key, so stores can move values
/// around by name without knowing their types.
pub(crate) trait ErasedKey: Send + Sync {
    fn value_type(&self) -> TypeId;

    /// Set the value held by `slot` into the same-named slot of
    /// `target`.
    fn copy_slot(&self, slot: &dyn store::ErasedSlot, target: &AttributeStore)
        -> Result<(), ConfigError>;

    /// Decode a JSON value and set it into `target`.
    fn set_json(&self, target: &AttributeStore, value: serde_json::Value)
        -> Result<(), ConfigError>;
}

struct TypedKey<S, T>(AttributeKey<S, T>);

impl<S: Scope, T: AttrValue> ErasedKey for TypedKey<S, T> {
    fn value_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn copy_slot(
        &self,
        slot: &dyn store::ErasedSlot,
        target: &AttributeStore,
    ) -> Result<(), ConfigError> {
        let slot = slot
            .as_any()
            .downcast_ref::<AttributeSlot<T>>()
            .ok_or_else(|| ConfigError::TypeMismatch {
                location: caller(),
                name: self.0.name().to_owned(),
            })?;
        if let Some(value) = slot.get() {
            target.attr(&self.0)?.set(value);
        }
        Ok(())
    }

    fn set_json(
        &self,
        target: &AttributeStore,
        value: serde_json::Value,
    ) -> Result<(), ConfigError> {
        let value: T = serde_json::from_value(value)
            .map_err(|err| ConfigError::invalid_value(self.0.name(), err.to_string()))?;
        target.attr(&self.0)?.set(value);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) struct TestScope;

#[cfg(test)]
impl Scope for TestScope {
    const NAME: &'static str = "test";
}

#[test]
fn duplicate_registration_is_rejected() {
    let registry = KeyRegistry::new();
    registry
        .register::<ApplicationScope, u32>("checkpoint_window_count")
        .unwrap();
    let err = registry
        .register::<ApplicationScope, u32>("checkpoint_window_count")
        .unwrap_err();
    assert!(matches!(err, ConfigError::DuplicateKey { .. }), "{err}");

    // Same name in another scope is a different key.
    registry
        .register::<OperatorScope, u32>("checkpoint_window_count")
        .unwrap();
}

#[test]
fn lookup_checks_value_type() {
    let registry = KeyRegistry::new();
    registry.register::<TestScope, u64>("size").unwrap();

    assert_eq!(registry.lookup::<TestScope, u64>("size").unwrap().name(), "size");
    assert!(matches!(
        registry.lookup::<TestScope, String>("size"),
        Err(ConfigError::TypeMismatch { .. })
    ));
    assert!(matches!(
        registry.lookup::<TestScope, u64>("missing"),
        Err(ConfigError::UnknownKey { .. })
    ));
}

#[test]
fn names_are_per_scope() {
    let registry = KeyRegistry::new();
    registry.register::<TestScope, u64>("b").unwrap();
    registry.register::<TestScope, u64>("a").unwrap();
    registry.register::<OperatorScope, u64>("c").unwrap();
    assert_eq!(registry.names(TestScope::id()), vec!["a", "b"]);
}
