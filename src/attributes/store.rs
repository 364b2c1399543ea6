//! Attribute slots and stores.

use std::any::Any;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::ser::Error;
use serde::Serialize;

use super::AttrValue;
use super::AttributeKey;
use super::KeyRegistry;
use super::Scope;
use super::ScopeId;
use crate::errors::caller;
use crate::errors::ConfigError;

/// Holds at most one value of type `T`.
///
/// All operations are lock-free. Compare-and-swap retries compare
/// values by equality, but install by pointer, so a concurrent writer
/// storing an equal value still makes a stale CAS retry.
pub struct AttributeSlot<T> {
    value: ArcSwapOption<T>,
}

impl<T: AttrValue> AttributeSlot<T> {
    fn new() -> Self {
        Self {
            value: ArcSwapOption::empty(),
        }
    }

    pub fn get(&self) -> Option<T> {
        self.value.load().as_deref().cloned()
    }

    pub fn set(&self, value: T) {
        self.value.store(Some(Arc::new(value)));
    }

    /// Set and return the previous value.
    pub fn get_and_set(&self, value: T) -> Option<T> {
        self.value.swap(Some(Arc::new(value))).map(unwrap_or_clone)
    }

    /// Set only if nothing is present.
    ///
    /// Returns [`None`] if the value was set, otherwise the value
    /// already there, which is left untouched.
    pub fn set_if_absent(&self, value: T) -> Option<T> {
        let absent: Option<Arc<T>> = None;
        let prev = self.value.compare_and_swap(&absent, Some(Arc::new(value)));
        prev.as_deref().cloned()
    }

    /// Replace the current value with `new` iff it equals `old`.
    ///
    /// Pass `old = None` to expect absence.
    pub fn compare_and_set(&self, old: Option<&T>, new: T) -> bool {
        let new = Some(Arc::new(new));
        loop {
            let current = self.value.load_full();
            if current.as_deref() != old {
                return false;
            }
            let prev = self.value.compare_and_swap(&current, new.clone());
            if same_arc(&prev, &current) {
                return true;
            }
        }
    }

    /// Clear back to absent.
    pub fn remove(&self) {
        self.value.store(None);
    }

    pub fn is_present(&self) -> bool {
        self.value.load().is_some()
    }
}

impl<T: AttrValue> fmt::Debug for AttributeSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AttributeSlot").field(&self.get()).finish()
    }
}

fn same_arc<T>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

fn unwrap_or_clone<T: Clone>(arc: Arc<T>) -> T {
    Arc::try_unwrap(arc).unwrap_or_else(|arc| (*arc).clone())
}

/// Type-erased [`AttributeSlot`].
pub(crate) trait ErasedSlot: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn is_present(&self) -> bool;

    fn to_json(&self) -> Result<Option<serde_json::Value>, serde_json::Error>;
}

impl<T: AttrValue> ErasedSlot for AttributeSlot<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn is_present(&self) -> bool {
        AttributeSlot::is_present(self)
    }

    fn to_json(&self) -> Result<Option<serde_json::Value>, serde_json::Error> {
        self.get().map(serde_json::to_value).transpose()
    }
}

struct StoreInner {
    /// Fixed by the first [`AttributeStore::attr`] call.
    scope: Option<ScopeId>,
    slots: HashMap<String, Arc<dyn ErasedSlot>>,
}

/// Mapping from attribute name to slot, bound to one scope.
pub struct AttributeStore {
    registry: Arc<KeyRegistry>,
    /// Slot creation is serialized here; slot access is not.
    inner: Mutex<StoreInner>,
}

impl AttributeStore {
    pub fn new(registry: Arc<KeyRegistry>) -> Self {
        Self {
            registry,
            inner: Mutex::new(StoreInner {
                scope: None,
                slots: HashMap::new(),
            }),
        }
    }

    /// Rebuild a store from a [`Self::value_map`] snapshot.
    ///
    /// Every name must resolve to a registered key of scope `S` and
    /// every value must decode as that key's type.
    #[track_caller]
    pub fn from_value_map<S: Scope>(
        registry: Arc<KeyRegistry>,
        values: BTreeMap<String, serde_json::Value>,
    ) -> Result<Self, ConfigError> {
        let location = caller();
        let store = Self::new(registry);
        store.bind_scope(S::id(), "<value map>", &location)?;
        for (name, value) in values {
            let key = store
                .registry
                .resolve(S::id(), &name)
                .ok_or_else(|| ConfigError::UnknownKey {
                    location: location.clone(),
                    scope: S::NAME,
                    name: name.clone(),
                })?;
            key.set_json(&store, value)?;
        }
        Ok(store)
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    /// Scope this store is bound to, if any key was used yet.
    pub fn scope(&self) -> Option<ScopeId> {
        self.inner.lock().scope
    }

    /// Get the slot for a key, creating it on first access.
    #[track_caller]
    pub fn attr<S: Scope, T: AttrValue>(
        &self,
        key: &AttributeKey<S, T>,
    ) -> Result<Arc<AttributeSlot<T>>, ConfigError> {
        let location = caller();
        let mut inner = self.inner.lock();
        match inner.scope {
            None => inner.scope = Some(S::id()),
            Some(bound) if bound != S::id() => {
                return Err(ConfigError::ScopeMismatch {
                    location,
                    bound: bound.name(),
                    requested: S::NAME,
                    key: key.name().to_owned(),
                })
            }
            Some(_) => {}
        }
        let slot = inner
            .slots
            .entry(key.name().to_owned())
            .or_insert_with(|| Arc::new(AttributeSlot::<T>::new()) as Arc<dyn ErasedSlot>)
            .clone();
        slot.into_any()
            .downcast::<AttributeSlot<T>>()
            .map_err(|_| ConfigError::TypeMismatch {
                location,
                name: key.name().to_owned(),
            })
    }

    /// Stored value, or `default` if never set or removed.
    ///
    /// Never creates a slot, so asking for a value does not bind the
    /// store's scope. A key from a scope other than the bound one
    /// never matches.
    pub fn attr_value<S: Scope, T: AttrValue>(&self, key: &AttributeKey<S, T>, default: T) -> T {
        let slot = {
            let inner = self.inner.lock();
            if inner.scope != Some(S::id()) {
                return default;
            }
            inner.slots.get(key.name()).cloned()
        };
        slot.and_then(|slot| slot.into_any().downcast::<AttributeSlot<T>>().ok())
            .and_then(|slot| slot.get())
            .unwrap_or(default)
    }

    /// Snapshot of all present values by name.
    pub fn value_map(&self) -> Result<BTreeMap<String, serde_json::Value>, ConfigError> {
        let slots: Vec<_> = {
            let inner = self.inner.lock();
            inner
                .slots
                .iter()
                .map(|(name, slot)| (name.clone(), slot.clone()))
                .collect()
        };
        let mut values = BTreeMap::new();
        for (name, slot) in slots {
            let value = slot
                .to_json()
                .map_err(|err| ConfigError::invalid_value(&name, err.to_string()))?;
            if let Some(value) = value {
                values.insert(name, value);
            }
        }
        Ok(values)
    }

    /// Set every present value of this store into `target`.
    ///
    /// Names are resolved in the target's registry under this store's
    /// scope.
    #[track_caller]
    pub fn copy_to(&self, target: &AttributeStore) -> Result<(), ConfigError> {
        let location = caller();
        let (scope, slots): (_, Vec<_>) = {
            let inner = self.inner.lock();
            let slots = inner
                .slots
                .iter()
                .filter(|(_, slot)| slot.is_present())
                .map(|(name, slot)| (name.clone(), slot.clone()))
                .collect();
            (inner.scope, slots)
        };
        let Some(scope) = scope else {
            // Nothing was ever stored.
            return Ok(());
        };
        for (name, slot) in slots {
            let key = target
                .registry
                .resolve(scope, &name)
                .ok_or_else(|| ConfigError::UnknownKey {
                    location: location.clone(),
                    scope: scope.name(),
                    name: name.clone(),
                })?;
            key.copy_slot(slot.as_ref(), target)?;
        }
        Ok(())
    }

    /// Override values from `(name, raw)` pairs, as
    /// [`Self::apply_env_overrides`] does from the environment.
    ///
    /// Raw values are parsed as JSON, falling back to a JSON string.
    /// Returns the number of values applied.
    pub fn apply_overrides<S: Scope>(
        &self,
        overrides: impl IntoIterator<Item = (String, String)>,
    ) -> Result<usize, ConfigError> {
        let mut applied = 0;
        for (name, raw) in overrides {
            if let Some(key) = self.registry.resolve(S::id(), &name) {
                let value = serde_json::from_str(&raw)
                    .unwrap_or_else(|_| serde_json::Value::String(raw.clone()));
                key.set_json(self, value)?;
                tracing::debug!("Attribute {}.{name} overridden with {raw:?}", S::NAME);
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Override registered keys of scope `S` from environment
    /// variables named `{prefix}{NAME}`, e.g.
    /// `TIDEWATER_CHECKPOINT_WINDOW_COUNT=4`.
    pub fn apply_env_overrides<S: Scope>(&self, prefix: &str) -> Result<usize, ConfigError> {
        let overrides = self
            .registry
            .names(S::id())
            .into_iter()
            .filter_map(|name| {
                let var = format!("{prefix}{}", name.to_uppercase());
                std::env::var(&var).ok().map(|raw| (name, raw))
            });
        self.apply_overrides::<S>(overrides)
    }

    fn bind_scope(&self, scope: ScopeId, what: &str, location: &str) -> Result<(), ConfigError> {
        let mut inner = self.inner.lock();
        match inner.scope {
            Some(bound) if bound != scope => Err(ConfigError::ScopeMismatch {
                location: location.to_owned(),
                bound: bound.name(),
                requested: scope.name(),
                key: what.to_owned(),
            }),
            _ => {
                inner.scope = Some(scope);
                Ok(())
            }
        }
    }
}

/// Serializes as the [`AttributeStore::value_map`].
impl Serialize for AttributeStore {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.value_map()
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl fmt::Debug for AttributeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value_map() {
            Ok(values) => f
                .debug_struct("AttributeStore")
                .field("scope", &self.scope())
                .field("values", &values)
                .finish(),
            Err(err) => write!(f, "AttributeStore(<{err}>)"),
        }
    }
}

#[cfg(test)]
use super::{ApplicationScope, OperatorScope, TestScope};

#[cfg(test)]
fn test_store() -> (Arc<KeyRegistry>, AttributeStore) {
    let registry = Arc::new(KeyRegistry::new());
    let store = AttributeStore::new(registry.clone());
    (registry, store)
}

#[test]
fn default_only_while_absent() {
    let (registry, store) = test_store();
    let key = registry.register::<TestScope, u32>("count").unwrap();

    assert_eq!(store.attr_value(&key, 7), 7);
    store.attr(&key).unwrap().set(2);
    assert_eq!(store.attr_value(&key, 7), 2);
    store.attr(&key).unwrap().set(3);
    assert_eq!(store.attr_value(&key, 7), 3);
    store.attr(&key).unwrap().remove();
    assert_eq!(store.attr_value(&key, 7), 7);
}

#[test]
fn default_is_never_stored() {
    let (registry, store) = test_store();
    let key = registry.register::<TestScope, u32>("count").unwrap();

    let slot = store.attr(&key).unwrap();
    assert_eq!(store.attr_value(&key, 9), 9);
    assert!(!slot.is_present());
    assert_eq!(store.value_map().unwrap(), BTreeMap::new());
}

#[test]
fn mixing_scopes_is_rejected() {
    let (registry, store) = test_store();
    let app = registry.register::<ApplicationScope, u32>("a").unwrap();
    let op = registry.register::<OperatorScope, u32>("b").unwrap();

    store.attr(&app).unwrap().set(1);
    let err = store.attr(&op).unwrap_err();
    assert!(matches!(err, ConfigError::ScopeMismatch { .. }), "{err}");
    assert_eq!(store.scope(), Some(ApplicationScope::id()));
}

#[test]
fn compare_and_set_requires_equal_current() {
    let (registry, store) = test_store();
    let key = registry.register::<TestScope, String>("name").unwrap();
    let slot = store.attr(&key).unwrap();

    assert!(!slot.compare_and_set(Some(&"a".to_owned()), "b".to_owned()));
    assert!(slot.compare_and_set(None, "a".to_owned()));
    assert!(!slot.compare_and_set(None, "z".to_owned()));
    assert!(slot.compare_and_set(Some(&"a".to_owned()), "b".to_owned()));
    assert_eq!(slot.get(), Some("b".to_owned()));
}

#[test]
fn set_if_absent_never_overwrites() {
    let (registry, store) = test_store();
    let key = registry.register::<TestScope, u64>("n").unwrap();
    let slot = store.attr(&key).unwrap();

    assert_eq!(slot.set_if_absent(1), None);
    assert_eq!(slot.set_if_absent(2), Some(1));
    assert_eq!(slot.get(), Some(1));
    assert_eq!(slot.get_and_set(5), Some(1));
    assert_eq!(slot.get(), Some(5));
}

#[test]
fn concurrent_compare_and_set_counts_exactly() {
    let (registry, store) = test_store();
    let key = registry.register::<TestScope, u64>("counter").unwrap();
    let slot = store.attr(&key).unwrap();
    slot.set(0);

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let slot = slot.clone();
            std::thread::spawn(move || {
                for _ in 0..250 {
                    loop {
                        let current = slot.get().unwrap();
                        if slot.compare_and_set(Some(&current), current + 1) {
                            break;
                        }
                    }
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(slot.get(), Some(1000));
}

#[test]
fn copy_to_resolves_in_target_registry() {
    let (registry, source) = test_store();
    let count = registry.register::<TestScope, u32>("count").unwrap();
    let label = registry.register::<TestScope, String>("label").unwrap();
    source.attr(&count).unwrap().set(4);
    source.attr(&label).unwrap().set("x".to_owned());
    // Absent slots aren't copied.
    let unset = registry.register::<TestScope, u32>("unset").unwrap();
    source.attr(&unset).unwrap();

    let target = AttributeStore::new(registry.clone());
    source.copy_to(&target).unwrap();
    assert_eq!(target.attr_value(&count, 0), 4);
    assert_eq!(target.attr_value(&label, String::new()), "x");
    assert!(!target.value_map().unwrap().contains_key("unset"));
}

#[test]
fn copy_to_unregistered_name_fails() {
    let (registry, source) = test_store();
    let count = registry.register::<TestScope, u32>("count").unwrap();
    source.attr(&count).unwrap().set(4);

    let other = AttributeStore::new(Arc::new(KeyRegistry::new()));
    let err = source.copy_to(&other).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownKey { .. }), "{err}");
}

#[test]
fn value_map_rebuilds_store() {
    let (registry, store) = test_store();
    let count = registry.register::<TestScope, u32>("count").unwrap();
    let ratio = registry.register::<TestScope, f64>("ratio").unwrap();
    store.attr(&count).unwrap().set(12);
    store.attr(&ratio).unwrap().set(0.5);

    let values = store.value_map().unwrap();
    assert_eq!(values["count"], serde_json::json!(12));

    let rebuilt = AttributeStore::from_value_map::<TestScope>(registry, values).unwrap();
    assert_eq!(rebuilt.attr_value(&count, 0), 12);
    assert_eq!(rebuilt.attr_value(&ratio, 0.0), 0.5);
}

#[test]
fn value_map_rejects_bad_values() {
    let (registry, _store) = test_store();
    registry.register::<TestScope, u32>("count").unwrap();

    let values = BTreeMap::from([("count".to_owned(), serde_json::json!("many"))]);
    let err = AttributeStore::from_value_map::<TestScope>(registry.clone(), values).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { .. }), "{err}");

    let values = BTreeMap::from([("nope".to_owned(), serde_json::json!(1))]);
    let err = AttributeStore::from_value_map::<TestScope>(registry, values).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownKey { .. }), "{err}");
}

#[test]
fn overrides_parse_json_or_string() {
    let (registry, store) = test_store();
    let count = registry.register::<TestScope, u32>("count").unwrap();
    let label = registry.register::<TestScope, String>("label").unwrap();

    let applied = store
        .apply_overrides::<TestScope>([
            ("count".to_owned(), "8".to_owned()),
            ("label".to_owned(), "plain text".to_owned()),
            ("unknown".to_owned(), "1".to_owned()),
        ])
        .unwrap();
    assert_eq!(applied, 2);
    assert_eq!(store.attr_value(&count, 0), 8);
    assert_eq!(store.attr_value(&label, String::new()), "plain text");
}

#[test]
fn serializes_as_value_map() {
    let (registry, store) = test_store();
    let count = registry.register::<TestScope, u32>("count").unwrap();
    store.attr(&count).unwrap().set(3);
    assert_eq!(serde_json::to_string(&store).unwrap(), r#"{"count":3}"#);
}
