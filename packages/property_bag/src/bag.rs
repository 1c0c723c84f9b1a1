use std::any::Any;
use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::trace;

use crate::definition::{PropertyDefinition, PropertyValue};
use crate::error::BagError;
use crate::observer::{Listeners, Subscription};

/// Serialized form of a bag: property name to wire value.
pub type Snapshot = Map<String, Value>;

/// Bag-level notification fired after any committed property change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    pub key: String,
}

/// Type-erased view of a registered property.
trait Slot: Send + Sync {
    fn export(&self) -> Result<Value, serde_json::Error>;
    fn import(&mut self, raw: Value) -> Option<bool>;
    fn reset(&mut self) -> bool;
    fn type_name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: PropertyValue> Slot for PropertyDefinition<T> {
    fn export(&self) -> Result<Value, serde_json::Error> {
        self.encode()
    }

    fn import(&mut self, raw: Value) -> Option<bool> {
        let value = self.decode(raw)?;
        Some(self.commit(value))
    }

    fn reset(&mut self) -> bool {
        let default = self.default.clone();
        self.commit(default)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Observable key/value store of typed properties.
#[derive(Default)]
pub struct PropertyBag {
    slots: BTreeMap<String, Box<dyn Slot>>,
    changes: Listeners<PropertyChange>,
}

impl std::fmt::Debug for PropertyBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyBag")
            .field("keys", &self.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a property. Registering the same key twice is a setup error.
    pub fn add_property<T: PropertyValue>(
        &mut self,
        key: impl Into<String>,
        definition: PropertyDefinition<T>,
    ) -> Result<(), BagError> {
        let key = key.into();
        if self.slots.contains_key(&key) {
            return Err(BagError::DuplicateProperty(key));
        }
        self.slots.insert(key, Box::new(definition));
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn definition<T: PropertyValue>(&self, key: &str) -> Result<&PropertyDefinition<T>, BagError> {
        let slot = self
            .slots
            .get(key)
            .ok_or_else(|| BagError::UnknownProperty(key.to_string()))?;
        slot.as_any()
            .downcast_ref::<PropertyDefinition<T>>()
            .ok_or_else(|| BagError::TypeMismatch {
                key: key.to_string(),
                expected: std::any::type_name::<T>(),
                actual: slot.type_name(),
            })
    }

    fn definition_mut<T: PropertyValue>(
        &mut self,
        key: &str,
    ) -> Result<&mut PropertyDefinition<T>, BagError> {
        let slot = self
            .slots
            .get_mut(key)
            .ok_or_else(|| BagError::UnknownProperty(key.to_string()))?;
        let actual = slot.type_name();
        slot.as_any_mut()
            .downcast_mut::<PropertyDefinition<T>>()
            .ok_or_else(|| BagError::TypeMismatch {
                key: key.to_string(),
                expected: std::any::type_name::<T>(),
                actual,
            })
    }

    /// Current value of a property.
    pub fn get<T: PropertyValue>(&self, key: &str) -> Result<T, BagError> {
        Ok(self.definition::<T>(key)?.current())
    }

    /// Write a property through its commit path. Returns whether it changed.
    pub fn set<T: PropertyValue>(&mut self, key: &str, value: T) -> Result<bool, BagError> {
        let changed = self.definition_mut::<T>(key)?.commit(value);
        if changed {
            self.notify(key);
        }
        Ok(changed)
    }

    /// Read-modify-write helper, e.g. `bag.update("health", |h: f64| h - 25.0)`.
    pub fn update<T, F>(&mut self, key: &str, f: F) -> Result<bool, BagError>
    where
        T: PropertyValue,
        F: FnOnce(T) -> T,
    {
        let current = self.get::<T>(key)?;
        self.set(key, f(current))
    }

    /// Write a property's default back through the commit path.
    pub fn reset(&mut self, key: &str) -> Result<bool, BagError> {
        let slot = self
            .slots
            .get_mut(key)
            .ok_or_else(|| BagError::UnknownProperty(key.to_string()))?;
        let changed = slot.reset();
        if changed {
            self.notify(key);
        }
        Ok(changed)
    }

    /// Full snapshot of every registered property.
    pub fn export(&self) -> Result<Snapshot, BagError> {
        let mut snapshot = Snapshot::new();
        for (key, slot) in &self.slots {
            let value = slot.export().map_err(|e| BagError::Serialize {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            snapshot.insert(key.clone(), value);
        }
        Ok(snapshot)
    }

    /// Sparse merge of a (possibly partial) snapshot.
    ///
    /// Only keys that are both present and registered are touched. Values that
    /// fail to decode are dropped. Returns the keys whose value changed.
    pub fn import(&mut self, partial: &Snapshot) -> Vec<String> {
        let mut changed = Vec::new();
        for (key, raw) in partial {
            let Some(slot) = self.slots.get_mut(key) else {
                trace!(key = %key, "ignoring unknown property in snapshot");
                continue;
            };
            match slot.import(raw.clone()) {
                Some(true) => {
                    self.notify(key);
                    changed.push(key.clone());
                }
                Some(false) => {}
                None => trace!(key = %key, "dropping undecodable property value"),
            }
        }
        changed
    }

    /// Listen for any committed change on this bag.
    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&PropertyChange) + Send + Sync + 'static,
    {
        self.changes.subscribe(listener)
    }

    fn notify(&self, key: &str) {
        self.changes.emit(&PropertyChange {
            key: key.to_string(),
        });
    }
}
