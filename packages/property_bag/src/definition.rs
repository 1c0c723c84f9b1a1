use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Bound for anything a property can hold.
pub trait PropertyValue:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> PropertyValue for T where
    T: Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

type Getter<T> = Box<dyn Fn() -> T + Send + Sync>;
type Setter<T> = Box<dyn Fn(T) + Send + Sync>;
type Sanitizer<T> = Box<dyn Fn(T) -> T + Send + Sync>;
type Exporter<T> = Box<dyn Fn(&T) -> Value + Send + Sync>;
type Importer<T> = Box<dyn Fn(Value) -> Option<T> + Send + Sync>;
type ChangeHook<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

/// Where a property's current value lives.
pub enum Backing<T> {
    /// The bag owns the value.
    Stored(T),
    /// The value is owned elsewhere (e.g. a physics body); the bag reads and
    /// writes it through these accessors.
    Delegated { get: Getter<T>, set: Setter<T> },
}

impl<T> fmt::Debug for Backing<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backing::Stored(value) => f.debug_tuple("Stored").field(value).finish(),
            Backing::Delegated { .. } => f.write_str("Delegated"),
        }
    }
}

/// How a single property is stored, transformed, serialized and observed.
///
/// Built with `stored` or `delegated`, then refined with the builder methods:
///
/// ```
/// use property_bag::PropertyDefinition;
///
/// let health = PropertyDefinition::stored(100_i32)
///     .sanitize(|v| v.clamp(0, 100))
///     .on_change(|new, old| println!("health {old} -> {new}"));
/// # let _ = health;
/// ```
pub struct PropertyDefinition<T> {
    pub(crate) default: T,
    pub(crate) backing: Backing<T>,
    pub(crate) sanitize: Option<Sanitizer<T>>,
    pub(crate) export: Option<Exporter<T>>,
    pub(crate) import: Option<Importer<T>>,
    pub(crate) on_change: Option<ChangeHook<T>>,
}

impl<T: PropertyValue> PropertyDefinition<T> {
    /// A property whose value is kept inside the bag, starting at `default`.
    pub fn stored(default: T) -> Self {
        Self::with_backing(default.clone(), Backing::Stored(default))
    }

    /// A property that proxies externally owned state. `default` is only used
    /// by `PropertyBag::reset`.
    pub fn delegated<G, S>(default: T, get: G, set: S) -> Self
    where
        G: Fn() -> T + Send + Sync + 'static,
        S: Fn(T) + Send + Sync + 'static,
    {
        Self::with_backing(
            default,
            Backing::Delegated {
                get: Box::new(get),
                set: Box::new(set),
            },
        )
    }

    fn with_backing(default: T, backing: Backing<T>) -> Self {
        Self {
            default,
            backing,
            sanitize: None,
            export: None,
            import: None,
            on_change: None,
        }
    }

    /// Transform applied to every incoming value before comparison (clamping,
    /// normalization).
    pub fn sanitize<F>(mut self, f: F) -> Self
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        self.sanitize = Some(Box::new(f));
        self
    }

    /// Custom wire representation used by `PropertyBag::export`.
    pub fn export_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) -> Value + Send + Sync + 'static,
    {
        self.export = Some(Box::new(f));
        self
    }

    /// Custom decoding used by `PropertyBag::import`. Returning `None` drops
    /// the incoming value.
    pub fn import_with<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Option<T> + Send + Sync + 'static,
    {
        self.import = Some(Box::new(f));
        self
    }

    /// Hook invoked with `(new, old)` after every committed change.
    pub fn on_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        self.on_change = Some(Box::new(f));
        self
    }

    pub fn default_value(&self) -> &T {
        &self.default
    }

    pub fn backing(&self) -> &Backing<T> {
        &self.backing
    }

    /// Read the current value.
    pub(crate) fn current(&self) -> T {
        match &self.backing {
            Backing::Stored(value) => value.clone(),
            Backing::Delegated { get, .. } => get(),
        }
    }

    /// The single commit path. Returns whether the value changed.
    pub(crate) fn commit(&mut self, value: T) -> bool {
        let value = match &self.sanitize {
            Some(sanitize) => sanitize(value),
            None => value,
        };
        let old = self.current();
        if value == old {
            return false;
        }

        match &mut self.backing {
            Backing::Stored(slot) => *slot = value.clone(),
            Backing::Delegated { set, .. } => set(value.clone()),
        }

        if let Some(hook) = &self.on_change {
            hook(&value, &old);
        }
        true
    }

    pub(crate) fn encode(&self) -> Result<Value, serde_json::Error> {
        let current = self.current();
        match &self.export {
            Some(export) => Ok(export(&current)),
            None => serde_json::to_value(current),
        }
    }

    pub(crate) fn decode(&self, raw: Value) -> Option<T> {
        match &self.import {
            Some(import) => import(raw),
            None => serde_json::from_value(raw).ok(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PropertyDefinition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDefinition")
            .field("default", &self.default)
            .field("backing", &self.backing)
            .field("sanitize", &self.sanitize.is_some())
            .field("export", &self.export.is_some())
            .field("import", &self.import.is_some())
            .field("on_change", &self.on_change.is_some())
            .finish()
    }
}
