//! Property Bag - typed, observable entity state
//!
//! A `PropertyBag` maps property names to typed definitions. Every write,
//! whether it comes from local input or from a remote snapshot, goes through a
//! single commit path: sanitize, compare, store (internally or through an
//! external setter), then notify the property's change hook and the bag-level
//! listeners.
//!
//! # Example
//!
//! ```
//! use property_bag::{PropertyBag, PropertyDefinition};
//!
//! let mut bag = PropertyBag::new();
//! bag.add_property(
//!     "health",
//!     PropertyDefinition::stored(100.0_f64).sanitize(|v: f64| v.clamp(0.0, 100.0)),
//! )
//! .unwrap();
//!
//! bag.set("health", -30.0_f64).unwrap();
//! assert_eq!(bag.get::<f64>("health").unwrap(), 0.0);
//!
//! let snapshot = bag.export().unwrap();
//! assert_eq!(snapshot["health"], 0.0);
//! ```

mod bag;
mod definition;
mod error;
pub mod observer;

pub use bag::{PropertyBag, PropertyChange, Snapshot};
pub use definition::{Backing, PropertyDefinition, PropertyValue};
pub use error::BagError;
pub use observer::{Listeners, Subscription};
