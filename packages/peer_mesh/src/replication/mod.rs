//! Snapshot replication.
//!
//! Every participant periodically sends a full export of its own entity on
//! the `update` channel. Receivers keep one proxy per remote uuid, created on
//! the first snapshot, refreshed by later ones, and evicted once snapshots
//! stop arriving. There is no delta encoding and no acknowledgement: the
//! next full snapshot repairs whatever a dropped one would have carried.

use std::time::Duration;

use property_bag::{BagError, Snapshot};

mod manager;
mod service;

pub use manager::{EventBatch, Proxy, ReplicationEvent, ReplicationManager};
pub use service::{ReplicationHandle, spawn_replication};

/// The simulation-side collaborator, local or proxied.
pub trait ReplicatedEntity: Send + 'static {
    fn export(&self) -> Result<Snapshot, BagError>;

    /// Apply a (possibly partial) snapshot. Unknown keys are ignored.
    fn import(&mut self, snapshot: &Snapshot);

    fn advance(&mut self, dt: Duration);

    /// Called once, right before the entity is dropped by eviction.
    fn destroy(&mut self) {}
}
