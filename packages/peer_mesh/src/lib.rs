//! Peer Mesh - relay, channels and replication for small real-time sessions
//!
//! One participant hosts; everyone else holds a single link to the host, which
//! re-stamps and fans out every envelope so the session behaves like a full
//! mesh over a star topology.
//!
//! - `transport` - links, acceptors and dialers (in-memory and TCP)
//! - `envelope` - wire envelope and reserved channel names
//! - `bus` - per-network channel registry and dispatch
//! - `network` - `Host`, `Client` and the `Network` sum type
//! - `chat` - rate-limited chat over the `chat` channel
//! - `replication` - periodic snapshots and remote proxies with staleness eviction
//!
//! # Example
//!
//! ```no_run
//! use peer_mesh::transport::memory::MemoryTransport;
//! use peer_mesh::{Client, Host, MeshConfig, Network, PeerId};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = MemoryTransport::<serde_json::Value>::new();
//!     let config = MeshConfig::default();
//!
//!     let host = Network::Host(Host::new(
//!         PeerId::from("host"),
//!         Box::new(transport.listen("host")),
//!         config.clone(),
//!     ));
//!     host.connect(serde_json::json!({"pseudo": "alice"})).await.unwrap();
//!
//!     let client = Network::Client(Client::new(
//!         PeerId::random(),
//!         Arc::new(transport.clone()),
//!         "host",
//!         config,
//!     ));
//!     client.connect(serde_json::json!({"pseudo": "bob"})).await.unwrap();
//!
//!     let _sub = host.channel::<String>("chat").on(|text, from| {
//!         println!("{} says {}", from.uuid, text);
//!     });
//!     client.send("chat", &"hello").unwrap();
//! }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod bus;
pub mod chat;
mod config;
pub mod envelope;
mod error;
mod identity;
pub mod network;
pub mod replication;
pub mod transport;

#[cfg(test)]
mod e2e_tests;

pub use bus::{ChannelBus, Delivery};
pub use chat::{Chat, ChatLine, ChatMessage};
pub use config::MeshConfig;
pub use envelope::{Envelope, Membership};
pub use error::{ConfigError, ConnectError, SendError, TransportError};
pub use identity::{Metadata, NetworkStatus, PeerId, PeerIdentity};
pub use network::{Channel, Client, Endpoint, Host, Network};
pub use property_bag::{Snapshot, Subscription};
pub use replication::{
    EventBatch, ReplicatedEntity, ReplicationEvent, ReplicationHandle, ReplicationManager,
    spawn_replication,
};

/// Lock a std mutex, recovering the guard if a panicking holder poisoned it.
/// Every critical section in this crate leaves its state consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
