use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

/// Opaque participant identifier, unique for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier (UUID v4).
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Application-defined record exchanged when a connection opens (display
/// name, chosen vehicle, ...).
///
/// `validate` runs in `connect()` before any network activity.
pub trait Metadata:
    Clone + fmt::Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

impl Metadata for serde_json::Value {}

impl Metadata for () {}

/// A participant: identifier plus its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "M: Metadata")]
pub struct PeerIdentity<M> {
    pub uuid: PeerId,
    pub metadata: M,
}

impl<M: Metadata> PeerIdentity<M> {
    pub fn new(uuid: PeerId, metadata: M) -> Self {
        Self { uuid, metadata }
    }

    /// Identity for a uuid the local roster has never seen.
    pub fn unknown(uuid: PeerId) -> Self {
        Self {
            uuid,
            metadata: M::default(),
        }
    }
}

/// Connection status of a network object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkStatus::Disconnected => "disconnected",
            NetworkStatus::Connecting => "connecting",
            NetworkStatus::Connected => "connected",
        };
        f.write_str(s)
    }
}
