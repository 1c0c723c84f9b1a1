use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Network and replication tunables.
///
/// Every field has a default so a partial `[mesh]` table (or none at all)
/// deserializes cleanly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Cadence of outbound snapshots and pending-snapshot commits.
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
    /// A proxy with no snapshot for this long (plus one step) is evicted.
    #[serde(default = "default_staleness_timeout_ms")]
    pub staleness_timeout_ms: u64,
    /// Minimum spacing between two local chat sends.
    #[serde(default = "default_chat_rate_limit_ms")]
    pub chat_rate_limit_ms: u64,
    /// Outgoing chat messages are truncated to this many characters.
    #[serde(default = "default_chat_max_len")]
    pub chat_max_len: usize,
    /// Chat lines kept in local history.
    #[serde(default = "default_chat_history")]
    pub chat_history: usize,
    /// Frames larger than this are rejected by the TCP transport.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: default_snapshot_interval_ms(),
            staleness_timeout_ms: default_staleness_timeout_ms(),
            chat_rate_limit_ms: default_chat_rate_limit_ms(),
            chat_max_len: default_chat_max_len(),
            chat_history: default_chat_history(),
            max_frame_bytes: default_max_frame_bytes(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl MeshConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn staleness_timeout(&self) -> Duration {
        Duration::from_millis(self.staleness_timeout_ms)
    }

    pub fn chat_rate_limit(&self) -> Duration {
        Duration::from_millis(self.chat_rate_limit_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_snapshot_interval_ms() -> u64 {
    100
}
fn default_staleness_timeout_ms() -> u64 {
    5000
}
fn default_chat_rate_limit_ms() -> u64 {
    600
}
fn default_chat_max_len() -> usize {
    100
}
fn default_chat_history() -> usize {
    200
}
fn default_max_frame_bytes() -> usize {
    1024 * 1024
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
