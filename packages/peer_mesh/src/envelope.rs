//! Wire envelope and reserved channel names.
//!
//! Every message between two participants is one `Envelope`:
//! `{ "channel": "...", "data": <any>, "peer": "<origin uuid>" }`.
//! The host overwrites `peer` with the sending connection's identity before
//! relaying, so clients never get to choose their own origin.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::{Metadata, PeerId, PeerIdentity};

/// Host → newly joined peer, carrying the full roster.
pub const JOIN: &str = "join";
/// Host → remaining peers when a connection goes away.
pub const LEAVE: &str = "leave";
/// Local-only roster notification; never serialized.
pub const PEERS: &str = "peers";
/// Periodic full entity snapshots.
pub const UPDATE: &str = "update";
pub const CHAT: &str = "chat";

/// Channels owned by the network layer. Applications cannot send on them and
/// the host never relays them on a client's behalf.
pub fn is_reserved(channel: &str) -> bool {
    matches!(channel, JOIN | LEAVE | PEERS)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub data: Value,
    pub peer: PeerId,
}

impl Envelope {
    pub fn new(channel: impl Into<String>, data: Value, peer: PeerId) -> Self {
        Self {
            channel: channel.into(),
            data,
            peer,
        }
    }

    /// Same envelope with the origin replaced.
    pub fn restamped(self, peer: PeerId) -> Self {
        Self { peer, ..self }
    }
}

/// Payload of `join` and `leave`: the peer concerned plus the roster after
/// the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "M: Metadata")]
pub struct Membership<M> {
    pub peer: PeerIdentity<M>,
    pub peers: Vec<PeerIdentity<M>>,
}
