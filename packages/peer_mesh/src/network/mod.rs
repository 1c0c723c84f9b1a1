//! Network roles.
//!
//! `Host` and `Client` implement one contract (`connect`, `disconnect`,
//! `send`, `channel`, `connected_peers`, ...) through a shared [`Endpoint`];
//! [`Network`] is the sum type callers hold when the role is chosen at
//! runtime. Relay state (connection set, admission predicate) stays private
//! to `Host`.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use property_bag::{Listeners, Subscription};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use crate::bus::ChannelBus;
use crate::config::MeshConfig;
use crate::envelope::{self, Envelope, Membership};
use crate::error::{ConnectError, SendError};
use crate::identity::{Metadata, NetworkStatus, PeerId, PeerIdentity};
use crate::lock;

mod client;
mod host;

pub use client::Client;
pub use host::Host;

/// State shared between a role's public handle and its background task.
pub(crate) struct Shared<M> {
    pub(crate) id: PeerId,
    pub(crate) config: MeshConfig,
    pub(crate) bus: ChannelBus<M>,
    metadata: Mutex<M>,
    status: Mutex<NetworkStatus>,
    status_listeners: Listeners<NetworkStatus>,
    roster: Mutex<Vec<PeerIdentity<M>>>,
}

impl<M: Metadata> Shared<M> {
    pub(crate) fn new(id: PeerId, config: MeshConfig) -> Self {
        Self {
            id,
            config,
            bus: ChannelBus::new(),
            metadata: Mutex::new(M::default()),
            status: Mutex::new(NetworkStatus::Disconnected),
            status_listeners: Listeners::new(),
            roster: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn local_identity(&self) -> PeerIdentity<M> {
        PeerIdentity::new(self.id.clone(), lock(&self.metadata).clone())
    }

    pub(crate) fn set_metadata(&self, metadata: M) {
        *lock(&self.metadata) = metadata;
    }

    /// Full identity for an origin uuid. Unknown uuids get default metadata.
    pub(crate) fn resolve(&self, uuid: &PeerId) -> PeerIdentity<M> {
        if let Some(peer) = lock(&self.roster).iter().find(|p| &p.uuid == uuid) {
            return peer.clone();
        }
        if uuid == &self.id {
            return self.local_identity();
        }
        PeerIdentity::unknown(uuid.clone())
    }

    pub(crate) fn status(&self) -> NetworkStatus {
        *lock(&self.status)
    }

    pub(crate) fn set_status(&self, status: NetworkStatus) {
        {
            let mut current = lock(&self.status);
            if *current == status {
                return;
            }
            *current = status;
        }
        info!(peer = %self.id, %status, "network status changed");
        self.status_listeners.emit(&status);
    }

    pub(crate) fn roster(&self) -> Vec<PeerIdentity<M>> {
        lock(&self.roster).clone()
    }

    pub(crate) fn set_roster(&self, peers: Vec<PeerIdentity<M>>) {
        *lock(&self.roster) = peers;
    }

    /// Dispatch a `join`/`leave` locally, followed by the `peers` notification
    /// derived from the current roster.
    pub(crate) fn publish_membership(
        &self,
        channel: &str,
        membership: &Membership<M>,
        origin: PeerIdentity<M>,
    ) {
        match serde_json::to_value(membership) {
            Ok(data) => {
                self.bus.dispatch(channel, data, origin);
            }
            Err(e) => debug!(channel, "failed to encode membership: {}", e),
        }
        self.publish_peers();
    }

    pub(crate) fn publish_peers(&self) {
        let peers = self.roster();
        if let Ok(data) = serde_json::to_value(&peers) {
            self.bus
                .dispatch(envelope::PEERS, data, self.local_identity());
        }
    }
}

/// Outbound path of a role: broadcast for the host, upstream for a client.
pub(crate) trait Transmit: Send + Sync {
    fn transmit(&self, envelope: Envelope) -> Result<(), SendError>;
}

/// Role-independent handle: sending, channels, roster and status.
pub struct Endpoint<M> {
    shared: Arc<Shared<M>>,
    outbox: Arc<dyn Transmit>,
}

impl<M> Clone for Endpoint<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            outbox: Arc::clone(&self.outbox),
        }
    }
}

impl<M: Metadata> Endpoint<M> {
    pub(crate) fn new(shared: Arc<Shared<M>>, outbox: Arc<dyn Transmit>) -> Self {
        Self { shared, outbox }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<M>> {
        &self.shared
    }

    /// Send `data` on `channel` to every other participant.
    pub fn send<T: Serialize + ?Sized>(&self, channel: &str, data: &T) -> Result<(), SendError> {
        if envelope::is_reserved(channel) {
            return Err(SendError::Reserved(channel.to_string()));
        }
        if self.shared.status() != NetworkStatus::Connected {
            return Err(SendError::NotConnected);
        }
        let data = serde_json::to_value(data).map_err(|e| SendError::Serialize(e.to_string()))?;
        self.outbox
            .transmit(Envelope::new(channel, data, self.shared.id.clone()))
    }

    pub fn channel<T>(&self, name: &str) -> Channel<T, M> {
        Channel {
            endpoint: self.clone(),
            name: name.to_string(),
            _payload: PhantomData,
        }
    }

    /// Raw listener on `channel`, invoked with the undecoded payload.
    pub fn on<F>(&self, channel: &str, callback: F) -> Subscription
    where
        F: Fn(&Value, &PeerIdentity<M>) + Send + Sync + 'static,
    {
        self.shared.bus.on(channel, callback)
    }

    /// Every participant this side currently knows of, itself included.
    pub fn connected_peers(&self) -> Vec<PeerIdentity<M>> {
        self.shared.roster()
    }

    /// The host's uuid. Rosters are ordered host first, on both roles.
    pub fn host_id(&self) -> Option<PeerId> {
        lock(&self.shared.roster).first().map(|p| p.uuid.clone())
    }

    pub fn metadata(&self) -> M {
        lock(&self.shared.metadata).clone()
    }

    pub fn local_id(&self) -> &PeerId {
        &self.shared.id
    }

    pub fn local_identity(&self) -> PeerIdentity<M> {
        self.shared.local_identity()
    }

    pub fn config(&self) -> &MeshConfig {
        &self.shared.config
    }

    pub fn status(&self) -> NetworkStatus {
        self.shared.status()
    }

    pub fn on_status<F>(&self, callback: F) -> Subscription
    where
        F: Fn(NetworkStatus) + Send + Sync + 'static,
    {
        self.shared
            .status_listeners
            .subscribe(move |status: &NetworkStatus| callback(*status))
    }

    pub fn on_join<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Membership<M>) + Send + Sync + 'static,
    {
        self.channel::<Membership<M>>(envelope::JOIN)
            .on(move |membership, _| callback(membership))
    }

    pub fn on_leave<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Membership<M>) + Send + Sync + 'static,
    {
        self.channel::<Membership<M>>(envelope::LEAVE)
            .on(move |membership, _| callback(membership))
    }

    pub fn on_peers<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Vec<PeerIdentity<M>>) + Send + Sync + 'static,
    {
        self.channel::<Vec<PeerIdentity<M>>>(envelope::PEERS)
            .on(move |peers, _| callback(peers))
    }
}

/// Typed view over one named channel.
pub struct Channel<T, M> {
    endpoint: Endpoint<M>,
    name: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T, M: Metadata> Channel<T, M> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T: Serialize, M: Metadata> Channel<T, M> {
    pub fn send(&self, data: &T) -> Result<(), SendError> {
        self.endpoint.send(&self.name, data)
    }
}

impl<T: DeserializeOwned + 'static, M: Metadata> Channel<T, M> {
    /// Register a listener. Payloads that do not decode as `T` are dropped.
    pub fn on<F>(&self, callback: F) -> Subscription
    where
        F: Fn(T, &PeerIdentity<M>) + Send + Sync + 'static,
    {
        let name = self.name.clone();
        self.endpoint.on(&self.name, move |data, origin| {
            match serde_json::from_value::<T>(data.clone()) {
                Ok(payload) => callback(payload, origin),
                Err(e) => debug!(channel = %name, peer = %origin.uuid, "dropping malformed payload: {}", e),
            }
        })
    }
}

/// A network object whose role is chosen at runtime.
pub enum Network<M: Metadata> {
    Host(Host<M>),
    Client(Client<M>),
}

impl<M: Metadata> Network<M> {
    pub async fn connect(&self, metadata: M) -> Result<(), ConnectError> {
        match self {
            Network::Host(host) => host.connect(metadata).await,
            Network::Client(client) => client.connect(metadata).await,
        }
    }

    pub async fn disconnect(&self) {
        match self {
            Network::Host(host) => host.disconnect().await,
            Network::Client(client) => client.disconnect().await,
        }
    }

    pub fn endpoint(&self) -> &Endpoint<M> {
        match self {
            Network::Host(host) => host.endpoint(),
            Network::Client(client) => client.endpoint(),
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Network::Host(_))
    }

    pub fn send<T: Serialize + ?Sized>(&self, channel: &str, data: &T) -> Result<(), SendError> {
        self.endpoint().send(channel, data)
    }

    pub fn channel<T>(&self, name: &str) -> Channel<T, M> {
        self.endpoint().channel(name)
    }

    pub fn connected_peers(&self) -> Vec<PeerIdentity<M>> {
        self.endpoint().connected_peers()
    }

    pub fn metadata(&self) -> M {
        self.endpoint().metadata()
    }

    pub fn status(&self) -> NetworkStatus {
        self.endpoint().status()
    }

    pub fn local_id(&self) -> &PeerId {
        self.endpoint().local_id()
    }

    pub fn on_status<F>(&self, callback: F) -> Subscription
    where
        F: Fn(NetworkStatus) + Send + Sync + 'static,
    {
        self.endpoint().on_status(callback)
    }
}
