//! Host role: accept inbound links and relay every envelope among them.
//!
//! The relay runs as one task selecting over the acceptor, the merged event
//! stream of every link, and a cancel token. All connection-set mutations
//! happen in that task; broadcasts from the application side only read a
//! snapshot of it.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{Endpoint, Shared, Transmit};
use crate::config::MeshConfig;
use crate::envelope::{self, Envelope, Membership};
use crate::error::{ConnectError, SendError};
use crate::identity::{Metadata, NetworkStatus, PeerId, PeerIdentity};
use crate::lock;
use crate::transport::{Acceptor, Incoming, LinkEvent, LinkSender};

type Admission<M> = Arc<dyn Fn(&PeerIdentity<M>) -> bool + Send + Sync>;

/// Serial number of one accepted link, unique per host.
type ConnKey = u64;

struct Connection<M> {
    key: ConnKey,
    identity: PeerIdentity<M>,
    sender: LinkSender,
}

/// Links waiting for `Opened`, and the open set in join order.
struct Connections<M> {
    pending: Vec<Connection<M>>,
    open: Vec<Connection<M>>,
}

impl<M> Default for Connections<M> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            open: Vec::new(),
        }
    }
}

impl<M: Metadata> Connections<M> {
    fn claims(&self, uuid: &PeerId) -> bool {
        self.pending
            .iter()
            .chain(self.open.iter())
            .any(|c| &c.identity.uuid == uuid)
    }

    fn open_identities(&self) -> Vec<PeerIdentity<M>> {
        self.open.iter().map(|c| c.identity.clone()).collect()
    }

    /// Senders of every open connection except `exclude`.
    fn targets(&self, exclude: Option<ConnKey>) -> Vec<LinkSender> {
        self.open
            .iter()
            .filter(|c| Some(c.key) != exclude)
            .map(|c| c.sender.clone())
            .collect()
    }
}

struct Broadcast<M> {
    connections: Arc<Mutex<Connections<M>>>,
}

impl<M: Metadata> Transmit for Broadcast<M> {
    fn transmit(&self, envelope: Envelope) -> Result<(), SendError> {
        let targets = lock(&self.connections).targets(None);
        for target in targets {
            target.send(envelope.clone());
        }
        Ok(())
    }
}

struct RelayTask<M> {
    cancel: CancellationToken,
    handle: JoinHandle<Box<dyn Acceptor<M>>>,
}

pub struct Host<M: Metadata> {
    endpoint: Endpoint<M>,
    connections: Arc<Mutex<Connections<M>>>,
    acceptor: Mutex<Option<Box<dyn Acceptor<M>>>>,
    admission: Option<Admission<M>>,
    relay: Mutex<Option<RelayTask<M>>>,
}

impl<M: Metadata> Host<M> {
    pub fn new(id: PeerId, acceptor: Box<dyn Acceptor<M>>, config: MeshConfig) -> Self {
        let shared = Arc::new(Shared::new(id, config));
        let connections = Arc::new(Mutex::new(Connections::default()));
        let outbox = Arc::new(Broadcast {
            connections: connections.clone(),
        });
        Self {
            endpoint: Endpoint::new(shared, outbox),
            connections,
            acceptor: Mutex::new(Some(acceptor)),
            admission: None,
            relay: Mutex::new(None),
        }
    }

    /// Reject candidate connections for which `predicate` returns false.
    pub fn with_admission<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&PeerIdentity<M>) -> bool + Send + Sync + 'static,
    {
        self.admission = Some(Arc::new(predicate));
        self
    }

    pub fn endpoint(&self) -> &Endpoint<M> {
        &self.endpoint
    }

    /// Start accepting connections.
    pub async fn connect(&self, metadata: M) -> Result<(), ConnectError> {
        metadata.validate()?;
        let shared = self.endpoint.shared().clone();
        if shared.status() != NetworkStatus::Disconnected {
            return Err(ConnectError::AlreadyConnected);
        }
        let acceptor = lock(&self.acceptor)
            .take()
            .ok_or(ConnectError::NoAcceptor)?;

        shared.set_metadata(metadata);
        shared.set_status(NetworkStatus::Connecting);
        shared.set_roster(vec![shared.local_identity()]);

        let cancel = CancellationToken::new();
        let relay = Relay {
            shared: shared.clone(),
            connections: self.connections.clone(),
            admission: self.admission.clone(),
        };
        let handle = tokio::spawn(relay.run(acceptor, cancel.clone()));
        *lock(&self.relay) = Some(RelayTask { cancel, handle });

        info!(peer = %shared.id, "host accepting connections");
        shared.set_status(NetworkStatus::Connected);
        shared.publish_peers();
        Ok(())
    }

    /// Stop accepting, close every connection and clear the roster.
    pub async fn disconnect(&self) {
        let task = lock(&self.relay).take();
        let Some(task) = task else {
            return;
        };
        task.cancel.cancel();
        match task.handle.await {
            Ok(acceptor) => *lock(&self.acceptor) = Some(acceptor),
            Err(e) => debug!("relay task ended abnormally: {}", e),
        }

        let closed = std::mem::take(&mut *lock(&self.connections));
        for conn in closed.pending.iter().chain(closed.open.iter()) {
            conn.sender.close();
        }

        let shared = self.endpoint.shared();
        shared.set_roster(Vec::new());
        shared.publish_peers();
        shared.set_status(NetworkStatus::Disconnected);
        info!(peer = %shared.id, connections = closed.open.len(), "host disconnected");
    }
}

/// State owned by the relay task.
struct Relay<M: Metadata> {
    shared: Arc<Shared<M>>,
    connections: Arc<Mutex<Connections<M>>>,
    admission: Option<Admission<M>>,
}

impl<M: Metadata> Relay<M> {
    async fn run(
        self,
        mut acceptor: Box<dyn Acceptor<M>>,
        cancel: CancellationToken,
    ) -> Box<dyn Acceptor<M>> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<(ConnKey, LinkEvent)>();
        let mut next_key: ConnKey = 0;
        let mut accepting = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                incoming = acceptor.accept(), if accepting => match incoming {
                    Some(incoming) => {
                        next_key += 1;
                        self.admit(next_key, incoming, &events_tx, &cancel);
                    }
                    None => {
                        info!("acceptor closed, no longer accepting connections");
                        accepting = false;
                    }
                },
                Some((key, event)) = events_rx.recv() => self.handle(key, event),
            }
        }
        acceptor
    }

    fn admit(
        &self,
        key: ConnKey,
        incoming: Incoming<M>,
        events: &mpsc::UnboundedSender<(ConnKey, LinkEvent)>,
        cancel: &CancellationToken,
    ) {
        let Incoming { identity, link } = incoming;

        let duplicate = identity.uuid == self.shared.id
            || lock(&self.connections).claims(&identity.uuid);
        if duplicate {
            info!(peer = %identity.uuid, "rejecting connection: uuid already connected");
            link.sender.close();
            return;
        }
        if self.admission.as_ref().is_some_and(|admit| !admit(&identity)) {
            info!(peer = %identity.uuid, "rejecting connection: refused by admission predicate");
            link.sender.close();
            return;
        }

        debug!(peer = %identity.uuid, key, "connection accepted, waiting for open");
        lock(&self.connections).pending.push(Connection {
            key,
            identity,
            sender: link.sender,
        });

        let events = events.clone();
        let cancel = cancel.child_token();
        let mut link_events = link.events;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = link_events.recv() => {
                        let event = event.unwrap_or(LinkEvent::Closed);
                        let terminal = event.is_terminal();
                        if events.send((key, event)).is_err() || terminal {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn handle(&self, key: ConnKey, event: LinkEvent) {
        match event {
            LinkEvent::Opened => self.opened(key),
            LinkEvent::Data(msg) => self.relay(key, msg),
            LinkEvent::Closed => self.closed(key, None),
            LinkEvent::Error(e) => self.closed(key, Some(e)),
        }
    }

    fn opened(&self, key: ConnKey) {
        let (newcomer, peers, sender) = {
            let mut conns = lock(&self.connections);
            let Some(pos) = conns.pending.iter().position(|c| c.key == key) else {
                return;
            };
            let conn = conns.pending.remove(pos);
            let newcomer = conn.identity.clone();
            let sender = conn.sender.clone();
            conns.open.push(conn);
            (newcomer, self.peer_list(&conns), sender)
        };
        self.shared.set_roster(peers.clone());
        info!(peer = %newcomer.uuid, peers = peers.len(), "peer joined");

        let membership = Membership {
            peer: newcomer.clone(),
            peers,
        };
        match serde_json::to_value(&membership) {
            Ok(data) => {
                sender.send(Envelope::new(envelope::JOIN, data, self.shared.id.clone()));
            }
            Err(e) => debug!("failed to encode join: {}", e),
        }
        self.shared
            .publish_membership(envelope::JOIN, &membership, newcomer);
    }

    fn relay(&self, key: ConnKey, msg: Envelope) {
        let (origin, targets) = {
            let conns = lock(&self.connections);
            let Some(conn) = conns.open.iter().find(|c| c.key == key) else {
                return;
            };
            (conn.identity.clone(), conns.targets(Some(key)))
        };

        if envelope::is_reserved(&msg.channel) {
            debug!(peer = %origin.uuid, channel = %msg.channel, "dropping reserved channel from peer");
            return;
        }

        let msg = msg.restamped(origin.uuid.clone());
        trace!(
            peer = %origin.uuid,
            channel = %msg.channel,
            targets = targets.len(),
            "relaying envelope"
        );
        for target in &targets {
            target.send(msg.clone());
        }

        let Envelope { channel, data, .. } = msg;
        self.shared.bus.dispatch(&channel, data, origin);
    }

    fn closed(&self, key: ConnKey, error: Option<String>) {
        let (departed, peers, targets) = {
            let mut conns = lock(&self.connections);
            if let Some(pos) = conns.pending.iter().position(|c| c.key == key) {
                let conn = conns.pending.remove(pos);
                debug!(peer = %conn.identity.uuid, "connection closed before opening");
                return;
            }
            let Some(pos) = conns.open.iter().position(|c| c.key == key) else {
                return;
            };
            let conn = conns.open.remove(pos);
            (conn.identity, self.peer_list(&conns), conns.targets(None))
        };
        self.shared.set_roster(peers.clone());
        match error {
            Some(e) => info!(peer = %departed.uuid, error = %e, "peer connection failed"),
            None => info!(peer = %departed.uuid, "peer left"),
        }

        let membership = Membership {
            peer: departed.clone(),
            peers,
        };
        let data: Value = match serde_json::to_value(&membership) {
            Ok(data) => data,
            Err(e) => {
                debug!("failed to encode leave: {}", e);
                return;
            }
        };
        let leave = Envelope::new(envelope::LEAVE, data, self.shared.id.clone());
        for target in &targets {
            target.send(leave.clone());
        }
        self.shared
            .publish_membership(envelope::LEAVE, &membership, departed);
    }

    /// Self first, then open connections in join order.
    fn peer_list(&self, conns: &Connections<M>) -> Vec<PeerIdentity<M>> {
        let mut peers = vec![self.shared.local_identity()];
        peers.extend(conns.open_identities());
        peers
    }
}
