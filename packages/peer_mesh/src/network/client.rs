//! Client role: a single upstream link to the host.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{Endpoint, Shared, Transmit};
use crate::config::MeshConfig;
use crate::envelope::{self, Envelope, Membership};
use crate::error::{ConnectError, SendError, TransportError};
use crate::identity::{Metadata, NetworkStatus, PeerId};
use crate::lock;
use crate::transport::{Dialer, LinkEvent, LinkSender};

type Upstream = Arc<Mutex<Option<LinkSender>>>;

struct Direct {
    upstream: Upstream,
}

impl Transmit for Direct {
    fn transmit(&self, envelope: Envelope) -> Result<(), SendError> {
        match lock(&self.upstream).as_ref() {
            Some(sender) if sender.send(envelope) => Ok(()),
            _ => Err(SendError::NotConnected),
        }
    }
}

struct Session {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Client<M: Metadata> {
    endpoint: Endpoint<M>,
    dialer: Arc<dyn Dialer<M>>,
    host: String,
    upstream: Upstream,
    session: Mutex<Option<Session>>,
}

impl<M: Metadata> Client<M> {
    pub fn new(
        id: PeerId,
        dialer: Arc<dyn Dialer<M>>,
        host: impl Into<String>,
        config: MeshConfig,
    ) -> Self {
        let shared = Arc::new(Shared::new(id, config));
        let upstream: Upstream = Arc::new(Mutex::new(None));
        let outbox = Arc::new(Direct {
            upstream: upstream.clone(),
        });
        Self {
            endpoint: Endpoint::new(shared, outbox),
            dialer,
            host: host.into(),
            upstream,
            session: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &Endpoint<M> {
        &self.endpoint
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Open the upstream link and wait for the host to admit us.
    ///
    /// A link the host closes before admitting resolves to
    /// [`ConnectError::Rejected`]; no admission within the connect timeout
    /// resolves to [`ConnectError::Timeout`]. Either way the status ends in
    /// `Disconnected`.
    pub async fn connect(&self, metadata: M) -> Result<(), ConnectError> {
        metadata.validate()?;
        let shared = self.endpoint.shared().clone();
        if shared.status() != NetworkStatus::Disconnected {
            return Err(ConnectError::AlreadyConnected);
        }

        shared.set_metadata(metadata);
        shared.set_status(NetworkStatus::Connecting);
        info!(peer = %shared.id, host = %self.host, "connecting to host");

        let mut link = match self
            .dialer
            .dial(&self.host, &shared.local_identity())
            .await
        {
            Ok(link) => link,
            Err(e) => {
                warn!(host = %self.host, "connection failed: {}", e);
                shared.set_status(NetworkStatus::Disconnected);
                return Err(e.into());
            }
        };

        // The link opening only means the transport is up. The host confirms
        // admission with the unicast `join` that carries the full roster.
        let admitted = tokio::time::timeout(shared.config.connect_timeout(), async {
            let mut early = Vec::new();
            loop {
                match link.events.recv().await {
                    Some(LinkEvent::Opened) => trace!(host = %self.host, "link open, awaiting admission"),
                    Some(LinkEvent::Data(msg)) if msg.channel == envelope::JOIN => {
                        return Ok((msg, early));
                    }
                    Some(LinkEvent::Data(msg)) => early.push(msg),
                    Some(LinkEvent::Error(e)) => {
                        return Err(ConnectError::Transport(TransportError::Handshake(e)));
                    }
                    Some(LinkEvent::Closed) | None => return Err(ConnectError::Rejected),
                }
            }
        })
        .await
        .unwrap_or(Err(ConnectError::Timeout));

        let (welcome, early) = match admitted {
            Ok(admitted) => admitted,
            Err(e) => {
                warn!(host = %self.host, "connection not admitted: {}", e);
                link.sender.close();
                shared.set_status(NetworkStatus::Disconnected);
                return Err(e);
            }
        };

        *lock(&self.upstream) = Some(link.sender);
        shared.set_status(NetworkStatus::Connected);
        info!(peer = %shared.id, host = %self.host, "connected to host");

        receive(&shared, welcome);
        for msg in early {
            receive(&shared, msg);
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(session_loop(
            shared.clone(),
            self.upstream.clone(),
            link.events,
            cancel.clone(),
        ));
        *lock(&self.session) = Some(Session { cancel, handle });
        Ok(())
    }

    /// Close the upstream link. The session ends in `Disconnected`.
    pub async fn disconnect(&self) {
        let session = lock(&self.session).take();
        if let Some(session) = session {
            session.cancel.cancel();
            if let Err(e) = session.handle.await {
                debug!("client session ended abnormally: {}", e);
            }
        }
    }
}

async fn session_loop<M: Metadata>(
    shared: Arc<Shared<M>>,
    upstream: Upstream,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(peer = %shared.id, "client session cancelled");
                break;
            }
            event = events.recv() => match event {
                Some(LinkEvent::Data(msg)) => receive(&shared, msg),
                Some(LinkEvent::Opened) => {}
                Some(LinkEvent::Error(e)) => {
                    warn!(peer = %shared.id, "upstream link failed: {}", e);
                    break;
                }
                Some(LinkEvent::Closed) | None => {
                    info!(peer = %shared.id, "upstream link closed");
                    break;
                }
            }
        }
    }

    if let Some(sender) = lock(&upstream).take() {
        sender.close();
    }
    shared.set_roster(Vec::new());
    shared.publish_peers();
    shared.set_status(NetworkStatus::Disconnected);
}

fn receive<M: Metadata>(shared: &Shared<M>, msg: Envelope) {
    let Envelope {
        channel,
        data,
        peer,
    } = msg;

    match channel.as_str() {
        envelope::JOIN | envelope::LEAVE => {
            let membership: Membership<M> = match serde_json::from_value(data) {
                Ok(m) => m,
                Err(e) => {
                    debug!(%channel, "dropping malformed membership payload: {}", e);
                    return;
                }
            };
            info!(
                peer = %membership.peer.uuid,
                peers = membership.peers.len(),
                "membership {}",
                channel
            );
            shared.set_roster(membership.peers.clone());
            let origin = membership.peer.clone();
            shared.publish_membership(&channel, &membership, origin);
        }
        envelope::PEERS => {
            trace!("ignoring peers list from the wire");
        }
        _ => {
            let origin = shared.resolve(&peer);
            shared.bus.dispatch(&channel, data, origin);
        }
    }
}
