//! In-process transport.
//!
//! Hosts register under a name with [`MemoryTransport::listen`]; clients dial
//! that name. Links are pairs of unbounded channels with one pump task per
//! direction, so ordering and close semantics match the TCP transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Acceptor, Dialer, Incoming, Link, LinkEvent, LinkSender, Outbound};
use crate::error::TransportError;
use crate::identity::{Metadata, PeerIdentity};
use crate::lock;

type Registry<M> = Mutex<HashMap<String, mpsc::UnboundedSender<Incoming<M>>>>;

/// Name → acceptor registry shared by every clone.
pub struct MemoryTransport<M> {
    hosts: Arc<Registry<M>>,
}

impl<M> Clone for MemoryTransport<M> {
    fn clone(&self) -> Self {
        Self {
            hosts: Arc::clone(&self.hosts),
        }
    }
}

impl<M> Default for MemoryTransport<M> {
    fn default() -> Self {
        Self {
            hosts: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<M: Metadata> MemoryTransport<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting connections addressed to `name`. A previous acceptor
    /// under the same name stops receiving new connections.
    pub fn listen(&self, name: &str) -> MemoryAcceptor<M> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.hosts).insert(name.to_string(), tx.clone());
        MemoryAcceptor {
            name: name.to_string(),
            tx,
            rx,
            hosts: Arc::downgrade(&self.hosts),
        }
    }

    pub fn is_listening(&self, name: &str) -> bool {
        lock(&self.hosts).contains_key(name)
    }
}

impl<M: Metadata> Dialer<M> for MemoryTransport<M> {
    fn dial<'a>(
        &'a self,
        host: &'a str,
        local: &'a PeerIdentity<M>,
    ) -> BoxFuture<'a, Result<Link, TransportError>> {
        Box::pin(async move {
            let acceptor = lock(&self.hosts)
                .get(host)
                .cloned()
                .ok_or_else(|| TransportError::Unreachable(host.to_string()))?;

            let (client_side, host_side) = link_pair();
            acceptor
                .send(Incoming {
                    identity: local.clone(),
                    link: host_side,
                })
                .map_err(|_| TransportError::Unreachable(host.to_string()))?;
            debug!(host, peer = %local.uuid, "memory link dialed");
            Ok(client_side)
        })
    }
}

/// Acceptor half of a memory host. Unregisters its name on drop.
pub struct MemoryAcceptor<M> {
    name: String,
    tx: mpsc::UnboundedSender<Incoming<M>>,
    rx: mpsc::UnboundedReceiver<Incoming<M>>,
    hosts: Weak<Registry<M>>,
}

impl<M: Metadata> Acceptor<M> for MemoryAcceptor<M> {
    fn accept(&mut self) -> BoxFuture<'_, Option<Incoming<M>>> {
        Box::pin(self.rx.recv())
    }
}

impl<M> Drop for MemoryAcceptor<M> {
    fn drop(&mut self) {
        if let Some(hosts) = self.hosts.upgrade() {
            let mut hosts = lock(&hosts);
            if hosts
                .get(&self.name)
                .is_some_and(|tx| tx.same_channel(&self.tx))
            {
                hosts.remove(&self.name);
            }
        }
    }
}

/// Two connected link ends. Both start with an `Opened` event queued.
///
/// Must be called from within a tokio runtime.
pub fn link_pair() -> (Link, Link) {
    let (a_out_tx, a_out_rx) = mpsc::unbounded_channel();
    let (b_out_tx, b_out_rx) = mpsc::unbounded_channel();
    let (a_ev_tx, a_ev_rx) = mpsc::unbounded_channel();
    let (b_ev_tx, b_ev_rx) = mpsc::unbounded_channel();

    let _ = a_ev_tx.send(LinkEvent::Opened);
    let _ = b_ev_tx.send(LinkEvent::Opened);

    let cancel = CancellationToken::new();
    let terminated = Arc::new(AtomicBool::new(false));

    tokio::spawn(pump(
        a_out_rx,
        a_ev_tx.clone(),
        b_ev_tx.clone(),
        cancel.clone(),
        terminated.clone(),
    ));
    tokio::spawn(pump(b_out_rx, b_ev_tx, a_ev_tx, cancel, terminated));

    (
        Link {
            sender: LinkSender::new(a_out_tx),
            events: a_ev_rx,
        },
        Link {
            sender: LinkSender::new(b_out_tx),
            events: b_ev_rx,
        },
    )
}

/// Forward one side's outbound queue into the other side's events. The first
/// pump to see a close (explicit or every sender dropped) reports `Closed` to
/// both sides and stops its twin.
async fn pump(
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    local: mpsc::UnboundedSender<LinkEvent>,
    remote: mpsc::UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
    terminated: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = outbound.recv() => match msg {
                Some(Outbound::Envelope(envelope)) => {
                    let _ = remote.send(LinkEvent::Data(envelope));
                }
                Some(Outbound::Close) | None => {
                    if !terminated.swap(true, Ordering::SeqCst) {
                        let _ = local.send(LinkEvent::Closed);
                        let _ = remote.send(LinkEvent::Closed);
                    }
                    cancel.cancel();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::identity::PeerId;
    use serde_json::{Value, json};

    fn env(n: i64) -> Envelope {
        Envelope::new("test", json!(n), PeerId::from("x"))
    }

    #[tokio::test]
    async fn pair_delivers_in_order() {
        let (a, mut b) = link_pair();
        assert_eq!(b.events.recv().await, Some(LinkEvent::Opened));

        for n in 0..5 {
            assert!(a.sender.send(env(n)));
        }
        for n in 0..5 {
            assert_eq!(b.events.recv().await, Some(LinkEvent::Data(env(n))));
        }
    }

    #[tokio::test]
    async fn close_is_seen_once_on_both_sides() {
        let (mut a, mut b) = link_pair();
        assert_eq!(a.events.recv().await, Some(LinkEvent::Opened));
        assert_eq!(b.events.recv().await, Some(LinkEvent::Opened));

        a.sender.close();
        assert_eq!(a.events.recv().await, Some(LinkEvent::Closed));
        assert_eq!(b.events.recv().await, Some(LinkEvent::Closed));

        // The other sender going away afterwards must not repeat the event.
        drop(b.sender);
        tokio::task::yield_now().await;
        assert!(a.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_sender_closes_link() {
        let (a, mut b) = link_pair();
        assert_eq!(b.events.recv().await, Some(LinkEvent::Opened));
        drop(a);
        assert_eq!(b.events.recv().await, Some(LinkEvent::Closed));
    }

    #[tokio::test]
    async fn dial_unknown_host_is_unreachable() {
        let transport = MemoryTransport::<Value>::new();
        let me = PeerIdentity::new(PeerId::from("c"), Value::Null);
        let err = transport.dial("nowhere", &me).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(h) if h == "nowhere"));
    }

    #[tokio::test]
    async fn acceptor_receives_dialer_identity() {
        let transport = MemoryTransport::<Value>::new();
        let mut acceptor = transport.listen("h");
        let me = PeerIdentity::new(PeerId::from("c"), json!({"pseudo": "bob"}));

        let _link = transport.dial("h", &me).await.unwrap();
        let incoming = acceptor.accept().await.unwrap();
        assert_eq!(incoming.identity, me);
    }

    #[tokio::test]
    async fn dropped_acceptor_unregisters() {
        let transport = MemoryTransport::<Value>::new();
        let acceptor = transport.listen("h");
        assert!(transport.is_listening("h"));
        drop(acceptor);
        assert!(!transport.is_listening("h"));
    }
}
