//! Transport abstraction.
//!
//! A `Link` is one bidirectional, ordered, reliable pipe between a client and
//! the host. Each side gets a `LinkSender` for outbound envelopes and a
//! receiver of `LinkEvent`s. Every link produces `Opened` first and exactly
//! one terminal event (`Closed` or `Error`) last.
//!
//! The host side obtains links from an [`Acceptor`], the client side from a
//! [`Dialer`]. Both traits return boxed futures so network objects can hold
//! them as trait objects.

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::identity::PeerIdentity;

pub mod framing;
pub mod memory;
pub mod tcp;

/// Events observed on one side of a link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Opened,
    Data(Envelope),
    Closed,
    Error(String),
}

impl LinkEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkEvent::Closed | LinkEvent::Error(_))
    }
}

#[derive(Debug)]
pub(crate) enum Outbound {
    Envelope(Envelope),
    Close,
}

/// Outbound half of a link. Cheap to clone; all clones feed the same pipe.
#[derive(Debug, Clone)]
pub struct LinkSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl LinkSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    /// Queue an envelope. Returns false once the link is gone.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.tx.send(Outbound::Envelope(envelope)).is_ok()
    }

    /// Ask the transport to close the link. Both sides then observe `Closed`.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One open pipe, as seen from one side.
#[derive(Debug)]
pub struct Link {
    pub sender: LinkSender,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// A connection offered to the host, tagged with the identity the remote
/// side announced when opening it.
#[derive(Debug)]
pub struct Incoming<M> {
    pub identity: PeerIdentity<M>,
    pub link: Link,
}

/// Host-side source of incoming connections.
pub trait Acceptor<M>: Send {
    /// Next incoming connection, or `None` once the acceptor is shut down.
    fn accept(&mut self) -> BoxFuture<'_, Option<Incoming<M>>>;
}

/// Client-side connector.
pub trait Dialer<M>: Send + Sync {
    /// Open a link to `host`, announcing `local` as the connecting identity.
    fn dial<'a>(
        &'a self,
        host: &'a str,
        local: &'a PeerIdentity<M>,
    ) -> BoxFuture<'a, Result<Link, TransportError>>;
}
