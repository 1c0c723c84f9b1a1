//! TCP transport: one stream per link, length-prefixed JSON frames.
//!
//! A dialing client opens the stream and sends a [`Handshake`] carrying its
//! identity. The acceptor validates the handshake before handing the link to
//! the host, so half-open or foreign connections never reach the relay.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::framing::{Handshake, PROTOCOL, read_frame, write_frame};
use super::{Acceptor, Dialer, Incoming, Link, LinkEvent, LinkSender, Outbound};
use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::identity::{Metadata, PeerIdentity};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Listening socket plus a background accept loop.
pub struct TcpAcceptor<M> {
    local_addr: SocketAddr,
    rx: mpsc::UnboundedReceiver<Incoming<M>>,
    _shutdown: DropGuard,
}

impl<M: Metadata> TcpAcceptor<M> {
    pub async fn bind(addr: &str, max_frame: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        info!(addr = %local_addr, "tcp acceptor listening");
        tokio::spawn(accept_loop(listener, tx, cancel.clone(), max_frame));

        Ok(Self {
            local_addr,
            rx,
            _shutdown: cancel.drop_guard(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl<M: Metadata> Acceptor<M> for TcpAcceptor<M> {
    fn accept(&mut self) -> BoxFuture<'_, Option<Incoming<M>>> {
        Box::pin(self.rx.recv())
    }
}

async fn accept_loop<M: Metadata>(
    listener: TcpListener,
    tx: mpsc::UnboundedSender<Incoming<M>>,
    cancel: CancellationToken,
    max_frame: usize,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("tcp acceptor shut down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let tx = tx.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(stream, max_frame)).await {
                            Ok(Ok((identity, stream))) => {
                                debug!(%remote, peer = %identity.uuid, "tcp handshake complete");
                                let link = spawn_link(stream, max_frame, cancel.child_token());
                                let _ = tx.send(Incoming { identity, link });
                            }
                            Ok(Err(e)) => warn!(%remote, "tcp handshake failed: {}", e),
                            Err(_) => warn!(%remote, "tcp handshake timed out"),
                        }
                    });
                }
                Err(e) => warn!("tcp accept error: {}", e),
            }
        }
    }
}

async fn handshake<M: Metadata>(
    mut stream: TcpStream,
    max_frame: usize,
) -> Result<(PeerIdentity<M>, TcpStream), TransportError> {
    let bytes = read_frame(&mut stream, max_frame)
        .await?
        .ok_or(TransportError::Closed)?;
    let hello: Handshake<M> = serde_json::from_slice(&bytes)?;
    if hello.protocol != PROTOCOL {
        return Err(TransportError::Handshake(format!(
            "unsupported protocol {}",
            hello.protocol
        )));
    }
    Ok((hello.peer, stream))
}

/// Client-side connector for [`TcpAcceptor`] hosts.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    max_frame: usize,
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(max_frame: usize, connect_timeout: Duration) -> Self {
        Self {
            max_frame,
            connect_timeout,
        }
    }
}

impl<M: Metadata> Dialer<M> for TcpDialer {
    fn dial<'a>(
        &'a self,
        host: &'a str,
        local: &'a PeerIdentity<M>,
    ) -> BoxFuture<'a, Result<Link, TransportError>> {
        Box::pin(async move {
            let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(host))
                .await
                .map_err(|_| TransportError::Unreachable(format!("{host}: connect timed out")))?
                .map_err(|e| TransportError::Unreachable(format!("{host}: {e}")))?;
            stream.set_nodelay(true)?;

            write_frame(&mut stream, &Handshake::new(local.clone()), self.max_frame).await?;
            debug!(host, peer = %local.uuid, "tcp link dialed");
            Ok(spawn_link(stream, self.max_frame, CancellationToken::new()))
        })
    }
}

/// Wrap an established stream in a `Link` with one reader and one writer task.
/// The reader owns the terminal event; the writer cancels it on close.
fn spawn_link(stream: TcpStream, max_frame: usize, cancel: CancellationToken) -> Link {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    let _ = ev_tx.send(LinkEvent::Opened);

    tokio::spawn(writer(write_half, out_rx, max_frame, cancel.clone()));
    tokio::spawn(reader(read_half, ev_tx, max_frame, cancel));

    Link {
        sender: LinkSender::new(out_tx),
        events: ev_rx,
    }
}

async fn writer(
    mut stream: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    max_frame: usize,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = outbound.recv() => match msg {
                Some(Outbound::Envelope(envelope)) => {
                    match write_frame(&mut stream, &envelope, max_frame).await {
                        Ok(()) => {}
                        Err(TransportError::FrameTooLarge { size, max }) => {
                            warn!(channel = %envelope.channel, size, max, "dropping oversized envelope");
                        }
                        Err(e) => {
                            warn!("tcp write error: {}", e);
                            break;
                        }
                    }
                }
                Some(Outbound::Close) | None => break,
            }
        }
    }
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut stream).await;
    cancel.cancel();
}

async fn reader(
    mut stream: OwnedReadHalf,
    events: mpsc::UnboundedSender<LinkEvent>,
    max_frame: usize,
    cancel: CancellationToken,
) {
    let terminal = loop {
        tokio::select! {
            _ = cancel.cancelled() => break LinkEvent::Closed,
            frame = read_frame(&mut stream, max_frame) => match frame {
                Ok(Some(bytes)) => match serde_json::from_slice::<Envelope>(&bytes) {
                    Ok(envelope) => {
                        let _ = events.send(LinkEvent::Data(envelope));
                    }
                    Err(e) => debug!("dropping malformed envelope: {}", e),
                },
                Ok(None) => break LinkEvent::Closed,
                Err(e) => break LinkEvent::Error(e.to_string()),
            }
        }
    };
    cancel.cancel();
    let _ = events.send(terminal);
}
