//! End-to-end relay tests: one host and several clients over the in-memory
//! transport, plus a loopback TCP session.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::envelope::{self, Envelope, Membership};
use crate::transport::memory::MemoryTransport;
use crate::transport::tcp::{TcpAcceptor, TcpDialer};
use crate::transport::{Dialer, LinkEvent};
use crate::{
    Chat, Client, ConfigError, ConnectError, Host, MeshConfig, Metadata, Network, NetworkStatus,
    PeerId, PeerIdentity, SendError, Subscription, TransportError,
};

/// Timeout for each async operation in tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait before asserting that nothing else arrived.
const QUIET: Duration = Duration::from_millis(50);

type Meta = Value;

fn meta(pseudo: &str) -> Meta {
    json!({ "pseudo": pseudo })
}

async fn start_host(transport: &MemoryTransport<Meta>, name: &str) -> Network<Meta> {
    let host = Network::Host(Host::new(
        PeerId::from(name),
        Box::new(transport.listen(name)),
        MeshConfig::default(),
    ));
    host.connect(meta(name)).await.expect("host failed to start");
    host
}

fn client(transport: &MemoryTransport<Meta>, host: &str, id: &str) -> Network<Meta> {
    Network::Client(Client::new(
        PeerId::from(id),
        Arc::new(transport.clone()),
        host,
        MeshConfig::default(),
    ))
}

async fn join(transport: &MemoryTransport<Meta>, host: &str, id: &str) -> Network<Meta> {
    let net = client(transport, host, id);
    net.connect(meta(id)).await.expect("client failed to connect");
    net
}

/// Poll `cond` until it holds or the test timeout expires.
async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    timeout(TEST_TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Wait until the host's roster has `n` entries (itself included).
async fn wait_for_peers(host: &Network<Meta>, n: usize) {
    wait_until(&format!("{n} peers"), || host.connected_peers().len() == n).await;
}

/// Collect `(payload, origin uuid)` pairs delivered on `channel`.
fn collect(net: &Network<Meta>, channel: &str) -> (Subscription, mpsc::UnboundedReceiver<(Value, PeerId)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = net.endpoint().on(channel, move |data, from| {
        let _ = tx.send((data.clone(), from.uuid.clone()));
    });
    (sub, rx)
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed")
}

async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    tokio::time::sleep(QUIET).await;
    if let Ok(extra) = rx.try_recv() {
        panic!("unexpected extra delivery: {extra:?}");
    }
}

fn memberships(
    net: &Network<Meta>,
    channel: &str,
) -> (Subscription, mpsc::UnboundedReceiver<Membership<Meta>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = net
        .channel::<Membership<Meta>>(channel)
        .on(move |m, _| {
            let _ = tx.send(m);
        });
    (sub, rx)
}

/// Record every status transition of `net`.
fn statuses(net: &Network<Meta>) -> (Subscription, mpsc::UnboundedReceiver<NetworkStatus>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = net.on_status(move |s| {
        let _ = tx.send(s);
    });
    (sub, rx)
}

fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

// =========================================================================
// Relay
// =========================================================================

#[tokio::test]
async fn relay_fans_out_to_everyone_but_the_sender() {
    let transport = MemoryTransport::new();
    let host = start_host(&transport, "host").await;
    let a = join(&transport, "host", "a").await;
    let b = join(&transport, "host", "b").await;
    let c = join(&transport, "host", "c").await;
    wait_for_peers(&host, 4).await;

    let (_ha, mut at_host) = collect(&host, "shout");
    let (_sa, mut at_a) = collect(&a, "shout");
    let (_sb, mut at_b) = collect(&b, "shout");
    let (_sc, mut at_c) = collect(&c, "shout");

    a.send("shout", &json!({"n": 1})).unwrap();

    for rx in [&mut at_host, &mut at_b, &mut at_c] {
        let (data, origin) = next(rx).await;
        assert_eq!(data, json!({"n": 1}));
        assert_eq!(origin, PeerId::from("a"));
        assert_quiet(rx).await;
    }
    assert_quiet(&mut at_a).await;
}

#[tokio::test]
async fn host_messages_reach_every_client() {
    let transport = MemoryTransport::new();
    let host = start_host(&transport, "host").await;
    let a = join(&transport, "host", "a").await;
    let b = join(&transport, "host", "b").await;
    wait_for_peers(&host, 3).await;

    let (_sa, mut at_a) = collect(&a, "sync:time");
    let (_sb, mut at_b) = collect(&b, "sync:time");
    host.send("sync:time", &json!(0.25)).unwrap();

    for rx in [&mut at_a, &mut at_b] {
        let (data, origin) = next(rx).await;
        assert_eq!(data, json!(0.25));
        assert_eq!(origin, PeerId::from("host"));
    }
}

#[tokio::test]
async fn relay_restamps_origin_and_drops_reserved_channels() {
    let transport = MemoryTransport::new();
    let host = start_host(&transport, "host").await;
    let b = join(&transport, "host", "b").await;

    // A raw link lets us put a forged origin on the wire.
    let raw_identity = PeerIdentity::new(PeerId::from("raw"), meta("raw"));
    let mut raw = transport.dial("host", &raw_identity).await.unwrap();
    assert_eq!(raw.events.recv().await, Some(LinkEvent::Opened));
    wait_for_peers(&host, 3).await;

    let (_sb, mut at_b) = collect(&b, "tank:honk");
    let (_sl, mut leaves_at_b) = collect(&b, envelope::LEAVE);

    raw.sender.send(Envelope::new(
        envelope::LEAVE,
        json!({"peer": {"uuid": "host", "metadata": null}, "peers": []}),
        PeerId::from("host"),
    ));
    raw.sender
        .send(Envelope::new("tank:honk", json!(null), PeerId::from("liar")));

    let (_, origin) = next(&mut at_b).await;
    assert_eq!(origin, PeerId::from("raw"));
    assert_quiet(&mut leaves_at_b).await;
}

// =========================================================================
// Membership
// =========================================================================

#[tokio::test]
async fn joiner_receives_one_complete_roster() {
    let transport = MemoryTransport::new();
    let host = start_host(&transport, "host").await;
    let _a = join(&transport, "host", "a").await;
    let _b = join(&transport, "host", "b").await;
    wait_for_peers(&host, 3).await;

    let newcomer = client(&transport, "host", "c");
    let (_sj, mut joins) = memberships(&newcomer, envelope::JOIN);
    newcomer.connect(meta("c")).await.unwrap();

    let m = next(&mut joins).await;
    assert_eq!(m.peer.uuid, PeerId::from("c"));
    assert_eq!(m.peers.len(), 4);
    let distinct: HashSet<_> = m.peers.iter().map(|p| p.uuid.clone()).collect();
    assert_eq!(distinct.len(), 4);
    assert!(distinct.contains(&PeerId::from("c")));
    assert_quiet(&mut joins).await;

    wait_until("roster on newcomer", || newcomer.connected_peers().len() == 4).await;
    assert_eq!(
        newcomer
            .connected_peers()
            .iter()
            .find(|p| p.uuid == PeerId::from("a"))
            .map(|p| p.metadata["pseudo"].clone()),
        Some(json!("a"))
    );
}

#[tokio::test]
async fn host_notifies_join_and_peers_locally() {
    let transport = MemoryTransport::new();
    let host = start_host(&transport, "host").await;

    let (_sj, mut joins) = memberships(&host, envelope::JOIN);
    let (tx, mut peers) = mpsc::unbounded_channel();
    let _sp = host.endpoint().on_peers(move |list| {
        let _ = tx.send(list.len());
    });

    let _a = join(&transport, "host", "a").await;

    let m = next(&mut joins).await;
    assert_eq!(m.peer.uuid, PeerId::from("a"));
    assert_eq!(m.peers.len(), 2);
    assert_eq!(next(&mut peers).await, 2);
}

#[tokio::test]
async fn leave_is_seen_once_by_every_remaining_peer() {
    let transport = MemoryTransport::new();
    let host = start_host(&transport, "host").await;
    let a = join(&transport, "host", "a").await;
    let b = join(&transport, "host", "b").await;
    let c = join(&transport, "host", "c").await;
    wait_for_peers(&host, 4).await;

    let (_sh, mut at_host) = memberships(&host, envelope::LEAVE);
    let (_sa, mut at_a) = memberships(&a, envelope::LEAVE);
    let (_sc, mut at_c) = memberships(&c, envelope::LEAVE);

    b.disconnect().await;
    assert_eq!(b.status(), NetworkStatus::Disconnected);
    assert!(b.connected_peers().is_empty());

    for rx in [&mut at_host, &mut at_a, &mut at_c] {
        let m = next(rx).await;
        assert_eq!(m.peer.uuid, PeerId::from("b"));
        assert_eq!(m.peers.len(), 3);
        assert!(m.peers.iter().all(|p| p.uuid != PeerId::from("b")));
        assert_quiet(rx).await;
    }

    // The host keeps serving the others.
    let (_s, mut got) = collect(&c, "ping");
    a.send("ping", &1).unwrap();
    assert_eq!(next(&mut got).await.1, PeerId::from("a"));
}

#[tokio::test]
async fn host_shutdown_disconnects_clients() {
    let transport = MemoryTransport::new();
    let host = start_host(&transport, "host").await;
    let a = join(&transport, "host", "a").await;
    wait_for_peers(&host, 2).await;

    host.disconnect().await;
    assert_eq!(host.status(), NetworkStatus::Disconnected);
    assert!(host.connected_peers().is_empty());

    wait_until("client teardown", || a.status() == NetworkStatus::Disconnected).await;
    assert!(a.connected_peers().is_empty());
    assert_eq!(a.send("ping", &1), Err(SendError::NotConnected));

    // The host can serve again with the same acceptor.
    host.connect(meta("host")).await.unwrap();
    a.connect(meta("a")).await.unwrap();
    wait_for_peers(&host, 2).await;
}

// =========================================================================
// Admission & failures
// =========================================================================

#[tokio::test]
async fn admission_predicate_rejects_candidates() {
    let transport = MemoryTransport::new();
    let host = Network::Host(
        Host::new(
            PeerId::from("host"),
            Box::new(transport.listen("host")),
            MeshConfig::default(),
        )
        .with_admission(|candidate: &PeerIdentity<Meta>| candidate.metadata["pseudo"] != "mallory"),
    );
    host.connect(meta("host")).await.unwrap();

    let mallory = client(&transport, "host", "m");
    let (_s, mut seen) = statuses(&mallory);
    let result = timeout(TEST_TIMEOUT, mallory.connect(meta("mallory")))
        .await
        .expect("connect hung");
    assert!(matches!(result, Err(ConnectError::Rejected)), "got {result:?}");
    assert_eq!(mallory.status(), NetworkStatus::Disconnected);
    assert_eq!(
        drain(&mut seen),
        vec![NetworkStatus::Connecting, NetworkStatus::Disconnected]
    );

    let _ok = join(&transport, "host", "alice").await;
    wait_for_peers(&host, 2).await;
    assert!(
        host.connected_peers()
            .iter()
            .all(|p| p.uuid != PeerId::from("m"))
    );
}

#[tokio::test]
async fn duplicate_uuid_is_rejected() {
    let transport = MemoryTransport::new();
    let host = start_host(&transport, "host").await;
    let _first = join(&transport, "host", "same").await;
    wait_for_peers(&host, 2).await;

    let second = client(&transport, "host", "same");
    let (_s, mut seen) = statuses(&second);
    let result = timeout(TEST_TIMEOUT, second.connect(meta("imposter")))
        .await
        .expect("connect hung");
    assert!(matches!(result, Err(ConnectError::Rejected)), "got {result:?}");
    assert_eq!(
        drain(&mut seen),
        vec![NetworkStatus::Connecting, NetworkStatus::Disconnected]
    );

    let peers = host.connected_peers();
    assert_eq!(peers.len(), 2);
    assert_eq!(peers[1].metadata["pseudo"], "same");
}

#[tokio::test]
async fn stopped_host_times_out_connect() {
    let transport = MemoryTransport::new();
    let host = start_host(&transport, "host").await;
    host.disconnect().await;

    let late = Network::Client(Client::new(
        PeerId::from("late"),
        Arc::new(transport.clone()),
        "host",
        MeshConfig {
            connect_timeout_ms: 100,
            ..MeshConfig::default()
        },
    ));
    let (_s, mut seen) = statuses(&late);
    let result = timeout(TEST_TIMEOUT, late.connect(meta("late")))
        .await
        .expect("connect hung");
    assert!(matches!(result, Err(ConnectError::Timeout)), "got {result:?}");
    assert_eq!(late.status(), NetworkStatus::Disconnected);
    assert_eq!(
        drain(&mut seen),
        vec![NetworkStatus::Connecting, NetworkStatus::Disconnected]
    );
}

#[tokio::test]
async fn admitted_client_knows_the_roster_when_connect_returns() {
    let transport = MemoryTransport::new();
    let host = start_host(&transport, "host").await;
    let _a = join(&transport, "host", "a").await;

    let b = client(&transport, "host", "b");
    let (_s, mut seen) = statuses(&b);
    b.connect(meta("b")).await.unwrap();

    assert_eq!(b.status(), NetworkStatus::Connected);
    let uuids: Vec<PeerId> = b.connected_peers().into_iter().map(|p| p.uuid).collect();
    assert_eq!(uuids, vec![PeerId::from("host"), PeerId::from("a"), PeerId::from("b")]);
    assert_eq!(b.endpoint().host_id(), Some(PeerId::from("host")));
    assert_eq!(
        drain(&mut seen),
        vec![NetworkStatus::Connecting, NetworkStatus::Connected]
    );
    wait_for_peers(&host, 3).await;
}

#[tokio::test]
async fn unreachable_host_fails_connect() {
    let transport = MemoryTransport::new();
    let lonely = client(&transport, "nowhere", "a");

    let err = lonely.connect(meta("a")).await.unwrap_err();
    assert!(matches!(
        err,
        ConnectError::Transport(TransportError::Unreachable(_))
    ));
    assert_eq!(lonely.status(), NetworkStatus::Disconnected);
}

#[tokio::test]
async fn connect_twice_is_refused() {
    let transport = MemoryTransport::new();
    let host = start_host(&transport, "host").await;
    assert!(matches!(
        host.connect(meta("host")).await,
        Err(ConnectError::AlreadyConnected)
    ));
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Profile {
    pseudo: String,
}

impl Metadata for Profile {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.pseudo.is_empty() {
            return Err(ConfigError::MissingMetadata("pseudo".into()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn missing_metadata_fails_before_any_network_activity() {
    let transport = MemoryTransport::<Profile>::new();
    let _acceptor = transport.listen("host");
    let net = Network::Client(Client::new(
        PeerId::random(),
        Arc::new(transport.clone()),
        "host",
        MeshConfig::default(),
    ));

    let (tx, mut statuses) = mpsc::unbounded_channel();
    let _s = net.on_status(move |s| {
        let _ = tx.send(s);
    });

    let err = net.connect(Profile::default()).await.unwrap_err();
    assert!(matches!(
        err,
        ConnectError::Config(ConfigError::MissingMetadata(ref f)) if f == "pseudo"
    ));
    assert!(statuses.try_recv().is_err(), "status must not change");
}

// =========================================================================
// Chat
// =========================================================================

#[tokio::test(start_paused = true)]
async fn chat_rate_limit_drops_the_second_send() {
    let transport = MemoryTransport::new();
    let host = start_host(&transport, "host").await;
    let a = join(&transport, "host", "a").await;
    wait_for_peers(&host, 2).await;

    let host_chat = Chat::new(host.endpoint().clone());
    let a_chat = Chat::new(a.endpoint().clone());

    assert!(a_chat.send("hello"));
    tokio::time::advance(Duration::from_millis(300)).await;
    assert!(!a_chat.send("again"));
    assert_eq!(a_chat.history().len(), 1);

    wait_until("chat at host", || host_chat.history().len() == 1).await;
    let line = &host_chat.history()[0];
    assert_eq!(line.message, "hello");
    assert_eq!(line.author.uuid, PeerId::from("a"));

    tokio::time::advance(Duration::from_millis(400)).await;
    assert!(a_chat.send("later"));
    wait_until("second chat at host", || host_chat.history().len() == 2).await;
}

#[tokio::test]
async fn chat_truncates_and_skips_empty() {
    let transport = MemoryTransport::new();
    let host = start_host(&transport, "host").await;
    let a = join(&transport, "host", "a").await;
    wait_for_peers(&host, 2).await;

    let host_chat = Chat::new(host.endpoint().clone());
    let a_chat = Chat::new(a.endpoint().clone());

    assert!(!a_chat.send("   "));
    assert!(a_chat.send(&"x".repeat(250)));

    wait_until("chat at host", || host_chat.history().len() == 1).await;
    assert_eq!(host_chat.history()[0].message.chars().count(), 100);
}

// =========================================================================
// TCP
// =========================================================================

#[tokio::test]
async fn tcp_session_relays_between_clients() {
    let config = MeshConfig::default();
    let acceptor = TcpAcceptor::<Meta>::bind("127.0.0.1:0", config.max_frame_bytes)
        .await
        .unwrap();
    let addr = acceptor.local_addr().to_string();

    let host = Network::Host(Host::new(
        PeerId::from("host"),
        Box::new(acceptor),
        config.clone(),
    ));
    host.connect(meta("host")).await.unwrap();

    let dialer: Arc<dyn Dialer<Meta>> = Arc::new(TcpDialer::new(
        config.max_frame_bytes,
        config.connect_timeout(),
    ));
    let a = Network::Client(Client::new(
        PeerId::random(),
        dialer.clone(),
        addr.clone(),
        config.clone(),
    ));
    let b = Network::Client(Client::new(PeerId::random(), dialer, addr, config));

    let (_sj, mut joins) = memberships(&b, envelope::JOIN);
    a.connect(meta("a")).await.unwrap();
    wait_for_peers(&host, 2).await;
    b.connect(meta("b")).await.unwrap();
    assert_eq!(next(&mut joins).await.peers.len(), 3);

    let (_sb, mut at_b) = collect(&b, "tank:shoot");
    a.send("tank:shoot", &json!({"power": 3})).unwrap();
    let (data, origin) = next(&mut at_b).await;
    assert_eq!(data, json!({"power": 3}));
    assert_eq!(&origin, a.local_id());

    let (_sl, mut leaves) = memberships(&b, envelope::LEAVE);
    a.disconnect().await;
    assert_eq!(&next(&mut leaves).await.peer.uuid, a.local_id());
}
