//! Discrete game events.
//!
//! Unlike snapshots these are edge-triggered: sent once and applied the
//! moment they arrive. Each kind has its own channel.

use peer_mesh::{Endpoint, Metadata, PeerId, PeerIdentity, SendError, Subscription};
use property_bag::Listeners;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const SHOOT: &str = "tank:shoot";
pub const HONK: &str = "tank:honk";
pub const HIT: &str = "tank:hit";
pub const EXPLOSION: &str = "explosion:create";
pub const SYNC_TIME: &str = "sync:time";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shoot {
    pub position: [f64; 3],
    pub direction: [f64; 3],
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Honk {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub target: PeerId,
    pub damage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explosion {
    pub position: [f64; 3],
}

/// Authoritative time of day, in hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSync {
    pub time_of_day: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    Shoot(Shoot),
    Honk,
    Hit(Hit),
    Explosion(Explosion),
    TimeSync(TimeSync),
}

#[derive(Debug, Clone)]
pub struct Received<M> {
    pub event: GameEvent,
    pub origin: PeerIdentity<M>,
}

/// Typed send/receive over every game-event channel.
pub struct GameEvents<M: Metadata> {
    endpoint: Endpoint<M>,
    listeners: Listeners<Received<M>>,
    _channels: Vec<Subscription>,
}

impl<M: Metadata> GameEvents<M> {
    pub fn new(endpoint: Endpoint<M>) -> Self {
        let listeners = Listeners::new();
        let channels = vec![
            forward::<Shoot, M>(&endpoint, SHOOT, &listeners, GameEvent::Shoot),
            forward::<Honk, M>(&endpoint, HONK, &listeners, |_| GameEvent::Honk),
            forward::<Hit, M>(&endpoint, HIT, &listeners, GameEvent::Hit),
            forward::<Explosion, M>(&endpoint, EXPLOSION, &listeners, GameEvent::Explosion),
            time_sync(&endpoint, &listeners),
        ];
        Self {
            endpoint,
            listeners,
            _channels: channels,
        }
    }

    pub fn shoot(&self, shot: &Shoot) -> Result<(), SendError> {
        self.endpoint.send(SHOOT, shot)
    }

    pub fn honk(&self) -> Result<(), SendError> {
        self.endpoint.send(HONK, &Honk::default())
    }

    pub fn hit(&self, target: PeerId, damage: f64) -> Result<(), SendError> {
        self.endpoint.send(HIT, &Hit { target, damage })
    }

    pub fn explosion(&self, position: [f64; 3]) -> Result<(), SendError> {
        self.endpoint.send(EXPLOSION, &Explosion { position })
    }

    /// Only the host's clock is authoritative; clients never send this.
    pub fn sync_time(&self, time_of_day: f64) -> Result<(), SendError> {
        if self.endpoint.host_id().as_ref() != Some(self.endpoint.local_id()) {
            debug!("not the host, time sync suppressed");
            return Ok(());
        }
        self.endpoint.send(SYNC_TIME, &TimeSync { time_of_day })
    }

    pub fn on_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Received<M>) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }
}

fn forward<T, M>(
    endpoint: &Endpoint<M>,
    channel: &str,
    listeners: &Listeners<Received<M>>,
    wrap: fn(T) -> GameEvent,
) -> Subscription
where
    T: serde::de::DeserializeOwned + 'static,
    M: Metadata,
{
    let listeners = listeners.clone();
    endpoint.channel::<T>(channel).on(move |payload, origin| {
        listeners.emit(&Received {
            event: wrap(payload),
            origin: origin.clone(),
        });
    })
}

fn time_sync<M: Metadata>(endpoint: &Endpoint<M>, listeners: &Listeners<Received<M>>) -> Subscription {
    let listeners = listeners.clone();
    let roster = endpoint.clone();
    endpoint
        .channel::<TimeSync>(SYNC_TIME)
        .on(move |sync, origin| {
            if roster.host_id().as_ref() != Some(&origin.uuid) {
                debug!(peer = %origin.uuid, "ignoring time sync from non-host");
                return;
            }
            listeners.emit(&Received {
                event: GameEvent::TimeSync(sync),
                origin: origin.clone(),
            });
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Profile;
    use peer_mesh::transport::memory::MemoryTransport;
    use peer_mesh::{Client, Host, MeshConfig, Network};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    async fn session() -> (Network<Profile>, Network<Profile>, Network<Profile>) {
        let transport = MemoryTransport::<Profile>::new();
        let host = Network::Host(Host::new(
            PeerId::from("host"),
            Box::new(transport.listen("host")),
            MeshConfig::default(),
        ));
        host.connect(Profile::new("host", "tank")).await.unwrap();

        let mut clients = Vec::new();
        for id in ["a", "b"] {
            let net = Network::Client(Client::new(
                PeerId::from(id),
                Arc::new(transport.clone()),
                "host",
                MeshConfig::default(),
            ));
            net.connect(Profile::new(id, "tank")).await.unwrap();
            clients.push(net);
        }
        timeout(TEST_TIMEOUT, async {
            while host.connected_peers().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let b = clients.pop().unwrap();
        let a = clients.pop().unwrap();
        (host, a, b)
    }

    fn record(events: &GameEvents<Profile>) -> (Subscription, mpsc::UnboundedReceiver<(GameEvent, PeerId)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = events.on_event(move |r| {
            let _ = tx.send((r.event.clone(), r.origin.uuid.clone()));
        });
        (sub, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<(GameEvent, PeerId)>) -> (GameEvent, PeerId) {
        timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn payload_shapes() {
        let hit = Hit {
            target: PeerId::from("x"),
            damage: 25.0,
        };
        assert_eq!(
            serde_json::to_value(&hit).unwrap(),
            json!({"target": "x", "damage": 25.0})
        );
        assert_eq!(serde_json::to_value(Honk::default()).unwrap(), json!({}));
        assert_eq!(
            serde_json::to_value(TimeSync { time_of_day: 12.5 }).unwrap(),
            json!({"timeOfDay": 12.5})
        );
    }

    #[tokio::test]
    async fn events_reach_other_players_with_origin() {
        let (host, a, b) = session().await;
        let a_events = GameEvents::new(a.endpoint().clone());
        let b_events = GameEvents::new(b.endpoint().clone());
        let host_events = GameEvents::new(host.endpoint().clone());
        let (_sb, mut b_rx) = record(&b_events);
        let (_sh, mut host_rx) = record(&host_events);

        a_events.honk().unwrap();
        assert_eq!(next(&mut b_rx).await, (GameEvent::Honk, PeerId::from("a")));
        assert_eq!(next(&mut host_rx).await, (GameEvent::Honk, PeerId::from("a")));

        a_events.hit(PeerId::from("b"), 40.0).unwrap();
        let (event, origin) = next(&mut b_rx).await;
        assert_eq!(origin, PeerId::from("a"));
        assert_eq!(
            event,
            GameEvent::Hit(Hit {
                target: PeerId::from("b"),
                damage: 40.0
            })
        );
    }

    #[tokio::test]
    async fn time_sync_only_from_host() {
        let (host, a, b) = session().await;
        let host_events = GameEvents::new(host.endpoint().clone());
        let a_events = GameEvents::new(a.endpoint().clone());
        let b_events = GameEvents::new(b.endpoint().clone());
        let (_sb, mut b_rx) = record(&b_events);

        // A client forging a sync on the raw channel is ignored.
        a.send(SYNC_TIME, &TimeSync { time_of_day: 3.0 }).unwrap();
        a_events.sync_time(4.0).unwrap();
        host_events.sync_time(18.0).unwrap();

        let (event, origin) = next(&mut b_rx).await;
        assert_eq!(origin, PeerId::from("host"));
        assert_eq!(event, GameEvent::TimeSync(TimeSync { time_of_day: 18.0 }));
    }
}
