//! One player's session: the network object, the local tank, its proxies,
//! chat and game events, wired together.
//!
//! Everything user-facing is pushed as text lines into an unbounded channel;
//! the binary prints them, tests read them.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use peer_mesh::{
    Chat, Network, NetworkStatus, PeerId, ReplicationEvent, ReplicationHandle,
    ReplicationManager, Subscription, spawn_replication,
};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info};

use crate::commands::{Command, HELP};
use crate::events::{EXPLOSION, Explosion, GameEvent, GameEvents, Shoot};
use crate::profile::Profile;
use crate::tank::Tank;

/// Damage dealt by one shell.
pub const SHELL_DAMAGE: f64 = 25.0;
/// Shells travel this far before they are spent.
const SHELL_RANGE: f64 = 200.0;
/// Targets within this distance of the shell's path are hit.
const HIT_RADIUS: f64 = 3.0;
const START_TIME_OF_DAY: f64 = 12.0;

pub type Console = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Session {
    network: Network<Profile>,
    tank: Arc<Mutex<Tank>>,
    chat: Chat<Profile>,
    events: Arc<GameEvents<Profile>>,
    replication: ReplicationHandle<Tank>,
    time_of_day: Arc<Mutex<f64>>,
    ended: CancellationToken,
    console: Console,
    _subscriptions: Vec<Subscription>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn say(console: &Console, line: String) {
    if console.send(line).is_err() {
        debug!("console closed");
    }
}

impl Session {
    /// Connect `network` with `profile` and start replicating the local tank.
    pub async fn start(network: Network<Profile>, profile: Profile, console: Console) -> Result<Self> {
        let endpoint = network.endpoint().clone();
        let local = endpoint.local_id().clone();
        let config = endpoint.config().clone();

        let tank = Arc::new(Mutex::new(Tank::new(&local, &profile.pseudo, &profile.vehicle)));
        let chat = Chat::new(endpoint.clone());
        let events = Arc::new(GameEvents::new(endpoint.clone()));
        let time_of_day = Arc::new(Mutex::new(START_TIME_OF_DAY));
        let ended = CancellationToken::new();
        let mut subscriptions = Vec::new();

        let manager = {
            let console = console.clone();
            ReplicationManager::new(local.clone(), config.staleness_timeout(), move |uuid: &PeerId| {
                let proxy = Tank::proxy(uuid);
                let console = console.clone();
                let uuid = uuid.clone();
                proxy
                    .on_event(move |_| {
                        say(&console, format!("* {} was destroyed", short(&uuid)));
                    })
                    .detach();
                proxy
            })
        };
        {
            let console = console.clone();
            subscriptions.push(manager.on_event(move |event| match event {
                ReplicationEvent::Added(uuid) => say(&console, format!("* {} rolled in", short(uuid))),
                ReplicationEvent::Removed(uuid) => say(&console, format!("* {} vanished", short(uuid))),
            }));
        }

        {
            let console = console.clone();
            subscriptions.push(chat.on_message(move |line| {
                let name = line.author.metadata.display_name(line.author.uuid.as_str());
                say(
                    &console,
                    format!("[{}] <{}> {}", line.date.format("%H:%M:%S"), name, line.message),
                );
            }));
        }

        {
            let console = console.clone();
            subscriptions.push(lock(&tank).on_event(move |_| {
                say(&console, "* your tank was destroyed".to_string());
            }));
        }

        {
            let console = console.clone();
            let tank = tank.clone();
            let time_of_day = time_of_day.clone();
            let local = local.clone();
            let outbound = endpoint.clone();
            subscriptions.push(events.on_event(move |received| {
                let who = received.origin.metadata.display_name(received.origin.uuid.as_str());
                match &received.event {
                    GameEvent::Honk => say(&console, format!("* {who} honks")),
                    GameEvent::Shoot(_) => say(&console, format!("* {who} fires")),
                    GameEvent::Hit(hit) if hit.target == local => {
                        let mut tank = lock(&tank);
                        let was_destroyed = tank.is_destroyed();
                        if let Err(e) = tank.damage(hit.damage) {
                            debug!("damage not applied: {}", e);
                        }
                        say(&console, format!("* hit by {who}, health {:.0}", tank.health()));
                        if !was_destroyed && tank.is_destroyed() {
                            let blast = Explosion {
                                position: tank.position(),
                            };
                            if let Err(e) = outbound.send(EXPLOSION, &blast) {
                                debug!("explosion not sent: {}", e);
                            }
                        }
                    }
                    GameEvent::Hit(hit) => {
                        say(&console, format!("* {who} hit {}", short(&hit.target)))
                    }
                    GameEvent::Explosion(_) => say(&console, format!("* explosion near {who}")),
                    GameEvent::TimeSync(sync) => {
                        *lock(&time_of_day) = sync.time_of_day;
                        debug!(time_of_day = sync.time_of_day, "time synced");
                    }
                }
            }));
        }

        {
            let console = console.clone();
            subscriptions.push(endpoint.on_join(move |membership| {
                let name = membership.peer.metadata.display_name(membership.peer.uuid.as_str());
                say(&console, format!("* {name} joined ({} players)", membership.peers.len()));
            }));
        }
        {
            let console = console.clone();
            subscriptions.push(endpoint.on_leave(move |membership| {
                let name = membership.peer.metadata.display_name(membership.peer.uuid.as_str());
                say(&console, format!("* {name} left"));
            }));
        }
        if network.is_host() {
            let events = events.clone();
            let time_of_day = time_of_day.clone();
            subscriptions.push(endpoint.on_join(move |_| {
                let now = *lock(&time_of_day);
                if let Err(e) = events.sync_time(now) {
                    debug!("time sync not sent: {}", e);
                }
            }));
        }

        {
            let ended = ended.clone();
            let console = console.clone();
            subscriptions.push(endpoint.on_status(move |status| {
                if status == NetworkStatus::Disconnected {
                    say(&console, "* disconnected".to_string());
                    ended.cancel();
                }
            }));
        }
        // Listeners go in first so nothing sent right after the join is missed.
        network
            .connect(profile.clone())
            .await
            .context("Failed to join the session")?;
        info!(peer = %local, host = network.is_host(), "session started");
        if network.status() != NetworkStatus::Connected {
            ended.cancel();
        }

        let replication = spawn_replication(endpoint, tank.clone(), manager, config.snapshot_interval());

        Ok(Self {
            network,
            tank,
            chat,
            events,
            replication,
            time_of_day,
            ended,
            console,
            _subscriptions: subscriptions,
        })
    }

    pub fn network(&self) -> &Network<Profile> {
        &self.network
    }

    pub fn tank(&self) -> &Arc<Mutex<Tank>> {
        &self.tank
    }

    pub fn replication(&self) -> &ReplicationHandle<Tank> {
        &self.replication
    }

    pub fn time_of_day(&self) -> f64 {
        *lock(&self.time_of_day)
    }

    /// Resolves once the network drops to `Disconnected`.
    pub fn ended(&self) -> WaitForCancellationFuture<'_> {
        self.ended.cancelled()
    }

    pub fn handle_line(&self, line: &str) -> Flow {
        let Some(command) = Command::parse(line) else {
            return Flow::Continue;
        };
        match command {
            Command::Chat(text) => {
                if !self.chat.send(&text) {
                    self.say("* message not sent (too fast or not connected)".into());
                }
            }
            Command::Drive {
                steering,
                engine,
                brake,
            } => {
                if let Err(e) = lock(&self.tank).set_controls(steering, engine, brake) {
                    debug!("controls: {}", e);
                }
            }
            Command::Honk => self.report(self.events.honk()),
            Command::Shoot => self.shoot(),
            Command::Lights => {
                if let Err(e) = lock(&self.tank).toggle_headlights() {
                    debug!("headlights: {}", e);
                }
            }
            Command::Peers => {
                let peers = self.network.connected_peers();
                let names: Vec<String> = peers
                    .iter()
                    .map(|p| p.metadata.display_name(p.uuid.as_str()))
                    .collect();
                self.say(format!("* {} players: {}", peers.len(), names.join(", ")));
            }
            Command::Status => {
                let (health, [x, _, z]) = {
                    let tank = lock(&self.tank);
                    (tank.health(), tank.position())
                };
                let proxies = lock(self.replication.manager()).len();
                self.say(format!(
                    "* {} | health {:.0} | at ({:.1}, {:.1}) | {} remote tanks | time {:.1}h",
                    self.network.status(),
                    health,
                    x,
                    z,
                    proxies,
                    self.time_of_day()
                ));
            }
            Command::Quit => return Flow::Quit,
            Command::Unknown(_) => self.say(HELP.to_string()),
        }
        Flow::Continue
    }

    /// Fire along the barrel and report any remote tank close to the shell's
    /// path as hit.
    fn shoot(&self) {
        let (position, direction, destroyed) = {
            let tank = lock(&self.tank);
            (tank.position(), tank.aim(), tank.is_destroyed())
        };
        if destroyed {
            self.say("* your tank is destroyed".into());
            return;
        }
        self.report(self.events.shoot(&Shoot {
            position,
            direction,
        }));

        let target = {
            let manager = lock(self.replication.manager());
            manager
                .proxies()
                .filter(|(_, proxy)| !proxy.entity().is_destroyed())
                .filter_map(|(uuid, proxy)| {
                    distance_along(position, direction, proxy.entity().position())
                        .map(|d| (d, uuid.clone(), proxy.entity().position()))
                })
                .min_by(|a, b| a.0.total_cmp(&b.0))
        };
        if let Some((_, uuid, at)) = target {
            self.report(self.events.hit(uuid, SHELL_DAMAGE));
            self.report(self.events.explosion(at));
        }
    }

    fn report(&self, result: Result<(), peer_mesh::SendError>) {
        if let Err(e) = result {
            self.say(format!("* not sent: {e}"));
        }
    }

    fn say(&self, line: String) {
        say(&self.console, line);
    }

    pub async fn shutdown(self) {
        self.replication.stop().await;
        self.network.disconnect().await;
        info!("session closed");
    }
}

/// Distance along the ray at which `target` passes within the hit radius.
fn distance_along(origin: [f64; 3], direction: [f64; 3], target: [f64; 3]) -> Option<f64> {
    let offset = [
        target[0] - origin[0],
        target[1] - origin[1],
        target[2] - origin[2],
    ];
    let along: f64 = (0..3).map(|i| offset[i] * direction[i]).sum();
    if !(0.0..=SHELL_RANGE).contains(&along) {
        return None;
    }
    let miss_sq: f64 = (0..3).map(|i| (offset[i] - direction[i] * along).powi(2)).sum();
    (miss_sq <= HIT_RADIUS * HIT_RADIUS).then_some(along)
}

fn short(uuid: &PeerId) -> String {
    uuid.as_str().chars().take(8).collect()
}
