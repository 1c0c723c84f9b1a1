//! Proxy lifecycle as a pure state machine.
//!
//! No I/O and no clock of its own: callers pass `now` and the step duration,
//! so the same code runs under the ticker and under tests.
//!
//! Membership changes are queued rather than emitted in place. The owner
//! drains them with [`ReplicationManager::take_events`] and emits the batch
//! after releasing any lock it holds on the manager, so `on_event` listeners
//! may lock the manager themselves.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use property_bag::{Listeners, Snapshot, Subscription};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::ReplicatedEntity;
use crate::identity::PeerId;

type Factory<E> = Box<dyn FnMut(&PeerId) -> E + Send>;

/// Proxy membership changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    Added(PeerId),
    Removed(PeerId),
}

/// A remote-controlled entity and the time of its last snapshot.
pub struct Proxy<E> {
    entity: E,
    last_update: Instant,
}

impl<E> Proxy<E> {
    pub fn entity(&self) -> &E {
        &self.entity
    }

    pub fn entity_mut(&mut self) -> &mut E {
        &mut self.entity
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }
}

pub struct ReplicationManager<E> {
    local: PeerId,
    timeout: Duration,
    factory: Factory<E>,
    pending: BTreeMap<PeerId, Snapshot>,
    proxies: BTreeMap<PeerId, Proxy<E>>,
    events: Listeners<ReplicationEvent>,
    queued: Vec<ReplicationEvent>,
}

/// Membership changes drained from a manager, ready to emit.
#[must_use = "events are only delivered by `emit`"]
pub struct EventBatch {
    events: Vec<ReplicationEvent>,
    listeners: Listeners<ReplicationEvent>,
}

impl EventBatch {
    pub fn events(&self) -> &[ReplicationEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Deliver every event to the manager's `on_event` listeners, oldest first.
    pub fn emit(self) {
        for event in &self.events {
            self.listeners.emit(event);
        }
    }
}

impl<E> fmt::Debug for ReplicationManager<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationManager")
            .field("local", &self.local)
            .field("timeout", &self.timeout)
            .field("pending", &self.pending.len())
            .field("queued", &self.queued.len())
            .field("proxies", &self.proxies.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<E: ReplicatedEntity> ReplicationManager<E> {
    /// `factory` builds a fresh proxy entity for a uuid seen for the first time.
    pub fn new<F>(local: PeerId, timeout: Duration, factory: F) -> Self
    where
        F: FnMut(&PeerId) -> E + Send + 'static,
    {
        Self {
            local,
            timeout,
            factory: Box::new(factory),
            pending: BTreeMap::new(),
            proxies: BTreeMap::new(),
            events: Listeners::new(),
            queued: Vec::new(),
        }
    }

    /// Buffer a snapshot until the next `flush`. Last write wins per uuid.
    /// Snapshots without a string `uuid`, or carrying our own, are ignored.
    pub fn receive(&mut self, snapshot: Snapshot) {
        let Some(uuid) = snapshot.get("uuid").and_then(|v| v.as_str()) else {
            trace!("ignoring snapshot without uuid");
            return;
        };
        let uuid = PeerId::from(uuid);
        if uuid == self.local {
            return;
        }
        self.pending.insert(uuid, snapshot);
    }

    /// Commit buffered snapshots: create missing proxies, refresh existing ones.
    pub fn flush(&mut self, now: Instant) {
        let pending = std::mem::take(&mut self.pending);
        for (uuid, snapshot) in pending {
            match self.proxies.get_mut(&uuid) {
                Some(proxy) => {
                    proxy.entity.import(&snapshot);
                    proxy.last_update = now;
                }
                None => {
                    let mut entity = (self.factory)(&uuid);
                    entity.import(&snapshot);
                    self.proxies.insert(
                        uuid.clone(),
                        Proxy {
                            entity,
                            last_update: now,
                        },
                    );
                    info!(peer = %uuid, "proxy added");
                    self.queued.push(ReplicationEvent::Added(uuid));
                }
            }
        }
    }

    /// Evict stale proxies, then advance the survivors by `dt`. A proxy is
    /// stale when `now - last_update > timeout + dt`.
    pub fn step(&mut self, now: Instant, dt: Duration) -> Vec<PeerId> {
        let limit = self.timeout + dt;
        let stale: Vec<PeerId> = self
            .proxies
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_update) > limit)
            .map(|(uuid, _)| uuid.clone())
            .collect();

        for uuid in &stale {
            debug!(peer = %uuid, "proxy stale");
            self.evict(uuid);
        }
        for proxy in self.proxies.values_mut() {
            proxy.entity.advance(dt);
        }
        stale
    }

    /// Destroy and remove one proxy. Returns false if it did not exist.
    pub fn evict(&mut self, uuid: &PeerId) -> bool {
        let Some(mut proxy) = self.proxies.remove(uuid) else {
            return false;
        };
        proxy.entity.destroy();
        info!(peer = %uuid, "proxy removed");
        self.queued.push(ReplicationEvent::Removed(uuid.clone()));
        true
    }

    pub fn proxy(&self, uuid: &PeerId) -> Option<&Proxy<E>> {
        self.proxies.get(uuid)
    }

    pub fn proxy_mut(&mut self, uuid: &PeerId) -> Option<&mut Proxy<E>> {
        self.proxies.get_mut(uuid)
    }

    pub fn proxies(&self) -> impl Iterator<Item = (&PeerId, &Proxy<E>)> {
        self.proxies.iter()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Listen for proxy membership changes. Nothing is delivered until the
    /// owner emits a batch from `take_events`.
    pub fn on_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ReplicationEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    /// Drain the changes queued by `flush`, `step` and `evict`.
    pub fn take_events(&mut self) -> EventBatch {
        EventBatch {
            events: std::mem::take(&mut self.queued),
            listeners: self.events.clone(),
        }
    }
}
