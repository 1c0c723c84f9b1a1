use std::sync::{Arc, Mutex};
use std::time::Duration;

use property_bag::Snapshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{ReplicatedEntity, ReplicationManager};
use crate::envelope::UPDATE;
use crate::identity::{Metadata, NetworkStatus};
use crate::lock;
use crate::network::Endpoint;

/// Running replication loop. Dropping the handle does not stop it; call
/// [`ReplicationHandle::stop`].
pub struct ReplicationHandle<E> {
    manager: Arc<Mutex<ReplicationManager<E>>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl<E> ReplicationHandle<E> {
    /// Shared access to the proxies. Do not hold the lock across an await.
    pub fn manager(&self) -> &Arc<Mutex<ReplicationManager<E>>> {
        &self.manager
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            debug!("replication task ended abnormally: {}", e);
        }
    }
}

/// Drive `manager` on a fixed cadence.
///
/// Each tick advances `local` by the measured tick duration and sends its
/// snapshot on `update` (while connected), commits the snapshots buffered
/// since the previous tick, then steps the proxies by the same duration.
/// Membership events are emitted after the manager lock is released. Ticks
/// that fall behind are delayed rather than bunched up.
pub fn spawn_replication<M, L, E>(
    endpoint: Endpoint<M>,
    local: Arc<Mutex<L>>,
    manager: ReplicationManager<E>,
    interval: Duration,
) -> ReplicationHandle<E>
where
    M: Metadata,
    L: ReplicatedEntity,
    E: ReplicatedEntity,
{
    let manager = Arc::new(Mutex::new(manager));
    let cancel = CancellationToken::new();

    let updates = {
        let manager = manager.clone();
        endpoint
            .channel::<Snapshot>(UPDATE)
            .on(move |snapshot, _origin| lock(&manager).receive(snapshot))
    };

    let task = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _updates = updates;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last = Instant::now();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    now = ticker.tick() => {
                        let dt = now.saturating_duration_since(last);
                        last = now;

                        let exported = {
                            let mut local = lock(&local);
                            local.advance(dt);
                            local.export()
                        };
                        if endpoint.status() == NetworkStatus::Connected {
                            match exported {
                                Ok(snapshot) => {
                                    if let Err(e) = endpoint.send(UPDATE, &snapshot) {
                                        trace!("snapshot not sent: {}", e);
                                    }
                                }
                                Err(e) => warn!("failed to export local entity: {}", e),
                            }
                        }

                        let events = {
                            let mut manager = lock(&manager);
                            manager.flush(now);
                            manager.step(now, dt);
                            manager.take_events()
                        };
                        events.emit();
                    }
                }
            }
            debug!("replication loop stopped");
        })
    };

    ReplicationHandle {
        manager,
        cancel,
        task,
    }
}
