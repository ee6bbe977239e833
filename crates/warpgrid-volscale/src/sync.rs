//! Watch set synchronizer — keeps the watch set equal to the set of
//! volumes whose enablement annotation is currently truthy.
//!
//! Bootstrap lists the cluster once; afterwards every change arrives on a
//! single ingress channel consumed by one task, so events are applied in
//! the order the feed delivered them.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use warpgrid_volume::status::{clear_status_annotation, init_status_annotation};
use warpgrid_volume::*;

use crate::in_flight::InFlight;
use crate::queue::ResizeQueue;
use crate::watch_set::WatchSet;

pub struct WatchSetSynchronizer {
    store: Arc<dyn VolumeStore>,
    watch_set: WatchSet,
    in_flight: InFlight,
    queue: Arc<ResizeQueue>,
}

impl WatchSetSynchronizer {
    pub fn new(
        store: Arc<dyn VolumeStore>,
        watch_set: WatchSet,
        in_flight: InFlight,
        queue: Arc<ResizeQueue>,
    ) -> Self {
        Self {
            store,
            watch_set,
            in_flight,
            queue,
        }
    }

    /// Seed the watch set from a full listing. Returns the number of
    /// enabled volumes found.
    pub async fn bootstrap(&self) -> VolumeResult<usize> {
        let volumes = self.store.list_volumes().await?;
        let mut watched = 0;
        for volume in volumes.into_iter().filter(TrackedVolume::autoscaling_enabled) {
            let volume = self.ensure_status(volume).await;
            info!(volume = %volume.id(), "watching volume");
            self.watch_set.insert(volume).await;
            watched += 1;
        }
        info!(count = watched, "volumes with autoscaling enabled");
        Ok(watched)
    }

    /// Apply one change event to the watch set.
    pub async fn handle(&self, event: WatchEvent) {
        match event {
            WatchEvent::Added(volume) => {
                if volume.autoscaling_enabled() {
                    let volume = self.ensure_status(volume).await;
                    if self.watch_set.insert(volume.clone()).await {
                        info!(volume = %volume.id(), "start watching");
                    }
                }
            }
            WatchEvent::Deleted(volume) => self.forget_volume(&volume.id()).await,
            WatchEvent::Updated { old, new } => self.handle_update(old, new).await,
        }
    }

    async fn handle_update(&self, old: TrackedVolume, new: TrackedVolume) {
        let old_id = old.id();
        let new_id = new.id();
        match (old.autoscaling_enabled(), new.autoscaling_enabled()) {
            (false, true) => {
                let new = self.ensure_status(new).await;
                self.watch_set.rekey(&old_id, new).await;
                info!(volume = %new_id, "start watching");
            }
            (true, false) => {
                self.watch_set.remove(&old_id).await;
                self.queue.discard(&old_id);
                info!(volume = %old_id, "stop watching");
            }
            (true, true) if old_id != new_id => {
                self.watch_set.rekey(&old_id, new).await;
                info!(from = %old_id, to = %new_id, "watched volume renamed");
            }
            (true, true) => {
                if self.watch_set.refresh(new).await {
                    debug!(volume = %new_id, "watched snapshot refreshed");
                }
            }
            (false, false) => {}
        }
    }

    async fn forget_volume(&self, id: &VolumeId) {
        let was_watched = self.watch_set.remove(id).await.is_some();
        self.in_flight.release(id);
        self.queue.discard(id);
        self.queue.forget(id);
        if was_watched {
            info!(volume = %id, "stop watching deleted volume");
        }

        match self.store.get_volume(id).await {
            Ok(mut live) => {
                if clear_status_annotation(&mut live) {
                    if let Err(e) = self.store.update_volume(&live).await {
                        debug!(volume = %id, error = %e, "could not clear autoscaler status");
                    }
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => debug!(volume = %id, error = %e, "could not fetch deleted volume"),
        }
    }

    /// Persist a default status annotation if the volume has none.
    /// Returns the freshest snapshot available.
    async fn ensure_status(&self, volume: TrackedVolume) -> TrackedVolume {
        let mut initialized = volume.clone();
        match init_status_annotation(&mut initialized) {
            Ok(false) => volume,
            Ok(true) => match self.store.update_volume(&initialized).await {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(volume = %volume.id(), error = %e, "could not initialize autoscaler status");
                    volume
                }
            },
            Err(e) => {
                warn!(volume = %volume.id(), error = %e, "could not encode autoscaler status");
                volume
            }
        }
    }

    /// Drain the event feed until it closes or shutdown is signalled.
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<WatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("watch set synchronizer started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        debug!(volume = %event.id(), "volume event");
                        self.handle(event).await;
                    }
                    None => {
                        warn!("volume event feed closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    info!("watch set synchronizer shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::queue::ResizeRequest;

    struct Fixture {
        store: MemoryVolumeStore,
        watch_set: WatchSet,
        in_flight: InFlight,
        queue: Arc<ResizeQueue>,
        sync: WatchSetSynchronizer,
    }

    fn fixture() -> Fixture {
        let store = MemoryVolumeStore::new();
        let watch_set = WatchSet::new();
        let in_flight = InFlight::new();
        let queue = Arc::new(ResizeQueue::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        ));
        let sync = WatchSetSynchronizer::new(
            Arc::new(store.clone()),
            watch_set.clone(),
            in_flight.clone(),
            queue.clone(),
        );
        Fixture {
            store,
            watch_set,
            in_flight,
            queue,
            sync,
        }
    }

    fn volume(name: &str, enabled: Option<&str>) -> TrackedVolume {
        let mut volume = TrackedVolume {
            namespace: "default".to_string(),
            name: name.to_string(),
            requested_bytes: Some(10 << 30),
            ..Default::default()
        };
        if let Some(value) = enabled {
            volume
                .annotations
                .insert(annotations::ENABLED.to_string(), value.to_string());
        }
        volume
    }

    #[tokio::test]
    async fn bootstrap_keeps_enabled_and_initializes_status() {
        let f = fixture();
        f.store.put_volume(volume("a", Some("true"))).await;
        f.store.put_volume(volume("b", Some("Enabled"))).await;
        f.store.put_volume(volume("c", Some("false"))).await;
        f.store.put_volume(volume("d", None)).await;

        assert_eq!(f.sync.bootstrap().await.unwrap(), 2);
        assert_eq!(
            f.watch_set.ids().await,
            vec![VolumeId::new("default", "a"), VolumeId::new("default", "b")]
        );

        let live = f.store.volume(&VolumeId::new("default", "a")).await.unwrap();
        assert!(live.annotation(annotations::STATUS).is_some());
        let untouched = f.store.volume(&VolumeId::new("default", "c")).await.unwrap();
        assert!(untouched.annotation(annotations::STATUS).is_none());
    }

    #[tokio::test]
    async fn bootstrap_twice_writes_status_once() {
        let f = fixture();
        f.store.put_volume(volume("a", Some("true"))).await;

        f.sync.bootstrap().await.unwrap();
        f.sync.bootstrap().await.unwrap();
        assert_eq!(f.store.update_count().await, 1);
    }

    #[tokio::test]
    async fn added_enabled_volume_is_watched() {
        let f = fixture();
        let stored = f.store.put_volume(volume("a", Some("true"))).await;
        f.sync.handle(WatchEvent::Added(stored.clone())).await;
        assert!(f.watch_set.contains(&stored.id()).await);

        let ignored = f.store.put_volume(volume("b", None)).await;
        f.sync.handle(WatchEvent::Added(ignored.clone())).await;
        assert!(!f.watch_set.contains(&ignored.id()).await);
    }

    #[tokio::test]
    async fn enable_then_disable() {
        let f = fixture();
        let off = f.store.put_volume(volume("a", None)).await;
        let on = volume("a", Some("true"));

        f.sync
            .handle(WatchEvent::Updated {
                old: off.clone(),
                new: on.clone(),
            })
            .await;
        assert!(f.watch_set.contains(&on.id()).await);

        f.sync
            .handle(WatchEvent::Updated {
                old: on.clone(),
                new: volume("a", Some("no")),
            })
            .await;
        assert!(f.watch_set.is_empty().await);
    }

    #[tokio::test]
    async fn rename_while_enabled_swaps_keys() {
        let f = fixture();
        let old = volume("old", Some("true"));
        f.watch_set.insert(old.clone()).await;

        f.sync
            .handle(WatchEvent::Updated {
                old: old.clone(),
                new: volume("new", Some("true")),
            })
            .await;
        assert_eq!(f.watch_set.ids().await, vec![VolumeId::new("default", "new")]);
    }

    #[tokio::test]
    async fn same_identity_update_only_refreshes_watched() {
        let f = fixture();
        let v = volume("a", Some("true"));

        // Not watched (e.g. resized already): the update must not re-add it.
        let mut grown = v.clone();
        grown.requested_bytes = Some(12 << 30);
        f.sync
            .handle(WatchEvent::Updated {
                old: v.clone(),
                new: grown.clone(),
            })
            .await;
        assert!(f.watch_set.is_empty().await);

        f.watch_set.insert(v.clone()).await;
        f.sync
            .handle(WatchEvent::Updated {
                old: v.clone(),
                new: grown,
            })
            .await;
        let got = f.watch_set.get(&v.id()).await.unwrap();
        assert_eq!(got.requested_bytes, Some(12 << 30));
    }

    #[tokio::test]
    async fn delete_clears_all_state() {
        let f = fixture();
        let stored = f.store.put_volume(volume("a", Some("true"))).await;
        let id = stored.id();
        f.watch_set.insert(stored.clone()).await;
        let _claim = f.in_flight.try_claim(&id).unwrap();
        f.queue.add(ResizeRequest {
            volume: stored.clone(),
            new_capacity_bytes: 12 << 30,
            observed_capacity_bytes: 10 << 30,
        });

        let removed = f.store.delete_volume(&id).await.unwrap();
        f.sync.handle(WatchEvent::Deleted(removed)).await;

        assert!(!f.watch_set.contains(&id).await);
        assert!(!f.in_flight.is_claimed(&id));
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn run_drains_feed_until_shutdown() {
        let f = fixture();
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let stored = f.store.put_volume(volume("a", Some("true"))).await;
        tx.send(WatchEvent::Added(stored.clone())).unwrap();
        drop(tx);

        // Closed feed ends the loop on its own.
        f.sync.run(rx, shutdown_rx).await;
        assert!(f.watch_set.contains(&stored.id()).await);
        drop(shutdown_tx);
    }
}
