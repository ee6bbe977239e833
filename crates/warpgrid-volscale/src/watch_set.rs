//! The watch set: volumes currently monitored by the controller.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use warpgrid_volume::{TrackedVolume, VolumeId};

/// Shared map of identity → last known snapshot.
///
/// Every operation takes the lock once, so a rekey can never leave two
/// entries for the same object or none at all.
#[derive(Clone, Default)]
pub struct WatchSet {
    volumes: Arc<RwLock<HashMap<VolumeId, TrackedVolume>>>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a snapshot. Returns true if the identity is new.
    pub async fn insert(&self, volume: TrackedVolume) -> bool {
        let mut volumes = self.volumes.write().await;
        volumes.insert(volume.id(), volume).is_none()
    }

    /// Replace the snapshot only if the identity is already watched.
    pub async fn refresh(&self, volume: TrackedVolume) -> bool {
        let mut volumes = self.volumes.write().await;
        match volumes.get_mut(&volume.id()) {
            Some(entry) => {
                *entry = volume;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: &VolumeId) -> Option<TrackedVolume> {
        self.volumes.write().await.remove(id)
    }

    /// Drop `old` and insert `volume` under its own identity atomically.
    pub async fn rekey(&self, old: &VolumeId, volume: TrackedVolume) {
        let mut volumes = self.volumes.write().await;
        volumes.remove(old);
        volumes.insert(volume.id(), volume);
    }

    pub async fn contains(&self, id: &VolumeId) -> bool {
        self.volumes.read().await.contains_key(id)
    }

    pub async fn get(&self, id: &VolumeId) -> Option<TrackedVolume> {
        self.volumes.read().await.get(id).cloned()
    }

    /// Point-in-time copy of all snapshots, for iteration without the lock.
    pub async fn snapshot(&self) -> Vec<TrackedVolume> {
        self.volumes.read().await.values().cloned().collect()
    }

    pub async fn ids(&self) -> Vec<VolumeId> {
        let mut ids: Vec<VolumeId> = self.volumes.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.volumes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.volumes.read().await.is_empty()
    }
}
