//! Collaborator interfaces and their in-memory backends.
//!
//! The controller reaches the cluster through `VolumeStore` and the metrics
//! backend through `UsageSource`. Production adapters live with the daemon;
//! the in-memory versions here back tests and dry runs, with failure
//! injection and an event feed that mirrors the cluster's watch stream.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use crate::error::{VolumeError, VolumeResult};
use crate::types::*;

/// Cluster object store for volume claims.
#[async_trait]
pub trait VolumeStore: Send + Sync {
    /// List every volume claim in the cluster.
    async fn list_volumes(&self) -> VolumeResult<Vec<TrackedVolume>>;

    /// Fetch the live state of one volume claim.
    async fn get_volume(&self, id: &VolumeId) -> VolumeResult<TrackedVolume>;

    /// Conditionally write `volume` back. Fails with `Conflict` when the
    /// resource version no longer matches.
    async fn update_volume(&self, volume: &TrackedVolume) -> VolumeResult<TrackedVolume>;

    /// Whether the named storage class allows volume expansion.
    async fn is_expansion_allowed(&self, storage_class: &str) -> VolumeResult<bool>;
}

/// Batch source of per-volume utilization.
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn fetch_usage_samples(&self) -> VolumeResult<UsageSamples>;
}

// ── In-memory volume store ────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    volumes: BTreeMap<VolumeId, TrackedVolume>,
    storage_classes: HashMap<String, bool>,
    next_version: u64,
    update_count: u64,
    fail_updates: Option<String>,
    subscribers: Vec<mpsc::UnboundedSender<WatchEvent>>,
}

impl MemoryState {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn publish(&mut self, event: WatchEvent) {
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// In-memory `VolumeStore` (for testing and dry runs).
#[derive(Clone, Default)]
pub struct MemoryVolumeStore {
    inner: Arc<RwLock<MemoryState>>,
}

impl MemoryVolumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a volume, publishing `Added` or `Updated`.
    pub async fn put_volume(&self, mut volume: TrackedVolume) -> TrackedVolume {
        let mut state = self.inner.write().await;
        volume.resource_version = Some(state.bump_version());
        let id = volume.id();
        let event = match state.volumes.insert(id.clone(), volume.clone()) {
            Some(old) => WatchEvent::Updated {
                old,
                new: volume.clone(),
            },
            None => WatchEvent::Added(volume.clone()),
        };
        state.publish(event);
        debug!(volume = %id, "volume stored");
        volume
    }

    /// Delete a volume, publishing `Deleted`. Returns the removed snapshot.
    pub async fn delete_volume(&self, id: &VolumeId) -> Option<TrackedVolume> {
        let mut state = self.inner.write().await;
        let removed = state.volumes.remove(id)?;
        state.publish(WatchEvent::Deleted(removed.clone()));
        debug!(volume = %id, "volume deleted");
        Some(removed)
    }

    /// Current snapshot of a volume, if present.
    pub async fn volume(&self, id: &VolumeId) -> Option<TrackedVolume> {
        self.inner.read().await.volumes.get(id).cloned()
    }

    pub async fn set_storage_class(&self, name: &str, allow_expansion: bool) {
        self.inner
            .write()
            .await
            .storage_classes
            .insert(name.to_string(), allow_expansion);
    }

    /// Make every subsequent `update_volume` fail with `message`
    /// (or succeed again with `None`).
    pub async fn fail_updates(&self, message: Option<&str>) {
        self.inner.write().await.fail_updates = message.map(str::to_string);
    }

    /// Number of successful `update_volume` calls.
    pub async fn update_count(&self) -> u64 {
        self.inner.read().await.update_count
    }

    /// Subscribe to change events for volumes stored after this call.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<WatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().await.subscribers.push(tx);
        rx
    }
}

#[async_trait]
impl VolumeStore for MemoryVolumeStore {
    async fn list_volumes(&self) -> VolumeResult<Vec<TrackedVolume>> {
        Ok(self.inner.read().await.volumes.values().cloned().collect())
    }

    async fn get_volume(&self, id: &VolumeId) -> VolumeResult<TrackedVolume> {
        self.inner
            .read()
            .await
            .volumes
            .get(id)
            .cloned()
            .ok_or_else(|| VolumeError::NotFound(id.to_string()))
    }

    async fn update_volume(&self, volume: &TrackedVolume) -> VolumeResult<TrackedVolume> {
        let mut state = self.inner.write().await;
        if let Some(message) = &state.fail_updates {
            return Err(VolumeError::Api(message.clone()));
        }

        let id = volume.id();
        let current = state
            .volumes
            .get(&id)
            .ok_or_else(|| VolumeError::NotFound(id.to_string()))?;
        if volume.resource_version.is_some() && volume.resource_version != current.resource_version {
            return Err(VolumeError::Conflict(
                id.to_string(),
                "resource version changed".to_string(),
            ));
        }

        let mut stored = volume.clone();
        stored.resource_version = Some(state.bump_version());
        let old = state
            .volumes
            .insert(id.clone(), stored.clone())
            .unwrap_or_default();
        state.update_count += 1;
        state.publish(WatchEvent::Updated {
            old,
            new: stored.clone(),
        });
        debug!(volume = %id, version = ?stored.resource_version, "volume updated");
        Ok(stored)
    }

    async fn is_expansion_allowed(&self, storage_class: &str) -> VolumeResult<bool> {
        self.inner
            .read()
            .await
            .storage_classes
            .get(storage_class)
            .copied()
            .ok_or_else(|| VolumeError::NotFound(format!("storage class {storage_class}")))
    }
}

// ── In-memory usage source ────────────────────────────────────────

/// In-memory `UsageSource` (for testing and dry runs).
#[derive(Clone, Default)]
pub struct MemoryUsageSource {
    samples: Arc<RwLock<UsageSamples>>,
    failure: Arc<RwLock<Option<String>>>,
}

impl MemoryUsageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_sample(&self, id: VolumeId, used_bytes: u64, capacity_bytes: u64) {
        self.samples.write().await.insert(
            id,
            UsageSample {
                used_bytes,
                capacity_bytes,
            },
        );
    }

    pub async fn remove_sample(&self, id: &VolumeId) {
        self.samples.write().await.remove(id);
    }

    /// Make fetches fail with `message` (or succeed again with `None`).
    pub async fn fail_with(&self, message: Option<&str>) {
        *self.failure.write().await = message.map(str::to_string);
    }
}

#[async_trait]
impl UsageSource for MemoryUsageSource {
    async fn fetch_usage_samples(&self) -> VolumeResult<UsageSamples> {
        if let Some(message) = self.failure.read().await.as_ref() {
            return Err(VolumeError::Metrics(message.clone()));
        }
        Ok(self.samples.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_volume(ns: &str, name: &str) -> TrackedVolume {
        TrackedVolume {
            namespace: ns.to_string(),
            name: name.to_string(),
            requested_bytes: Some(10 << 30),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn put_get_list_delete() {
        let store = MemoryVolumeStore::new();
        store.put_volume(test_volume("default", "a")).await;
        store.put_volume(test_volume("default", "b")).await;

        assert_eq!(store.list_volumes().await.unwrap().len(), 2);
        let a = store.get_volume(&VolumeId::new("default", "a")).await.unwrap();
        assert_eq!(a.requested_bytes, Some(10 << 30));

        store.delete_volume(&VolumeId::new("default", "a")).await;
        let missing = store.get_volume(&VolumeId::new("default", "a")).await;
        assert!(matches!(missing, Err(VolumeError::NotFound(_))));
    }

    #[tokio::test]
    async fn update_rejects_stale_version() {
        let store = MemoryVolumeStore::new();
        let stored = store.put_volume(test_volume("default", "a")).await;

        let mut first = stored.clone();
        first.requested_bytes = Some(12 << 30);
        store.update_volume(&first).await.unwrap();

        // Second writer still holds the original version.
        let mut second = stored;
        second.requested_bytes = Some(20 << 30);
        let result = store.update_volume(&second).await;
        assert!(matches!(result, Err(VolumeError::Conflict(..))));
        assert_eq!(store.update_count().await, 1);
    }

    #[tokio::test]
    async fn injected_update_failure() {
        let store = MemoryVolumeStore::new();
        let stored = store.put_volume(test_volume("default", "a")).await;
        store.fail_updates(Some("forced update error")).await;

        let err = store.update_volume(&stored).await.unwrap_err();
        assert!(err.to_string().contains("forced update error"));
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let store = MemoryVolumeStore::new();
        let mut events = store.subscribe().await;

        let stored = store.put_volume(test_volume("default", "a")).await;
        store.update_volume(&stored).await.unwrap();
        store.delete_volume(&stored.id()).await;

        assert!(matches!(events.recv().await, Some(WatchEvent::Added(_))));
        assert!(matches!(events.recv().await, Some(WatchEvent::Updated { .. })));
        assert!(matches!(events.recv().await, Some(WatchEvent::Deleted(_))));
    }

    #[tokio::test]
    async fn storage_class_lookup() {
        let store = MemoryVolumeStore::new();
        store.set_storage_class("fast", true).await;
        store.set_storage_class("legacy", false).await;

        assert!(store.is_expansion_allowed("fast").await.unwrap());
        assert!(!store.is_expansion_allowed("legacy").await.unwrap());
        assert!(store.is_expansion_allowed("missing").await.is_err());
    }

    #[tokio::test]
    async fn usage_source_failure_injection() {
        let usage = MemoryUsageSource::new();
        usage.set_sample(VolumeId::new("default", "a"), 80, 100).await;
        assert_eq!(usage.fetch_usage_samples().await.unwrap().len(), 1);

        usage.fail_with(Some("prometheus down")).await;
        assert!(usage.fetch_usage_samples().await.is_err());
    }
}
