//! Cluster watch → `WatchEvent` feed.
//!
//! The kube watcher reports only the current object. A cache of the last
//! seen snapshot per claim uid turns those into `Added`, `Updated { old,
//! new }`, and `Deleted` events; claims that vanish across a re-list are
//! reported as deleted.

use std::collections::{HashMap, HashSet};

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use warpgrid_volume::{TrackedVolume, WatchEvent};

use crate::convert::tracked_from_claim;

fn cache_key(claim: &PersistentVolumeClaim) -> String {
    match &claim.metadata.uid {
        Some(uid) => uid.clone(),
        None => format!(
            "{}/{}",
            claim.metadata.namespace.as_deref().unwrap_or_default(),
            claim.metadata.name.as_deref().unwrap_or_default()
        ),
    }
}

#[derive(Default)]
pub struct EventTranslator {
    cache: HashMap<String, TrackedVolume>,
    /// Keys seen since the current re-list started.
    relisting: Option<HashSet<String>>,
}

impl EventTranslator {
    pub fn translate(&mut self, event: watcher::Event<PersistentVolumeClaim>) -> Vec<WatchEvent> {
        match event {
            watcher::Event::Init => {
                self.relisting = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(claim) => {
                let key = cache_key(&claim);
                if let Some(seen) = self.relisting.as_mut() {
                    seen.insert(key.clone());
                }
                vec![self.apply(key, &claim)]
            }
            watcher::Event::InitDone => {
                let seen = self.relisting.take().unwrap_or_default();
                let gone: Vec<String> = self
                    .cache
                    .keys()
                    .filter(|key| !seen.contains(*key))
                    .cloned()
                    .collect();
                gone.into_iter()
                    .filter_map(|key| self.cache.remove(&key))
                    .map(WatchEvent::Deleted)
                    .collect()
            }
            watcher::Event::Apply(claim) => {
                let key = cache_key(&claim);
                vec![self.apply(key, &claim)]
            }
            watcher::Event::Delete(claim) => {
                let key = cache_key(&claim);
                let volume = self
                    .cache
                    .remove(&key)
                    .unwrap_or_else(|| tracked_from_claim(&claim));
                vec![WatchEvent::Deleted(volume)]
            }
        }
    }

    fn apply(&mut self, key: String, claim: &PersistentVolumeClaim) -> WatchEvent {
        let new = tracked_from_claim(claim);
        match self.cache.insert(key, new.clone()) {
            Some(old) => WatchEvent::Updated { old, new },
            None => WatchEvent::Added(new),
        }
    }
}

/// Start watching all claims. Events are delivered on the returned
/// channel until the receiver is dropped.
pub fn spawn_watch_feed(client: Client) -> (mpsc::UnboundedReceiver<WatchEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let api: Api<PersistentVolumeClaim> = Api::all(client);

    let handle = tokio::spawn(async move {
        info!("volume claim watch started");
        let mut translator = EventTranslator::default();
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    for event in translator.translate(event) {
                        debug!(volume = %event.id(), "volume claim changed");
                        if tx.send(event).is_err() {
                            info!("volume event receiver dropped, stopping watch");
                            return;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "volume claim watch error"),
            }
        }
        warn!("volume claim watch ended");
    });

    (rx, handle)
}
