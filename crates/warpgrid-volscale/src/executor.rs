//! Resize executor — applies one queued resize under a dedup claim.
//!
//! ```text
//! claim ─► re-fetch live ─► decode status ─► backoff gate ─► apply
//!   │           │                 │                │           │
//!   └ held:     └ gone: forget    └ bad: retry     └ recent    ├ ok: forget, unwatch
//!     drop        opted out:        after window     failure:  └ err: stamp failure,
//!                 forget                             defer       rate-limited requeue
//!                 superseded:
//!                 drop
//! ```
//!
//! The claim is released before any re-submission so the redelivered
//! request can claim the volume again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use warpgrid_volume::status::record_failed_attempt;
use warpgrid_volume::*;

use crate::evaluator::apply_resize;
use crate::in_flight::InFlight;
use crate::queue::{ResizeQueue, ResizeRequest};
use crate::watch_set::WatchSet;

/// What happened to one dequeued request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// Requested capacity was written.
    Resized { from: u64, to: u64 },
    /// Another worker holds the volume; the request was dropped.
    AlreadyInFlight,
    /// Re-submitted to run after the given delay.
    Deferred(Duration),
    /// The attempt failed and was re-queued with backoff.
    Failed(String),
    /// The volume no longer exists.
    Vanished,
    /// Autoscaling was disabled on the live volume.
    OptedOut,
    /// The live volume already requests at least the target capacity.
    Superseded,
}

/// Applies resize requests handed out by the queue.
#[derive(Clone)]
pub struct ResizeExecutor {
    store: Arc<dyn VolumeStore>,
    queue: Arc<ResizeQueue>,
    watch_set: WatchSet,
    in_flight: InFlight,
    retry_after: Duration,
}

impl ResizeExecutor {
    pub fn new(
        store: Arc<dyn VolumeStore>,
        queue: Arc<ResizeQueue>,
        watch_set: WatchSet,
        in_flight: InFlight,
        retry_after: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            watch_set,
            in_flight,
            retry_after,
        }
    }

    /// Process one request. Never panics on collaborator errors; every
    /// failure ends in a re-submission or a drop.
    pub async fn process(&self, request: ResizeRequest) -> ResizeOutcome {
        let id = request.id();
        let Some(claim) = self.in_flight.try_claim(&id) else {
            debug!(volume = %id, "resize already in flight, dropping request");
            return ResizeOutcome::AlreadyInFlight;
        };

        let live = match self.store.get_volume(&id).await {
            Ok(volume) => volume,
            Err(e) if e.is_not_found() => {
                debug!(volume = %id, "volume gone, dropping resize");
                drop(claim);
                self.queue.forget(&id);
                return ResizeOutcome::Vanished;
            }
            Err(e) => {
                warn!(volume = %id, error = %e, "could not fetch live volume");
                drop(claim);
                self.queue.add_rate_limited(request);
                return ResizeOutcome::Failed(e.to_string());
            }
        };

        if !live.autoscaling_enabled() {
            debug!(volume = %id, "autoscaling disabled, dropping resize");
            drop(claim);
            self.queue.forget(&id);
            return ResizeOutcome::OptedOut;
        }

        let from = live.requested_bytes.unwrap_or(0);
        if from >= request.new_capacity_bytes {
            debug!(volume = %id, from, to = request.new_capacity_bytes, "resize superseded");
            drop(claim);
            self.queue.forget(&id);
            return ResizeOutcome::Superseded;
        }

        let status = match AutoscalerStatus::decode(&live) {
            Ok(status) => status,
            Err(e) => {
                warn!(volume = %id, error = %e, "unreadable autoscaler status, retrying later");
                drop(claim);
                self.queue.add_after(request, self.retry_after);
                return ResizeOutcome::Deferred(self.retry_after);
            }
        };

        let now = Utc::now();
        if let Some(remaining) = status.retry_remaining(now, self.retry_after) {
            debug!(
                volume = %id,
                remaining_secs = remaining.as_secs(),
                "last attempt failed recently, deferring resize"
            );
            drop(claim);
            self.queue.add_after(request, remaining);
            return ResizeOutcome::Deferred(remaining);
        }

        let to = request.new_capacity_bytes;
        match apply_resize(
            self.store.as_ref(),
            live,
            to,
            request.observed_capacity_bytes,
            now,
        )
        .await
        {
            Ok(_) => {
                drop(claim);
                self.queue.forget(&id);
                self.watch_set.remove(&id).await;
                info!(volume = %id, from, to, "volume resized");
                ResizeOutcome::Resized { from, to }
            }
            Err(e) => {
                warn!(
                    volume = %id,
                    error = %e,
                    attempts = self.queue.num_requeues(&id) + 1,
                    "resize attempt failed"
                );
                self.record_failure(&id, now).await;
                drop(claim);
                self.queue.add_rate_limited(request);
                ResizeOutcome::Failed(e.to_string())
            }
        }
    }

    /// Best-effort stamp of `lastFailedAttempt` on the live volume.
    async fn record_failure(&self, id: &VolumeId, now: DateTime<Utc>) {
        let mut volume = match self.store.get_volume(id).await {
            Ok(volume) => volume,
            Err(e) => {
                debug!(volume = %id, error = %e, "could not re-fetch volume to record failure");
                return;
            }
        };
        if let Err(e) = record_failed_attempt(&mut volume, now) {
            warn!(volume = %id, error = %e, "could not encode autoscaler status");
            return;
        }
        if let Err(e) = self.store.update_volume(&volume).await {
            warn!(volume = %id, error = %e, "could not record failed attempt");
        }
    }
}
