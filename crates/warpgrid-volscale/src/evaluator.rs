//! Decision evaluator — turns usage samples into resize requests.
//!
//! Runs once per polling interval over a snapshot of the watch set. Each
//! volume goes through a chain of preconditions; the first one that fails
//! is logged as a `SkipReason` and the cycle moves on to the next volume.
//! Only a failure to fetch the usage batch aborts a whole cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use warpgrid_volume::annotations;
use warpgrid_volume::quantity::{ceil_to_gibibyte, convert_percentage_to_bytes, parse_quantity};
use warpgrid_volume::status::record_scale;
use warpgrid_volume::*;

use crate::queue::{ResizeQueue, ResizeRequest};
use crate::watch_set::WatchSet;

/// Why a watched volume was not resized this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("no storage class set")]
    NoStorageClass,

    #[error("storage class {0} does not allow volume expansion")]
    ExpansionNotAllowed(String),

    #[error("could not look up storage class {0}: {1}")]
    StorageClassLookup(String, String),

    #[error("invalid storage ceiling: {0}")]
    InvalidCeiling(String),

    #[error("storage ceiling is zero")]
    ZeroCeiling,

    #[error("volume must be formatted with a filesystem")]
    BlockMode,

    #[error("volume is not bound")]
    NotBound,

    #[error("no usage sample for this cycle")]
    NoUsageSample,

    #[error("invalid threshold: {0}")]
    InvalidThreshold(String),

    #[error("requested capacity is not set yet")]
    NotProvisioned,

    #[error("invalid increase: {0}")]
    InvalidIncrease(String),

    #[error("invalid previous capacity marker {0:?}")]
    InvalidPreviousCapacity(String),

    #[error("still waiting for the previous resize to be accepted")]
    AwaitingResize,

    #[error("the cluster is still applying a previous resize")]
    ResizeInProgress,

    #[error("storage ceiling reached ({requested} >= {ceiling} bytes)")]
    CeilingReached { requested: u64, ceiling: u64 },

    #[error("usage below threshold ({used} < {threshold} bytes)")]
    BelowThreshold { used: u64, threshold: u64 },
}

impl SkipReason {
    /// Skips an operator should look at, as opposed to normal steady state.
    pub fn needs_attention(&self) -> bool {
        matches!(
            self,
            SkipReason::NoStorageClass
                | SkipReason::ExpansionNotAllowed(_)
                | SkipReason::StorageClassLookup(..)
                | SkipReason::InvalidCeiling(_)
                | SkipReason::ZeroCeiling
                | SkipReason::BlockMode
                | SkipReason::NoUsageSample
                | SkipReason::InvalidThreshold(_)
                | SkipReason::InvalidIncrease(_)
                | SkipReason::InvalidPreviousCapacity(_)
        )
    }
}

/// Outcome of evaluating one volume.
#[derive(Debug, Clone, PartialEq)]
pub enum ResizeDecision {
    Resize(ResizeRequest),
    Skip(SkipReason),
}

/// Ceiling from the annotation when set, otherwise the volume's limit.
pub fn effective_ceiling(volume: &TrackedVolume) -> Result<u64, SkipReason> {
    let ceiling = match volume.annotation(annotations::CEILING) {
        Some(raw) if !raw.trim().is_empty() => {
            parse_quantity(raw).map_err(|e| SkipReason::InvalidCeiling(e.to_string()))?
        }
        _ => volume.limit_bytes.unwrap_or(0),
    };
    if ceiling == 0 {
        return Err(SkipReason::ZeroCeiling);
    }
    Ok(ceiling)
}

/// Check that the volume can be grown at all and return its ceiling.
pub fn check_resizable(volume: &TrackedVolume) -> Result<u64, SkipReason> {
    let ceiling = effective_ceiling(volume)?;
    if !volume.is_filesystem() {
        return Err(SkipReason::BlockMode);
    }
    if volume.phase != VolumePhase::Bound {
        return Err(SkipReason::NotBound);
    }
    Ok(ceiling)
}

/// Decide whether `volume` needs to grow, given this cycle's sample.
///
/// Storage class eligibility is checked by the caller; everything else
/// is pure.
pub fn evaluate_volume(volume: &TrackedVolume, sample: Option<&UsageSample>) -> ResizeDecision {
    match decide(volume, sample) {
        Ok(request) => ResizeDecision::Resize(request),
        Err(reason) => ResizeDecision::Skip(reason),
    }
}

fn decide(volume: &TrackedVolume, sample: Option<&UsageSample>) -> Result<ResizeRequest, SkipReason> {
    let ceiling = check_resizable(volume)?;
    let sample = sample.ok_or(SkipReason::NoUsageSample)?;

    let threshold = convert_percentage_to_bytes(
        volume.annotation(annotations::THRESHOLD).unwrap_or(""),
        sample.capacity_bytes,
        annotations::DEFAULT_THRESHOLD,
    )
    .map_err(|e| SkipReason::InvalidThreshold(e.to_string()))?;

    let requested = match volume.requested_bytes {
        Some(bytes) if bytes > 0 => bytes,
        _ => return Err(SkipReason::NotProvisioned),
    };

    let increase = convert_percentage_to_bytes(
        volume.annotation(annotations::INCREASE).unwrap_or(""),
        requested,
        annotations::DEFAULT_INCREASE,
    )
    .map_err(|e| SkipReason::InvalidIncrease(e.to_string()))?;

    if let Some(raw) = volume.annotation(annotations::PREVIOUS_CAPACITY) {
        let previous: u64 = raw
            .trim()
            .parse()
            .map_err(|_| SkipReason::InvalidPreviousCapacity(raw.to_string()))?;
        if previous == sample.capacity_bytes {
            return Err(SkipReason::AwaitingResize);
        }
    }
    if volume.resize_pending {
        return Err(SkipReason::ResizeInProgress);
    }

    if requested >= ceiling {
        return Err(SkipReason::CeilingReached { requested, ceiling });
    }

    if sample.used_bytes < threshold {
        return Err(SkipReason::BelowThreshold {
            used: sample.used_bytes,
            threshold,
        });
    }

    let new_capacity = ceil_to_gibibyte(requested.saturating_add(increase)).min(ceiling);
    Ok(ResizeRequest {
        volume: volume.clone(),
        new_capacity_bytes: new_capacity,
        observed_capacity_bytes: sample.capacity_bytes,
    })
}

/// Write a resize to the cluster: new requested capacity, the
/// previous-capacity marker, and `lastScaleTime`, in one conditional update.
///
/// Errors are returned as-is; retry policy belongs to the caller.
pub async fn apply_resize(
    store: &dyn VolumeStore,
    mut volume: TrackedVolume,
    new_capacity_bytes: u64,
    observed_capacity_bytes: u64,
    now: DateTime<Utc>,
) -> VolumeResult<TrackedVolume> {
    volume.requested_bytes = Some(new_capacity_bytes);
    volume.annotations.insert(
        annotations::PREVIOUS_CAPACITY.to_string(),
        observed_capacity_bytes.to_string(),
    );
    record_scale(&mut volume, now)?;
    store.update_volume(&volume).await
}

/// Counters for one evaluation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleReport {
    pub evaluated: usize,
    pub submitted: usize,
    pub skipped: usize,
}

/// Periodic evaluator over the watch set.
#[derive(Clone)]
pub struct DecisionEvaluator {
    store: Arc<dyn VolumeStore>,
    usage: Arc<dyn UsageSource>,
    watch_set: WatchSet,
    queue: Arc<ResizeQueue>,
}

impl DecisionEvaluator {
    pub fn new(
        store: Arc<dyn VolumeStore>,
        usage: Arc<dyn UsageSource>,
        watch_set: WatchSet,
        queue: Arc<ResizeQueue>,
    ) -> Self {
        Self {
            store,
            usage,
            watch_set,
            queue,
        }
    }

    /// Evaluate every watched volume once and submit the resizes.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleReport> {
        let samples = self
            .usage
            .fetch_usage_samples()
            .await
            .map_err(|e| anyhow::anyhow!("could not fetch volume usage: {e}"))?;
        debug!(samples = samples.len(), "fetched usage samples");

        let mut report = CycleReport::default();
        let mut expandable: HashMap<String, Result<bool, String>> = HashMap::new();

        for volume in self.watch_set.snapshot().await {
            let id = volume.id();
            report.evaluated += 1;

            let decision = match self.storage_class_gate(&volume, &mut expandable).await {
                Err(reason) => ResizeDecision::Skip(reason),
                Ok(()) => evaluate_volume(&volume, samples.get(&id)),
            };

            match decision {
                ResizeDecision::Resize(request) => {
                    info!(
                        volume = %id,
                        from = request.volume.requested_bytes.unwrap_or(0),
                        to = request.new_capacity_bytes,
                        observed_capacity = request.observed_capacity_bytes,
                        "resize submitted"
                    );
                    self.queue.add(request);
                    report.submitted += 1;
                }
                ResizeDecision::Skip(reason) => {
                    log_skip(&id, &reason);
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }

    async fn storage_class_gate(
        &self,
        volume: &TrackedVolume,
        cache: &mut HashMap<String, Result<bool, String>>,
    ) -> Result<(), SkipReason> {
        let class = volume
            .storage_class
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or(SkipReason::NoStorageClass)?;

        if !cache.contains_key(class) {
            let lookup = self
                .store
                .is_expansion_allowed(class)
                .await
                .map_err(|e| e.to_string());
            cache.insert(class.to_string(), lookup);
        }

        match cache.get(class) {
            Some(Ok(true)) => Ok(()),
            Some(Ok(false)) => Err(SkipReason::ExpansionNotAllowed(class.to_string())),
            Some(Err(e)) => Err(SkipReason::StorageClassLookup(class.to_string(), e.clone())),
            None => Err(SkipReason::StorageClassLookup(
                class.to_string(),
                "lookup missing".to_string(),
            )),
        }
    }

    /// Run the evaluation loop until shutdown. Cycles never overlap; each
    /// is bounded by `timeout`.
    pub async fn run(
        &self,
        interval: Duration,
        timeout: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(
            interval_secs = interval.as_secs(),
            timeout_secs = timeout.as_secs(),
            "volume evaluator started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match tokio::time::timeout(timeout, self.run_cycle()).await {
                        Ok(Ok(report)) => debug!(
                            evaluated = report.evaluated,
                            submitted = report.submitted,
                            skipped = report.skipped,
                            "evaluation cycle complete"
                        ),
                        Ok(Err(e)) => error!(error = %e, "evaluation cycle aborted"),
                        Err(_) => warn!(
                            timeout_secs = timeout.as_secs(),
                            "evaluation cycle timed out"
                        ),
                    }
                }
                _ = shutdown.changed() => {
                    info!("volume evaluator shutting down");
                    break;
                }
            }
        }
    }
}

fn log_skip(id: &VolumeId, reason: &SkipReason) {
    match reason {
        SkipReason::AwaitingResize
        | SkipReason::ResizeInProgress
        | SkipReason::CeilingReached { .. }
        | SkipReason::NotProvisioned => info!(volume = %id, %reason, "resize skipped"),
        SkipReason::InvalidPreviousCapacity(_) => error!(volume = %id, %reason, "resize skipped"),
        r if r.needs_attention() => warn!(volume = %id, %reason, "resize skipped"),
        _ => debug!(volume = %id, %reason, "resize skipped"),
    }
}
