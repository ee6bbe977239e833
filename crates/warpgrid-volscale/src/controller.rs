//! Volume autoscaler — wires the synchronizer, evaluator, and a bounded
//! pool of resize workers around one shared watch set and queue.
//!
//! `run` does, in order:
//! 1. Bootstraps the watch set from a full listing (fatal on failure)
//! 2. Starts the synchronizer on the event feed
//! 3. Starts the evaluator ticker
//! 4. Dispatches queued resizes to at most `max_concurrent_resizes` workers
//! 5. On shutdown, stops dispatching and waits for running workers

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use warpgrid_volume::{UsageSource, VolumeStore, WatchEvent};

use crate::config::ControllerConfig;
use crate::evaluator::DecisionEvaluator;
use crate::executor::{ResizeExecutor, ResizeOutcome};
use crate::in_flight::InFlight;
use crate::queue::ResizeQueue;
use crate::sync::WatchSetSynchronizer;
use crate::watch_set::WatchSet;

/// The assembled controller. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct VolumeAutoscaler {
    config: ControllerConfig,
    store: Arc<dyn VolumeStore>,
    usage: Arc<dyn UsageSource>,
    watch_set: WatchSet,
    in_flight: InFlight,
    queue: Arc<ResizeQueue>,
}

impl VolumeAutoscaler {
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn VolumeStore>,
        usage: Arc<dyn UsageSource>,
    ) -> Self {
        let queue = Arc::new(ResizeQueue::new(
            config.rate_limit_base,
            config.rate_limit_max,
        ));
        Self {
            config,
            store,
            usage,
            watch_set: WatchSet::new(),
            in_flight: InFlight::new(),
            queue,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn watch_set(&self) -> &WatchSet {
        &self.watch_set
    }

    pub fn queue(&self) -> &Arc<ResizeQueue> {
        &self.queue
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    pub fn synchronizer(&self) -> WatchSetSynchronizer {
        WatchSetSynchronizer::new(
            self.store.clone(),
            self.watch_set.clone(),
            self.in_flight.clone(),
            self.queue.clone(),
        )
    }

    pub fn evaluator(&self) -> DecisionEvaluator {
        DecisionEvaluator::new(
            self.store.clone(),
            self.usage.clone(),
            self.watch_set.clone(),
            self.queue.clone(),
        )
    }

    pub fn executor(&self) -> ResizeExecutor {
        ResizeExecutor::new(
            self.store.clone(),
            self.queue.clone(),
            self.watch_set.clone(),
            self.in_flight.clone(),
            self.config.retry_after,
        )
    }

    /// Run the controller until `shutdown` flips or its sender is dropped.
    pub async fn run(
        &self,
        events: mpsc::UnboundedReceiver<WatchEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(
            polling_interval_secs = self.config.polling_interval.as_secs(),
            retry_after_secs = self.config.retry_after.as_secs(),
            max_concurrent_resizes = self.config.max_concurrent_resizes,
            "volume autoscaler starting"
        );
        warn!(
            "autoscaler state lives in volume annotations and is updated read-modify-write; \
             concurrent edits to those annotations surface as failed resize attempts"
        );

        // ── Bootstrap ────────────────────────────────────────────────
        let synchronizer = self.synchronizer();
        synchronizer
            .bootstrap()
            .await
            .context("failed to list volumes for bootstrap")?;

        // ── Background tasks ─────────────────────────────────────────
        let sync_shutdown = shutdown.clone();
        let sync_handle = tokio::spawn(async move {
            synchronizer.run(events, sync_shutdown).await;
        });

        let evaluator = self.evaluator();
        let eval_shutdown = shutdown.clone();
        let interval = self.config.polling_interval;
        let timeout = self.config.reconcile_timeout;
        let eval_handle = tokio::spawn(async move {
            evaluator.run(interval, timeout, eval_shutdown).await;
        });

        // ── Dispatch until shutdown ──────────────────────────────────
        self.dispatch(shutdown).await;

        let _ = sync_handle.await;
        let _ = eval_handle.await;
        info!("volume autoscaler stopped");
        Ok(())
    }

    async fn dispatch(&self, mut shutdown: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_resizes.max(1)));
        let executor = self.executor();
        let mut workers = JoinSet::new();

        loop {
            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };
            let request = tokio::select! {
                request = self.queue.get() => match request {
                    Some(request) => request,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            self.queue.done(&request.id());

            let executor = executor.clone();
            workers.spawn(async move {
                let id = request.id();
                let outcome = executor.process(request).await;
                drop(permit);
                debug!(volume = %id, ?outcome, "resize worker finished");
                outcome
            });

            while let Some(finished) = workers.try_join_next() {
                log_worker_result(finished);
            }
        }

        self.queue.shutdown();
        if !workers.is_empty() {
            info!(running = workers.len(), "waiting for resize workers");
        }
        while let Some(finished) = workers.join_next().await {
            log_worker_result(finished);
        }
    }
}

fn log_worker_result(result: Result<ResizeOutcome, tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "resize worker panicked");
    }
}
