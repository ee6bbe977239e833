//! Rate-limited resize queue.
//!
//! Work-queue semantics keyed by volume identity:
//!
//! - an identity waiting in the queue is coalesced (latest request wins);
//! - an identity handed out by `get` is not handed out again until `done`
//!   is called for it; re-adds in between are parked and released by `done`;
//! - `add_after` parks a request until its deadline; an identity is parked
//!   at most once, keeping the earliest deadline and the latest request;
//! - `add_rate_limited` derives the deadline from the slower of a
//!   per-identity exponential backoff (reset by `forget`) and an overall
//!   token bucket shared by all identities.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use warpgrid_volume::{TrackedVolume, VolumeId};

/// A resize the evaluator decided on, waiting to be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResizeRequest {
    /// Snapshot the decision was made from. May be stale by the time a
    /// worker picks it up.
    pub volume: TrackedVolume,
    /// Requested capacity to write, in bytes.
    pub new_capacity_bytes: u64,
    /// Sampled capacity at decision time, persisted as the
    /// previous-capacity marker.
    pub observed_capacity_bytes: u64,
}

impl ResizeRequest {
    pub fn id(&self) -> VolumeId {
        self.volume.id()
    }
}

/// Sustained rate of the overall bucket, in requests per second.
const OVERALL_QPS: f64 = 10.0;
/// Requests the overall bucket admits without delay.
const OVERALL_BURST: f64 = 100.0;

/// Token bucket shared by all identities. Reservations may drive the
/// balance negative; the deficit is the delay.
#[derive(Debug)]
struct TokenBucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(qps: f64, burst: f64) -> Self {
        Self {
            qps,
            burst,
            tokens: burst,
            last: Instant::now(),
        }
    }

    fn reserve(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        self.last = now;
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}

/// Per-identity exponential backoff (`base * 2^failures`, capped at `max`)
/// combined with the overall bucket; the longer delay wins.
#[derive(Debug)]
struct RateLimiter {
    base: Duration,
    max: Duration,
    failures: HashMap<VolumeId, u32>,
    bucket: TokenBucket,
}

impl RateLimiter {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
            bucket: TokenBucket::new(OVERALL_QPS, OVERALL_BURST),
        }
    }

    fn when(&mut self, id: &VolumeId) -> Duration {
        let failures = self.failures.entry(id.clone()).or_insert(0);
        let exp = (*failures).min(31);
        *failures = failures.saturating_add(1);
        let backoff = self
            .base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max);
        backoff.max(self.bucket.reserve(Instant::now()))
    }

    fn forget(&mut self, id: &VolumeId) {
        self.failures.remove(id);
    }

    fn requeues(&self, id: &VolumeId) -> u32 {
        self.failures.get(id).copied().unwrap_or(0)
    }
}

struct QueueState {
    /// Identities ready to hand out, in arrival order.
    ready: VecDeque<VolumeId>,
    /// Latest request per queued identity.
    items: HashMap<VolumeId, ResizeRequest>,
    /// Identities handed out and not yet `done`.
    processing: HashSet<VolumeId>,
    /// Parking deadlines. Entries whose deadline no longer matches
    /// `parked` are stale and skipped.
    delayed: BinaryHeap<Reverse<(Instant, VolumeId)>>,
    /// Earliest deadline and latest request per parked identity.
    parked: HashMap<VolumeId, (Instant, ResizeRequest)>,
    limiter: RateLimiter,
    shutting_down: bool,
}

impl QueueState {
    fn enqueue(&mut self, request: ResizeRequest) -> bool {
        let id = request.id();
        let already_waiting = self.items.insert(id.clone(), request).is_some();
        if already_waiting || self.processing.contains(&id) {
            return false;
        }
        self.ready.push_back(id);
        true
    }

    /// Move every due delayed request into the ready queue.
    fn promote_due(&mut self, now: Instant) -> bool {
        let mut promoted = false;
        while let Some(Reverse((deadline, _))) = self.delayed.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((deadline, id))) = self.delayed.pop() else {
                break;
            };
            let current = self.parked.get(&id).map(|(at, _)| *at);
            if current == Some(deadline) {
                if let Some((_, request)) = self.parked.remove(&id) {
                    promoted |= self.enqueue(request);
                }
            }
        }
        promoted
    }

    /// Park `request` until `deadline`. Returns whether the identity's
    /// deadline moved earlier (or it was not parked before).
    fn park(&mut self, request: ResizeRequest, deadline: Instant) -> bool {
        let id = request.id();
        match self.parked.get_mut(&id) {
            Some((at, parked)) => {
                *parked = request;
                if deadline >= *at {
                    return false;
                }
                *at = deadline;
            }
            None => {
                self.parked.insert(id.clone(), (deadline, request));
            }
        }
        self.delayed.push(Reverse((deadline, id)));
        true
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse((deadline, _))| *deadline)
    }
}

/// Queue of resize requests shared by the evaluator, workers, and the
/// dispatcher.
pub struct ResizeQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ResizeQueue {
    pub fn new(rate_limit_base: Duration, rate_limit_max: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                items: HashMap::new(),
                processing: HashSet::new(),
                delayed: BinaryHeap::new(),
                parked: HashMap::new(),
                limiter: RateLimiter::new(rate_limit_base, rate_limit_max),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit a request for immediate processing.
    pub fn add(&self, request: ResizeRequest) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if state.enqueue(request) {
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Submit a request that becomes ready after `delay`.
    pub fn add_after(&self, request: ResizeRequest, delay: Duration) {
        if delay.is_zero() {
            self.add(request);
            return;
        }
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        let id = request.id();
        let deadline = Instant::now() + delay;
        if !state.park(request, deadline) {
            return;
        }
        debug!(volume = %id, delay_ms = delay.as_millis() as u64, "resize parked");
        drop(state);
        // Wake the consumer so it re-arms its timer for the new deadline.
        self.notify.notify_one();
    }

    /// Submit a request after the identity's current backoff delay.
    pub fn add_rate_limited(&self, request: ResizeRequest) {
        let delay = self.lock().limiter.when(&request.id());
        self.add_after(request, delay);
    }

    /// Wait for the next ready request. Returns `None` after shutdown.
    pub async fn get(&self) -> Option<ResizeRequest> {
        loop {
            let deadline = {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                state.promote_due(Instant::now());
                while let Some(id) = state.ready.pop_front() {
                    if let Some(request) = state.items.remove(&id) {
                        state.processing.insert(id);
                        return Some(request);
                    }
                }
                state.next_deadline()
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Mark a handed-out identity as finished. A request re-added while it
    /// was out becomes ready again.
    pub fn done(&self, id: &VolumeId) {
        let mut state = self.lock();
        state.processing.remove(id);
        if state.items.contains_key(id) && !state.ready.contains(id) {
            state.ready.push_back(id.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Reset the backoff bookkeeping for `id`.
    pub fn forget(&self, id: &VolumeId) {
        self.lock().limiter.forget(id);
    }

    /// Drop every waiting or parked request for `id`.
    pub fn discard(&self, id: &VolumeId) {
        let mut state = self.lock();
        state.items.remove(id);
        state.ready.retain(|queued| queued != id);
        // Its heap entry goes stale and is skipped when it comes due.
        state.parked.remove(id);
    }

    /// How many times `id` has been rate-limited since the last `forget`.
    pub fn num_requeues(&self, id: &VolumeId) -> u32 {
        self.lock().limiter.requeues(id)
    }

    /// Requests waiting or parked.
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.items.len() + state.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a request for `id` is waiting or parked.
    pub fn contains(&self, id: &VolumeId) -> bool {
        let state = self.lock();
        state.items.contains_key(id) || state.parked.contains_key(id)
    }

    /// Stop handing out requests and wake all waiters.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, new_capacity: u64) -> ResizeRequest {
        ResizeRequest {
            volume: TrackedVolume {
                namespace: "default".to_string(),
                name: name.to_string(),
                ..Default::default()
            },
            new_capacity_bytes: new_capacity,
            observed_capacity_bytes: 10,
        }
    }

    fn queue() -> ResizeQueue {
        ResizeQueue::new(Duration::from_millis(5), Duration::from_secs(1000))
    }

    #[tokio::test]
    async fn fifo_across_identities() {
        let q = queue();
        q.add(request("a", 1));
        q.add(request("b", 1));

        assert_eq!(q.get().await.unwrap().volume.name, "a");
        assert_eq!(q.get().await.unwrap().volume.name, "b");
    }

    #[tokio::test]
    async fn waiting_requests_coalesce_latest_wins() {
        let q = queue();
        q.add(request("a", 1));
        q.add(request("a", 2));
        assert_eq!(q.len(), 1);

        let got = q.get().await.unwrap();
        assert_eq!(got.new_capacity_bytes, 2);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn readd_while_processing_waits_for_done() {
        let q = queue();
        q.add(request("a", 1));
        let first = q.get().await.unwrap();

        q.add(request("a", 2));
        let pending = tokio::time::timeout(Duration::from_millis(20), q.get()).await;
        assert!(pending.is_err(), "identity must not be handed out twice");

        q.done(&first.id());
        let second = q.get().await.unwrap();
        assert_eq!(second.new_capacity_bytes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_delays_delivery() {
        let q = queue();
        let start = Instant::now();
        q.add_after(request("a", 1), Duration::from_secs(10));

        assert!(q.contains(&VolumeId::new("default", "a")));
        let got = q.get().await.unwrap();
        assert_eq!(got.volume.name, "a");
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_add_after_parks_once_with_earliest_deadline() {
        let q = queue();
        let start = Instant::now();
        for secs in (1..=10).rev() {
            q.add_after(request("a", secs), Duration::from_secs(secs * 10));
        }
        assert_eq!(q.len(), 1);

        let got = q.get().await.unwrap();
        assert_eq!(got.new_capacity_bytes, 1);
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(20));
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn later_add_after_keeps_deadline_but_takes_latest_request() {
        let q = queue();
        let start = Instant::now();
        q.add_after(request("a", 1), Duration::from_secs(5));
        q.add_after(request("a", 2), Duration::from_secs(60));
        assert_eq!(q.len(), 1);

        let got = q.get().await.unwrap();
        assert_eq!(got.new_capacity_bytes, 2);
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn overall_bucket_throttles_bursts_across_identities() {
        let q = queue();
        let mut state = q.lock();
        for i in 0..100 {
            let id = VolumeId::new("default", format!("v{i}"));
            assert_eq!(state.limiter.when(&id), Duration::from_millis(5));
        }
        let delay = state.limiter.when(&VolumeId::new("default", "v100"));
        assert!(delay >= Duration::from_millis(99), "got {delay:?}");
        assert!(delay <= Duration::from_millis(101), "got {delay:?}");
    }

    #[test]
    fn rate_limiter_backs_off_exponentially_and_forgets() {
        let q = queue();
        let id = VolumeId::new("default", "a");
        let mut state = q.lock();
        assert_eq!(state.limiter.when(&id), Duration::from_millis(5));
        assert_eq!(state.limiter.when(&id), Duration::from_millis(10));
        assert_eq!(state.limiter.when(&id), Duration::from_millis(20));
        assert_eq!(state.limiter.requeues(&id), 3);

        for _ in 0..40 {
            state.limiter.when(&id);
        }
        assert_eq!(state.limiter.when(&id), Duration::from_secs(1000));

        state.limiter.forget(&id);
        assert_eq!(state.limiter.requeues(&id), 0);
        assert_eq!(state.limiter.when(&id), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn add_rate_limited_counts_requeues() {
        let q = queue();
        let id = VolumeId::new("default", "a");
        q.add_rate_limited(request("a", 1));
        assert_eq!(q.num_requeues(&id), 1);

        let got = q.get().await.unwrap();
        q.done(&got.id());
        q.forget(&id);
        assert_eq!(q.num_requeues(&id), 0);
    }

    #[tokio::test]
    async fn discard_drops_waiting_and_parked() {
        let q = queue();
        q.add(request("a", 1));
        q.add_after(request("a", 2), Duration::from_secs(60));
        q.add(request("b", 1));

        q.discard(&VolumeId::new("default", "a"));
        assert!(!q.contains(&VolumeId::new("default", "a")));
        assert_eq!(q.get().await.unwrap().volume.name, "b");
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_consumer() {
        let q = std::sync::Arc::new(queue());
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shutdown();

        let got = consumer.await.unwrap();
        assert!(got.is_none());
        q.add(request("a", 1));
        assert!(q.is_empty());
    }
}
