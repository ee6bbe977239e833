//! warpgrid-volscale — utilization-driven volume autoscaling.
//!
//! Watches volume claims that opt in via annotations, compares their
//! reported usage against a threshold every polling interval, and grows
//! the requested capacity of volumes that cross it.
//!
//! # Resize Algorithm
//!
//! ```text
//! threshold = pct(threshold annotation, 80%) * sampled capacity
//! increase  = pct(increase annotation, 20%)  * requested capacity
//!
//! if previous-capacity marker == sampled capacity:
//!     wait  // last grow not accepted yet
//! if requested >= ceiling:
//!     skip  // limit reached
//! if used >= threshold:
//!     ResizeTo(min(ceil_gib(requested + increase), ceiling))
//! ```
//!
//! # Architecture
//!
//! ```text
//! event feed ──► WatchSetSynchronizer ──► WatchSet
//!                                           │
//!            ticker ──► DecisionEvaluator ◄─┘ + UsageSource
//!                              │
//!                              ▼
//!                         ResizeQueue ──► dispatcher ──► ResizeExecutor (≤ N)
//!                                                           │  InFlight claim
//!                                                           ▼
//!                                                      VolumeStore
//! ```
//!
//! A successful resize removes the volume from the watch set: monitoring
//! resumes only after the enablement annotation is toggled.

pub mod config;
pub mod controller;
pub mod evaluator;
pub mod executor;
pub mod in_flight;
pub mod queue;
pub mod sync;
pub mod watch_set;

pub use config::ControllerConfig;
pub use controller::VolumeAutoscaler;
pub use evaluator::{DecisionEvaluator, ResizeDecision, SkipReason};
pub use executor::{ResizeExecutor, ResizeOutcome};
pub use in_flight::{ClaimGuard, InFlight};
pub use queue::{ResizeQueue, ResizeRequest};
pub use sync::WatchSetSynchronizer;
pub use watch_set::WatchSet;
