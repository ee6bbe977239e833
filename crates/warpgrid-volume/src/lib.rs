//! warpgrid-volume — volume model for the WarpGrid volume autoscaler.
//!
//! Defines the tracked volume snapshot, the annotations that configure and
//! persist autoscaler state on each volume, and the collaborator traits the
//! controller uses to reach the cluster and the metrics backend.
//!
//! # Architecture
//!
//! The autoscaler keeps no side database. Everything it needs to survive a
//! restart lives in annotations on the volume itself:
//!
//! ```text
//! volscale.warpgrid.dev/enabled            "true" | "enabled"
//! volscale.warpgrid.dev/threshold          "80%"
//! volscale.warpgrid.dev/increase           "20%"
//! volscale.warpgrid.dev/ceiling            "500Gi"
//! volscale.warpgrid.dev/previous-capacity  "107374182400"
//! volscale.warpgrid.dev/status             {"lastScaleTime": ..., "lastFailedAttempt": ...}
//! ```
//!
//! `MemoryVolumeStore` and `MemoryUsageSource` are `Clone` + `Send` + `Sync`
//! in-memory backends used by tests and dry runs.

pub mod annotations;
pub mod error;
pub mod quantity;
pub mod status;
pub mod store;
pub mod types;

pub use error::{VolumeError, VolumeResult};
pub use status::AutoscalerStatus;
pub use store::{MemoryUsageSource, MemoryVolumeStore, UsageSource, VolumeStore};
pub use types::*;
