//! Controller tuning knobs, fixed for the process lifetime.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime configuration for the volume autoscaler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// How often the evaluator runs.
    pub polling_interval: Duration,
    /// Upper bound on one evaluation cycle's collaborator calls.
    pub reconcile_timeout: Duration,
    /// Minimum wait after a failed resize before retrying.
    pub retry_after: Duration,
    /// Maximum number of resize workers running at once.
    pub max_concurrent_resizes: usize,
    /// First per-volume redelivery delay after a failure.
    pub rate_limit_base: Duration,
    /// Cap on the per-volume redelivery delay.
    pub rate_limit_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(30),
            reconcile_timeout: Duration::from_secs(60),
            retry_after: Duration::from_secs(300),
            max_concurrent_resizes: 8,
            rate_limit_base: Duration::from_millis(5),
            rate_limit_max: Duration::from_secs(1000),
        }
    }
}
