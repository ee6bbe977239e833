//! warpgrid-volmetrics — volume usage sampling for the volume autoscaler.
//!
//! Provides `UsageSource` implementations backed by external metrics
//! systems. The backend is picked by name at startup:
//!
//! ```text
//! --metrics-client prometheus --metrics-client-url http://prometheus:9090
//! ```

pub mod prometheus;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use warpgrid_volume::{UsageSource, VolumeError, VolumeResult};

pub use prometheus::PrometheusUsageSource;

/// Supported metrics backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricsBackend {
    #[default]
    Prometheus,
}

impl fmt::Display for MetricsBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricsBackend::Prometheus => write!(f, "prometheus"),
        }
    }
}

impl FromStr for MetricsBackend {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prometheus" => Ok(MetricsBackend::Prometheus),
            other => Err(VolumeError::Metrics(format!("unknown metrics client: {other}"))),
        }
    }
}

/// Build the usage source for `backend` at `url`.
pub fn usage_source(
    backend: MetricsBackend,
    url: &str,
    timeout: Duration,
) -> VolumeResult<Arc<dyn UsageSource>> {
    match backend {
        MetricsBackend::Prometheus => {
            let source = PrometheusUsageSource::new(url, timeout)?;
            info!(%backend, url, address = source.address(), "metrics client ready");
            let source: Arc<dyn UsageSource> = Arc::new(source);
            Ok(source)
        }
    }
}
