//! Error types for the volume model and its collaborators.

use thiserror::Error;

/// Result type alias for volume operations.
pub type VolumeResult<T> = Result<T, VolumeError>;

/// Errors raised while parsing volume configuration or talking to
/// the cluster and metrics collaborators.
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("invalid quantity {0:?}: {1}")]
    InvalidQuantity(String, String),

    #[error("invalid percentage {0:?}: {1}")]
    InvalidPercentage(String, String),

    #[error("status annotation error: {0}")]
    Status(String),

    #[error("volume not found: {0}")]
    NotFound(String),

    #[error("conflict updating {0}: {1}")]
    Conflict(String, String),

    #[error("cluster api error: {0}")]
    Api(String),

    #[error("metrics backend error: {0}")]
    Metrics(String),
}

impl VolumeError {
    /// Whether the error means the object no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, VolumeError::NotFound(_))
    }
}
