//! Domain types for the volume autoscaler.
//!
//! A `TrackedVolume` is a flattened snapshot of a cluster volume claim:
//! just the fields the controller reads or writes. Adapters convert to and
//! from the cluster's native representation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::annotations;

/// Identity of a volume: namespace-scoped name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId {
    pub namespace: String,
    pub name: String,
}

impl VolumeId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ── Volume ────────────────────────────────────────────────────────

/// Binding phase of a volume claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VolumePhase {
    #[default]
    Pending,
    Bound,
    Lost,
}

/// How the volume is presented to workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeMode {
    Filesystem,
    Block,
}

/// Snapshot of a volume claim as seen by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TrackedVolume {
    pub namespace: String,
    pub name: String,
    /// Metadata annotations (configuration and persisted state).
    pub annotations: BTreeMap<String, String>,
    /// Storage class the claim was provisioned from.
    pub storage_class: Option<String>,
    /// Requested capacity in bytes (spec).
    pub requested_bytes: Option<u64>,
    /// Capacity limit in bytes (spec), used as the fallback ceiling.
    pub limit_bytes: Option<u64>,
    /// Capacity granted by the infrastructure in bytes (status).
    pub capacity_bytes: Option<u64>,
    pub phase: VolumePhase,
    /// `None` means the cluster default, which is filesystem.
    pub volume_mode: Option<VolumeMode>,
    /// The cluster reports a resize still being applied (`Resizing` or
    /// `FileSystemResizePending`).
    pub resize_pending: bool,
    /// Opaque version for conditional updates.
    pub resource_version: Option<String>,
}

impl TrackedVolume {
    pub fn id(&self) -> VolumeId {
        VolumeId::new(&self.namespace, &self.name)
    }

    /// Look up an annotation value.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Whether the enablement annotation is present and truthy.
    pub fn autoscaling_enabled(&self) -> bool {
        self.annotation(annotations::ENABLED)
            .is_some_and(annotations::is_enabled_value)
    }

    pub fn is_filesystem(&self) -> bool {
        !matches!(self.volume_mode, Some(VolumeMode::Block))
    }
}

// ── Usage ─────────────────────────────────────────────────────────

/// Utilization reported by the metrics backend for one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSample {
    pub used_bytes: u64,
    pub capacity_bytes: u64,
}

/// One batch of samples, fetched once per evaluation cycle.
pub type UsageSamples = HashMap<VolumeId, UsageSample>;

// ── Events ────────────────────────────────────────────────────────

/// A change notification from the cluster's volume feed.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(TrackedVolume),
    Updated {
        old: TrackedVolume,
        new: TrackedVolume,
    },
    Deleted(TrackedVolume),
}

impl WatchEvent {
    /// Identity the event applies to (the new identity for updates).
    pub fn id(&self) -> VolumeId {
        match self {
            WatchEvent::Added(v) | WatchEvent::Deleted(v) => v.id(),
            WatchEvent::Updated { new, .. } => new.id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_displays_namespaced() {
        assert_eq!(VolumeId::new("db", "pg-data").to_string(), "db/pg-data");
    }

    #[test]
    fn enablement_requires_truthy_value() {
        let mut volume = TrackedVolume {
            namespace: "default".into(),
            name: "data".into(),
            ..Default::default()
        };
        assert!(!volume.autoscaling_enabled());

        volume
            .annotations
            .insert(annotations::ENABLED.into(), "false".into());
        assert!(!volume.autoscaling_enabled());

        volume
            .annotations
            .insert(annotations::ENABLED.into(), "true".into());
        assert!(volume.autoscaling_enabled());
    }

    #[test]
    fn missing_volume_mode_is_filesystem() {
        let mut volume = TrackedVolume::default();
        assert!(volume.is_filesystem());
        volume.volume_mode = Some(VolumeMode::Block);
        assert!(!volume.is_filesystem());
    }
}
