//! PersistentVolumeClaim ↔ TrackedVolume conversion.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::debug;

use warpgrid_volume::quantity::{format_quantity, parse_quantity};
use warpgrid_volume::{TrackedVolume, VolumeMode, VolumePhase};

const STORAGE: &str = "storage";
const RESIZE_CONDITIONS: [&str; 2] = ["Resizing", "FileSystemResizePending"];

fn storage_bytes(resources: Option<&BTreeMap<String, Quantity>>, what: &str, claim: &str) -> Option<u64> {
    let quantity = resources?.get(STORAGE)?;
    match parse_quantity(&quantity.0) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            debug!(claim, field = what, error = %e, "ignoring unparsable storage quantity");
            None
        }
    }
}

/// Snapshot a claim as seen by the controller.
pub fn tracked_from_claim(claim: &PersistentVolumeClaim) -> TrackedVolume {
    let meta = &claim.metadata;
    let name = meta.name.clone().unwrap_or_default();
    let spec = claim.spec.as_ref();
    let status = claim.status.as_ref();
    let resources = spec.and_then(|s| s.resources.as_ref());

    let phase = match status.and_then(|s| s.phase.as_deref()) {
        Some("Bound") => VolumePhase::Bound,
        Some("Lost") => VolumePhase::Lost,
        _ => VolumePhase::Pending,
    };
    let volume_mode = match spec.and_then(|s| s.volume_mode.as_deref()) {
        Some("Block") => Some(VolumeMode::Block),
        Some(_) => Some(VolumeMode::Filesystem),
        None => None,
    };
    let resize_pending = status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| RESIZE_CONDITIONS.contains(&c.type_.as_str()) && c.status == "True")
        });

    TrackedVolume {
        namespace: meta.namespace.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        storage_class: spec.and_then(|s| s.storage_class_name.clone()),
        requested_bytes: storage_bytes(resources.and_then(|r| r.requests.as_ref()), "requests", &name),
        limit_bytes: storage_bytes(resources.and_then(|r| r.limits.as_ref()), "limits", &name),
        capacity_bytes: storage_bytes(status.and_then(|s| s.capacity.as_ref()), "capacity", &name),
        phase,
        volume_mode,
        resize_pending,
        resource_version: meta.resource_version.clone(),
        name,
    }
}

/// Write the controller-owned fields of `volume` onto `claim`: annotations,
/// requested storage, and the resource version guarding the update.
pub fn apply_to_claim(volume: &TrackedVolume, claim: &mut PersistentVolumeClaim) {
    claim.metadata.annotations = if volume.annotations.is_empty() {
        None
    } else {
        Some(volume.annotations.clone())
    };
    claim.metadata.resource_version = volume.resource_version.clone();

    if let Some(bytes) = volume.requested_bytes {
        let spec = claim.spec.get_or_insert_with(Default::default);
        let resources = spec.resources.get_or_insert_with(Default::default);
        resources
            .requests
            .get_or_insert_with(BTreeMap::new)
            .insert(STORAGE.to_string(), Quantity(format_quantity(bytes)));
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimCondition, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus,
        VolumeResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use warpgrid_volume::annotations;
    use warpgrid_volume::quantity::GIB;

    fn quantities(value: &str) -> Option<BTreeMap<String, Quantity>> {
        Some(BTreeMap::from([(STORAGE.to_string(), Quantity(value.to_string()))]))
    }

    fn claim() -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some("42".to_string()),
                annotations: Some(BTreeMap::from([(
                    annotations::ENABLED.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: Some("fast".to_string()),
                resources: Some(VolumeResourceRequirements {
                    requests: quantities("10Gi"),
                    limits: quantities("50Gi"),
                }),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".to_string()),
                capacity: quantities("10Gi"),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn claim_to_tracked_volume() {
        let volume = tracked_from_claim(&claim());
        assert_eq!(volume.id().to_string(), "default/data");
        assert!(volume.autoscaling_enabled());
        assert_eq!(volume.storage_class.as_deref(), Some("fast"));
        assert_eq!(volume.requested_bytes, Some(10 * GIB));
        assert_eq!(volume.limit_bytes, Some(50 * GIB));
        assert_eq!(volume.capacity_bytes, Some(10 * GIB));
        assert_eq!(volume.phase, VolumePhase::Bound);
        assert_eq!(volume.volume_mode, None);
        assert!(volume.is_filesystem());
        assert!(!volume.resize_pending);
        assert_eq!(volume.resource_version.as_deref(), Some("42"));
    }

    #[test]
    fn block_mode_and_resize_condition() {
        let mut pvc = claim();
        pvc.spec.as_mut().unwrap().volume_mode = Some("Block".to_string());
        pvc.status.as_mut().unwrap().conditions = Some(vec![PersistentVolumeClaimCondition {
            type_: "FileSystemResizePending".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]);

        let volume = tracked_from_claim(&pvc);
        assert_eq!(volume.volume_mode, Some(VolumeMode::Block));
        assert!(!volume.is_filesystem());
        assert!(volume.resize_pending);
    }

    #[test]
    fn unparsable_quantity_is_absent() {
        let mut pvc = claim();
        pvc.spec.as_mut().unwrap().resources.as_mut().unwrap().requests = quantities("ten gigs");
        assert_eq!(tracked_from_claim(&pvc).requested_bytes, None);
    }

    #[test]
    fn apply_writes_request_and_annotations() {
        let mut pvc = claim();
        let mut volume = tracked_from_claim(&pvc);
        volume.requested_bytes = Some(12 * GIB);
        volume
            .annotations
            .insert(annotations::PREVIOUS_CAPACITY.to_string(), (10 * GIB).to_string());

        apply_to_claim(&volume, &mut pvc);

        let requests = pvc.spec.unwrap().resources.unwrap().requests.unwrap();
        assert_eq!(requests[STORAGE].0, "12Gi");
        let annotations_out = pvc.metadata.annotations.unwrap();
        assert_eq!(
            annotations_out[annotations::PREVIOUS_CAPACITY],
            (10 * GIB).to_string()
        );
        assert_eq!(pvc.metadata.resource_version.as_deref(), Some("42"));
    }
}
