//! `VolumeStore` backed by the Kubernetes API.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{ListParams, PostParams};
use kube::{Api, Client};
use tracing::debug;

use warpgrid_volume::{TrackedVolume, VolumeError, VolumeId, VolumeResult, VolumeStore};

use crate::convert::{apply_to_claim, tracked_from_claim};

/// Map a kube client error onto the volume error model.
pub fn map_kube_error(subject: &str, err: kube::Error) -> VolumeError {
    match err {
        kube::Error::Api(response) if response.code == 404 => VolumeError::NotFound(subject.to_string()),
        kube::Error::Api(response) if response.code == 409 => {
            VolumeError::Conflict(subject.to_string(), response.message)
        }
        other => VolumeError::Api(format!("{subject}: {other}")),
    }
}

#[derive(Clone)]
pub struct KubeVolumeStore {
    client: Client,
}

impl KubeVolumeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl VolumeStore for KubeVolumeStore {
    async fn list_volumes(&self) -> VolumeResult<Vec<TrackedVolume>> {
        let claims: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        let list = claims
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_error("persistentvolumeclaims", e))?;
        debug!(count = list.items.len(), "listed volume claims");
        Ok(list.items.iter().map(tracked_from_claim).collect())
    }

    async fn get_volume(&self, id: &VolumeId) -> VolumeResult<TrackedVolume> {
        let claim = self
            .claims(&id.namespace)
            .get(&id.name)
            .await
            .map_err(|e| map_kube_error(&id.to_string(), e))?;
        Ok(tracked_from_claim(&claim))
    }

    async fn update_volume(&self, volume: &TrackedVolume) -> VolumeResult<TrackedVolume> {
        let id = volume.id();
        let api = self.claims(&id.namespace);
        let mut claim = api
            .get(&id.name)
            .await
            .map_err(|e| map_kube_error(&id.to_string(), e))?;

        // The snapshot's resource version rides along, so the replace is
        // rejected if the claim changed since `volume` was read.
        apply_to_claim(volume, &mut claim);
        let updated = api
            .replace(&id.name, &PostParams::default(), &claim)
            .await
            .map_err(|e| map_kube_error(&id.to_string(), e))?;
        debug!(volume = %id, version = ?updated.metadata.resource_version, "volume claim updated");
        Ok(tracked_from_claim(&updated))
    }

    async fn is_expansion_allowed(&self, storage_class: &str) -> VolumeResult<bool> {
        let classes: Api<StorageClass> = Api::all(self.client.clone());
        let class = classes
            .get(storage_class)
            .await
            .map_err(|e| map_kube_error(&format!("storageclass {storage_class}"), e))?;
        Ok(class.allow_volume_expansion.unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn status_codes_map_to_volume_errors() {
        assert!(map_kube_error("default/data", api_error(404)).is_not_found());
        assert!(matches!(
            map_kube_error("default/data", api_error(409)),
            VolumeError::Conflict(..)
        ));
        assert!(matches!(
            map_kube_error("default/data", api_error(500)),
            VolumeError::Api(_)
        ));
    }
}
