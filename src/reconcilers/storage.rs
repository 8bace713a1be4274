use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use tracing::{debug, info};

use super::quantity::parse_quantity;
use super::workload::pvc_name;
use super::{object_meta, resource_labels};
use crate::orchestrator::{object_name, Orchestrator};
use crate::types::Service;
use crate::Result;

const DEFAULT_STORAGE_CLASS: &str = "standard";
const DEFAULT_ACCESS_MODE: &str = "ReadWriteOnce";

/// One claim per declared volume
pub fn build_pvcs(service: &Service, namespace: &str) -> Result<Vec<PersistentVolumeClaim>> {
    service
        .volumes
        .iter()
        .map(|vol| {
            let size = parse_quantity(&format!("volume {} size", vol.name), &vol.size)?;
            let non_empty = |v: &Option<String>, default: &str| {
                v.as_deref()
                    .filter(|s| !s.is_empty())
                    .unwrap_or(default)
                    .to_string()
            };

            let mut metadata = object_meta(
                pvc_name(&service.name, &vol.name),
                namespace,
                resource_labels(service),
            );
            metadata.annotations = Some(BTreeMap::from([
                ("enclii.dev/volume-name".to_string(), vol.name.clone()),
                ("enclii.dev/mount-path".to_string(), vol.mount_path.clone()),
            ]));

            Ok(PersistentVolumeClaim {
                metadata,
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec![non_empty(&vol.access_mode, DEFAULT_ACCESS_MODE)]),
                    storage_class_name: Some(non_empty(
                        &vol.storage_class_name,
                        DEFAULT_STORAGE_CLASS,
                    )),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([("storage".to_string(), size)])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            })
        })
        .collect()
}

/// Creates the claim, or refreshes only its labels and annotations when it exists.
pub async fn apply_pvc(
    orchestrator: &dyn Orchestrator,
    namespace: &str,
    mut pvc: PersistentVolumeClaim,
) -> Result<()> {
    let name = object_name(&pvc.metadata)?.to_string();
    if orchestrator.get_pvc(namespace, &name).await?.is_some() {
        debug!(pvc = %name, namespace, "Claim exists, updating metadata only");
        pvc.spec = None;
        orchestrator.apply_pvc(namespace, pvc).await?;
        info!(pvc = %name, namespace, "Updated existing PVC");
    } else {
        orchestrator.apply_pvc(namespace, pvc).await?;
        info!(pvc = %name, namespace, "Created new PVC");
    }
    Ok(())
}
