//! Volume-device-set expansion.
//!
//! Each device set of count N expands into N indexed claim groups. Claim
//! identity is `<set>-<template>-<index>`, stored as a label; the actual
//! claim name gets a generated suffix so rebuilt claims never collide. The
//! identity label is what preserves daemon identity across reconciles.

use anyhow::Result;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::osd::resolver::PvcTarget;
use crate::osd::{cluster_owner_reference, osd_err};
use crate::store::ObjectStore;
use reef_core::crd::{ReefCluster, RequiredMetadata, StorageClassDeviceSet, VolumeClaimTemplate};
use reef_core::labels::{canonical_labels, LABEL_KEY_DEVICE_SET, LABEL_KEY_DEVICE_SET_PVC_ID, LABEL_KEY_SET_INDEX};
use reef_core::OsdError;

/// The claim template name backing the daemon's data device.
pub const DATA_TEMPLATE: &str = "data";
/// The claim template name backing the daemon's metadata device.
pub const METADATA_TEMPLATE: &str = "metadata";
/// The claim template name backing the daemon's WAL device.
pub const WAL_TEMPLATE: &str = "wal";

/// Expand every declared device set into PVC-backed provisioning targets.
///
/// Problems local to one set or one index are pushed into `errors` and the
/// rest of the expansion continues.
pub async fn prepare_device_sets(cluster: &ReefCluster, store: &dyn ObjectStore, errors: &mut Vec<anyhow::Error>) -> Vec<PvcTarget> {
    let mut targets = Vec::new();
    for set in &cluster.spec.storage.storage_class_device_sets {
        if set.template(DATA_TEMPLATE).is_none() {
            errors.push(osd_err(OsdError::TargetFailed {
                target: set.name.clone(),
                message: "device set declares no data claim template".into(),
            }));
            continue;
        }
        for index in 0..set.count {
            match prepare_set_index(cluster, store, set, index).await {
                Ok(target) => targets.push(target),
                Err(err) => errors.push(err.context(format!("error preparing device set {} index {}", set.name, index))),
            }
        }
    }
    targets
}

/// Ensure the claims for one device-set index exist, returning its target.
async fn prepare_set_index(cluster: &ReefCluster, store: &dyn ObjectStore, set: &StorageClassDeviceSet, index: u32) -> Result<PvcTarget> {
    let mut data_claim = None;
    let mut metadata_claim = None;
    let mut wal_claim = None;
    for template in &set.volume_claim_templates {
        let claim = ensure_claim(cluster, store, set, template, index).await?;
        match template.name.as_str() {
            DATA_TEMPLATE => data_claim = Some(claim),
            METADATA_TEMPLATE => metadata_claim = Some(claim),
            WAL_TEMPLATE => wal_claim = Some(claim),
            other => tracing::warn!(template = other, set = %set.name, "ignoring unrecognized claim template"),
        }
    }
    let data_claim = data_claim.ok_or_else(|| {
        osd_err(OsdError::TargetFailed {
            target: set.name.clone(),
            message: "device set declares no data claim template".into(),
        })
    })?;
    Ok(PvcTarget {
        device_set: set.name.clone(),
        data_claim,
        metadata_claim,
        wal_claim,
        portable: set.portable,
        encrypted: set.encrypted,
        device_class: set.device_class.clone(),
        placement: set.placement.clone(),
        resources: set.resources.clone(),
    })
}

/// Look up the claim for `<set>-<template>-<index>`, creating it if absent.
///
/// Returns the claim's actual (generated) name. More than one claim bearing
/// the identity label is a fatal error for the index.
async fn ensure_claim(
    cluster: &ReefCluster, store: &dyn ObjectStore, set: &StorageClassDeviceSet, template: &VolumeClaimTemplate, index: u32,
) -> Result<String> {
    let identity = claim_identity(&set.name, &template.name, index);
    let selector = format!("{}={}", LABEL_KEY_DEVICE_SET_PVC_ID, identity);
    let mut existing = store.list_claims(&selector).await?;
    match existing.len() {
        0 => {
            let claim = build_claim(cluster, set, template, index, &identity);
            let created = store.create_claim(claim).await?;
            let name = created.metadata.name.unwrap_or_default();
            tracing::info!(claim = %name, identity = %identity, "created volume claim for device set");
            Ok(name)
        }
        1 => Ok(existing.remove(0).metadata.name.unwrap_or_default()),
        n => Err(osd_err(OsdError::TargetFailed {
            target: identity.clone(),
            message: format!("{} claims match the identity label, expected exactly one", n),
        })),
    }
}

/// The stable identity of one claim within a device set.
pub fn claim_identity(set: &str, template: &str, index: u32) -> String {
    format!("{}-{}-{}", set, template, index)
}

/// Build a new claim from its template.
fn build_claim(cluster: &ReefCluster, set: &StorageClassDeviceSet, template: &VolumeClaimTemplate, index: u32, identity: &str) -> PersistentVolumeClaim {
    let mut labels = canonical_labels(cluster.name());
    labels.insert(LABEL_KEY_DEVICE_SET.into(), set.name.clone());
    labels.insert(LABEL_KEY_SET_INDEX.into(), index.to_string());
    labels.insert(LABEL_KEY_DEVICE_SET_PVC_ID.into(), identity.to_string());

    let access_modes = if template.access_modes.is_empty() {
        vec!["ReadWriteOnce".to_string()]
    } else {
        template.access_modes.clone()
    };
    let mut requests = std::collections::BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(template.storage.clone()));

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", identity)),
            namespace: Some(cluster.namespace().to_string()),
            labels: Some(labels),
            owner_references: Some(vec![cluster_owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(access_modes),
            storage_class_name: template.storage_class_name.clone(),
            volume_mode: Some("Block".to_string()),
            resources: Some(k8s_openapi::api::core::v1::ResourceRequirements {
                requests: Some(requests),
                limits: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
