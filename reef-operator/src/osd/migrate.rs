//! Migration and replacement planning.
//!
//! Changing an OSD's backend store or its encryption setting cannot happen
//! in place: the daemon is torn down and its device wiped and re-prepared.
//! The planner picks at most one such rebuild per pass, gated on clean
//! placement groups, and records it durably so an interrupted rebuild is
//! resumed instead of a second one starting.

use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use maplit::btreemap;
use serde::{Deserialize, Serialize};

use crate::dataplane::DataPlane;
use crate::osd::{cluster_owner_reference, osd_deployment_name, osd_err, workload};
use crate::store::ObjectStore;
use reef_core::crd::{ReefCluster, RequiredMetadata};
use reef_core::labels::canonical_labels;
use reef_core::OsdError;

/// Record holding the id of the last OSD sent into a rebuild.
pub const MIGRATION_RECORD: &str = "osd-migration-config";
/// Data key of [`MIGRATION_RECORD`].
pub const MIGRATION_RECORD_KEY: &str = "osdID";
/// Record holding the in-flight replacement, the single-rebuild lock.
pub const REPLACE_RECORD: &str = "osd-replace-config";
/// Data key of [`REPLACE_RECORD`].
pub const REPLACE_RECORD_KEY: &str = "config";

/// The OSD currently being torn down and rebuilt.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OsdReplaceInfo {
    /// The id of the OSD being rebuilt.
    pub id: i32,
    /// Path of the backing block device.
    #[serde(default)]
    pub path: String,
    /// The OSD's failure domain: node name, or claim name for PVC-backed OSDs.
    #[serde(default)]
    pub node: String,
}

/// Plans at most one destructive OSD rebuild per reconcile pass.
pub struct Planner {
    store: Arc<dyn ObjectStore>,
    dataplane: Arc<dyn DataPlane>,
}

impl Planner {
    /// Create a new instance.
    pub fn new(store: Arc<dyn ObjectStore>, dataplane: Arc<dyn DataPlane>) -> Self {
        Self { store, dataplane }
    }

    /// Plan the pass's rebuild, returning the replacement in flight, if any.
    ///
    /// The returned info is handed to the provisioner so the prepare task on
    /// the affected target wipes and rebuilds the named OSD.
    #[tracing::instrument(level = "debug", skip_all, fields(cluster = cluster.name()))]
    pub async fn plan(&self, cluster: &ReefCluster, existing: &[Deployment]) -> Result<Option<OsdReplaceInfo>> {
        // An unfinished rebuild blocks any new pick. It is finished once the
        // workload for its id exists again.
        if let Some(in_flight) = self.load_replace_record().await? {
            if self.store.get_deployment(&osd_deployment_name(in_flight.id)).await?.is_some() {
                tracing::info!(osd = in_flight.id, "rebuild complete, clearing the replacement record");
                self.store.delete_config_map(REPLACE_RECORD).await?;
            } else {
                tracing::info!(osd = in_flight.id, "rebuild still in flight, deferring further migration picks");
                return Ok(Some(in_flight));
            }
        }

        if !migration_requested(cluster) {
            return Ok(None);
        }
        let candidates = self.collect_candidates(cluster, existing)?;
        let candidate = match candidates.into_iter().min_by_key(|info| info.id) {
            Some(candidate) => candidate,
            None => return Ok(None),
        };

        // A rebuild drops redundancy; only start one from a clean state.
        if !self.dataplane.pgs_clean().await.context("error checking placement group health")? {
            return Err(osd_err(OsdError::SafetyGate(
                "placement groups are not clean, refusing to start an OSD rebuild".into(),
            )));
        }

        tracing::info!(osd = candidate.id, node = %candidate.node, "starting OSD rebuild");
        self.save_replace_record(cluster, &candidate).await?;
        self.save_migration_record(cluster, candidate.id).await?;
        self.store.delete_deployment(&osd_deployment_name(candidate.id)).await?;
        Ok(Some(candidate))
    }

    /// Collect every OSD whose on-disk state mismatches the declared intent.
    fn collect_candidates(&self, cluster: &ReefCluster, existing: &[Deployment]) -> Result<Vec<OsdReplaceInfo>> {
        let storage = &cluster.spec.storage;
        let desired_store = storage.store_type();
        let mut candidates = Vec::new();
        for deployment in existing {
            let labels = match workload::extract_osd_labels(deployment) {
                Ok(labels) => labels,
                Err(_) => continue,
            };
            let mut mismatch = false;
            if !labels.store_type.is_empty() && labels.store_type != desired_store {
                tracing::info!(
                    osd = labels.id,
                    current = %labels.store_type,
                    desired = %desired_store,
                    "OSD requires a rebuild for its backend store",
                );
                mismatch = true;
            }
            if let Some(set_name) = &labels.device_set {
                let desired_encrypted = storage
                    .storage_class_device_sets
                    .iter()
                    .find(|set| &set.name == set_name)
                    .map(|set| set.encrypted)
                    .unwrap_or(labels.encrypted);
                if desired_encrypted != labels.encrypted {
                    tracing::info!(
                        osd = labels.id,
                        current = labels.encrypted,
                        desired = desired_encrypted,
                        "OSD requires a rebuild for its encryption setting",
                    );
                    mismatch = true;
                }
            }
            if !mismatch {
                continue;
            }
            let info = workload::extract_osd_info(deployment)
                .with_context(|| format!("error recovering prepare output for osd {}", labels.id))?;
            candidates.push(OsdReplaceInfo {
                id: labels.id,
                path: info.block_path,
                node: labels.failure_domain,
            });
        }
        Ok(candidates)
    }

    async fn load_replace_record(&self) -> Result<Option<OsdReplaceInfo>> {
        let map = match self.store.get_config_map(REPLACE_RECORD).await? {
            Some(map) => map,
            None => return Ok(None),
        };
        let raw = match map.data.as_ref().and_then(|data| data.get(REPLACE_RECORD_KEY)) {
            Some(raw) if !raw.is_empty() => raw.clone(),
            _ => return Ok(None),
        };
        let info = serde_json::from_str(&raw).context("error parsing the replacement record")?;
        Ok(Some(info))
    }

    async fn save_replace_record(&self, cluster: &ReefCluster, info: &OsdReplaceInfo) -> Result<()> {
        let raw = serde_json::to_string(info).context("error serializing the replacement record")?;
        let map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(REPLACE_RECORD.to_string()),
                namespace: Some(cluster.namespace().to_string()),
                labels: Some(canonical_labels(cluster.name())),
                owner_references: Some(vec![cluster_owner_reference(cluster)]),
                ..Default::default()
            },
            data: Some(btreemap! { REPLACE_RECORD_KEY.to_string() => raw }),
            ..Default::default()
        };
        self.store.apply_config_map(map).await.context("error writing the replacement record")
    }

    async fn save_migration_record(&self, cluster: &ReefCluster, id: i32) -> Result<()> {
        let map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(MIGRATION_RECORD.to_string()),
                namespace: Some(cluster.namespace().to_string()),
                labels: Some(canonical_labels(cluster.name())),
                owner_references: Some(vec![cluster_owner_reference(cluster)]),
                ..Default::default()
            },
            data: Some(btreemap! { MIGRATION_RECORD_KEY.to_string() => id.to_string() }),
            ..Default::default()
        };
        self.store.apply_config_map(map).await.context("error writing the migration record")
    }
}

/// Indicates if any destructive migration has been confirmed.
fn migration_requested(cluster: &ReefCluster) -> bool {
    let storage = &cluster.spec.storage;
    storage.migration.confirmed() || storage.store.update_confirmed()
}
