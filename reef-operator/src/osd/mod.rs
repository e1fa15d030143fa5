//! The OSD lifecycle controller.
//!
//! Reconciliation for a cluster runs the coordinators in a fixed order:
//! migration planning, storage-intent resolution, provisioning, updates,
//! key-rotation scheduling. Errors local to one OSD or target are collected
//! into a per-reconcile error set; only configuration errors, cancellation
//! and an unreadable existence list abort the pass.

pub mod device_set;
pub mod envs;
pub mod health;
pub mod key_rotation;
pub mod migrate;
pub mod provision;
pub mod resolver;
pub mod status;
pub mod update;
pub mod workload;

#[cfg(test)]
mod controller_test;
#[cfg(test)]
mod device_set_test;
#[cfg(test)]
mod envs_test;
#[cfg(test)]
mod workload_test;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::Config;
use crate::dataplane::DataPlane;
use crate::store::ObjectStore;
use reef_core::crd::{ReefCluster, ReefClusterStatus, RequiredMetadata};
use reef_core::labels::{APP_NAME, LABEL_KEY_APP, LABEL_KEY_CLUSTER, LABEL_KEY_RECORD};
use reef_core::OsdError;

/// Maximum length of record names in the object store.
const MAX_RECORD_NAME_LEN: usize = 63;

/// One daemon's identity as emitted by a prepare task.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OsdInfo {
    /// The stable integer id assigned by the data plane.
    pub id: i32,
    /// The daemon's uuid.
    pub uuid: String,
    /// Path of the backing block device.
    pub block_path: String,
    /// Device-management mode the daemon was prepared under, `lvm` or `raw`.
    pub cv_mode: String,
    /// The on-device storage format.
    pub store: String,
    /// The crush device class.
    #[serde(default)]
    pub device_class: String,
    /// Whether the backing device is encrypted.
    #[serde(default)]
    pub encrypted: bool,
    /// The node the daemon was prepared on, or the backing claim name for
    /// PVC-backed daemons.
    #[serde(default)]
    pub node: String,
    /// Whether the backing claim is itself an LVM logical volume.
    #[serde(rename = "lv-backed-pv", default)]
    pub lv_backed_pv: bool,
}

/// The set of OSD ids for which a daemon workload already exists.
pub type ExistenceList = HashSet<i32>;

/// The name of an OSD's daemon workload.
pub fn osd_deployment_name(id: i32) -> String {
    format!("{}-{}", APP_NAME, id)
}

/// The name of the status record for the given provisioning target.
pub fn status_record_name(target: &str) -> String {
    truncate_record_name(&format!("{}-{}-status", APP_NAME, target))
}

/// The name of the prepare task for the given provisioning target.
pub fn prepare_job_name(target: &str) -> String {
    truncate_record_name(&format!("{}-prepare-{}", APP_NAME, target))
}

/// The name of the key-rotation cron job for the given OSD.
pub fn key_rotation_job_name(id: i32) -> String {
    format!("{}-key-rotation-{}", APP_NAME, id)
}

/// The name of the encryption-key secret for the given claim.
pub fn encryption_secret_name(claim: &str) -> String {
    truncate_record_name(&format!("{}-encryption-key-{}", APP_NAME, claim))
}

/// Truncate a record name to the object store's identifier-length limit.
///
/// Long names keep a leading slice of the original plus a hashed suffix so
/// that distinct targets never collide after truncation.
pub fn truncate_record_name(name: &str) -> String {
    if name.len() <= MAX_RECORD_NAME_LEN {
        return name.to_string();
    }
    let hash = format!("{:016x}", seahash::hash(name.as_bytes()));
    let keep = MAX_RECORD_NAME_LEN - hash.len() - 1;
    format!("{}-{}", &name[..keep], hash)
}

/// The label selector matching every OSD daemon workload of a cluster.
pub fn osd_workload_selector(cluster: &str) -> String {
    format!("{}={},{}={}", LABEL_KEY_APP, APP_NAME, LABEL_KEY_CLUSTER, cluster)
}

/// The label selector matching every record of the given kind for a cluster.
pub fn record_selector(cluster: &str, record: &str) -> String {
    format!("{}={},{}={},{}={}", LABEL_KEY_APP, APP_NAME, LABEL_KEY_CLUSTER, cluster, LABEL_KEY_RECORD, record)
}

/// Build the owner reference pointing at the cluster record.
///
/// Every durable record this controller creates carries this edge so the
/// platform garbage-collects the whole population with the cluster. Owner
/// edges only ever point from child records to parents.
pub fn cluster_owner_reference(cluster: &ReefCluster) -> OwnerReference {
    OwnerReference {
        api_version: "reef.rs/v1beta1".into(),
        kind: "ReefCluster".into(),
        name: cluster.name().to_string(),
        uid: cluster.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// The OSD lifecycle controller for a single cluster namespace.
pub struct Controller {
    /// Runtime config.
    config: Arc<Config>,
    /// Typed handle onto the external object store.
    store: Arc<dyn ObjectStore>,
    /// Handle onto the data plane's control surface.
    dataplane: Arc<dyn DataPlane>,
    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Sender<()>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, store: Arc<dyn ObjectStore>, dataplane: Arc<dyn DataPlane>, shutdown: broadcast::Sender<()>) -> Self {
        Self { config, store, dataplane, shutdown }
    }

    /// Run one full reconciliation of the given cluster record.
    #[tracing::instrument(level = "debug", skip(self, cluster), fields(cluster = cluster.name()))]
    pub async fn reconcile(&self, cluster: &ReefCluster) -> Result<()> {
        let mut errors: Vec<anyhow::Error> = Vec::new();
        self.update_status(cluster, status_progressing("beginning OSD reconciliation")).await;

        // The existence list is the basis of create-vs-update decisions; an
        // unreadable list aborts the pass.
        let existing = self
            .store
            .list_deployments(&osd_workload_selector(cluster.name()))
            .await
            .context("error listing existing OSD workloads")?;
        let mut existence = ExistenceList::new();
        for deployment in &existing {
            match workload::extract_osd_labels(deployment) {
                Ok(labels) => {
                    existence.insert(labels.id);
                }
                Err(err) => tracing::warn!(error = ?err, "skipping workload with malformed labels"),
            }
        }

        // Plan at most one destructive migration/replacement before any
        // provisioning, so its prepare task sees the bare device.
        let planner = migrate::Planner::new(self.store.clone(), self.dataplane.clone());
        let replacement = match planner.plan(cluster, &existing).await {
            Ok(replacement) => replacement,
            Err(err) => {
                self.update_status(cluster, status_failure(&format!("migration planning failed: {}", err))).await;
                return Err(err);
            }
        };

        // Resolve the declared storage scope into provisioning targets.
        let resolver = resolver::Resolver::new(self.store.clone());
        let targets = match resolver.resolve(cluster, &mut errors).await {
            Ok(targets) => targets,
            Err(err) => {
                self.update_status(cluster, status_failure(&format!("storage scope resolution failed: {}", err))).await;
                return Err(err);
            }
        };

        // Two-phase provisioning: dispatch prepare tasks, then consume
        // status records and create workloads.
        let provisioner = provision::Provisioner::new(self.store.clone());
        let awaited = provisioner.dispatch(cluster, &targets, replacement.as_ref(), &mut errors).await;
        let consumer = status::StatusConsumer::new(self.config.clone(), self.store.clone(), self.shutdown.subscribe());
        let created = consumer.consume(cluster, awaited, &existence, &mut errors).await?;

        // Roll updated specs onto pre-existing daemons, health gated.
        let updater = update::UpdateCoordinator::new(self.config.clone(), self.store.clone(), self.dataplane.clone());
        updater.run(cluster, &existence, &created, &mut errors).await?;

        // Reconcile key-rotation schedules for encrypted daemons.
        if let Err(err) = key_rotation::reconcile_key_rotation(cluster, self.store.as_ref()).await {
            errors.push(err);
        }

        // Advisory device-class divergence report.
        self.check_device_classes(cluster, &mut errors).await;

        if errors.is_empty() {
            self.update_status(cluster, status_ready()).await;
            return Ok(());
        }
        // Safety-gate deferrals are expected backpressure, not failures:
        // the gated work simply waits for a later pass.
        let (deferred, failures): (Vec<_>, Vec<_>) = errors
            .into_iter()
            .partition(|err| matches!(err.downcast_ref::<OsdError>(), Some(OsdError::SafetyGate(_))));
        if failures.is_empty() {
            let summary = collate_errors(&deferred);
            tracing::info!(deferred = deferred.len(), %summary, "reconciliation deferred work behind safety gates");
            self.update_status(cluster, status_progressing(&format!("deferred behind safety gates: {}", summary))).await;
            return Ok(());
        }
        let summary = collate_errors(&failures);
        if failures.iter().any(|err| matches!(err.downcast_ref::<OsdError>(), Some(err) if err.is_fatal())) {
            tracing::error!(%summary, "reconciliation hit a non-retryable error");
        }
        self.update_status(cluster, status_failure(&summary)).await;
        bail!("OSD reconciliation completed with {} error(s): {}", failures.len(), summary);
    }

    /// Compare each workload's declared device class against the data plane.
    ///
    /// Divergence is logged, never acted on.
    async fn check_device_classes(&self, cluster: &ReefCluster, errors: &mut Vec<anyhow::Error>) {
        let deployments = match self.store.list_deployments(&osd_workload_selector(cluster.name())).await {
            Ok(deployments) => deployments,
            Err(err) => {
                errors.push(err.context("error listing workloads for device-class check"));
                return;
            }
        };
        for deployment in &deployments {
            let labels = match workload::extract_osd_labels(deployment) {
                Ok(labels) => labels,
                Err(_) => continue,
            };
            if labels.device_class.is_empty() {
                continue;
            }
            match self.dataplane.crush_get_device_class(labels.id).await {
                Ok(actual) if actual != labels.device_class => {
                    tracing::warn!(
                        osd = labels.id,
                        declared = %labels.device_class,
                        actual = %actual,
                        "OSD device class diverges from declared intent",
                    );
                }
                Ok(_) => (),
                Err(err) => tracing::debug!(error = ?err, osd = labels.id, "error fetching device class"),
            }
        }
    }

    /// Patch the cluster record's status, logging failures only.
    async fn update_status(&self, cluster: &ReefCluster, status: ReefClusterStatus) {
        if let Err(err) = self.store.update_cluster_status(cluster.name(), status).await {
            tracing::error!(error = ?err, "error updating cluster status");
        }
    }
}

/// Collate the reconcile error set into one user-visible summary.
pub fn collate_errors(errors: &[anyhow::Error]) -> String {
    errors.iter().map(|err| format!("{:#}", err)).collect::<Vec<_>>().join("; ")
}

fn status_progressing(message: &str) -> ReefClusterStatus {
    ReefClusterStatus {
        phase: Some("Progressing".into()),
        message: Some(message.to_string()),
        conditions: vec![condition("Progressing", "True", message)],
    }
}

fn status_ready() -> ReefClusterStatus {
    ReefClusterStatus {
        phase: Some("Ready".into()),
        message: None,
        conditions: vec![condition("Ready", "True", "all OSDs reconciled")],
    }
}

fn status_failure(message: &str) -> ReefClusterStatus {
    ReefClusterStatus {
        phase: Some("Failure".into()),
        message: Some(message.to_string()),
        conditions: vec![condition("Failure", "True", message)],
    }
}

fn condition(condition_type: &str, status: &str, message: &str) -> reef_core::crd::ClusterCondition {
    reef_core::crd::ClusterCondition {
        condition_type: condition_type.into(),
        status: status.into(),
        message: Some(message.to_string()),
    }
}

/// Convert an [`OsdError`] into the shared anyhow error type, preserving the
/// taxonomy for callers which downcast.
pub fn osd_err(err: OsdError) -> anyhow::Error {
    anyhow::Error::new(err)
}
