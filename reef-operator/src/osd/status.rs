//! Status-record consumption, the second phase of provisioning.
//!
//! Prepare tasks report through per-target status records. The consumer
//! watches the awaited records for change notifications, polling on an
//! interval as a fallback, until every one completes or fails, creating
//! daemon workloads for newly prepared OSDs as completions arrive. Records
//! nobody awaits are lingering leftovers and are swept at the end.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::osd::provision::AwaitedTarget;
use crate::osd::{osd_err, prepare_job_name, record_selector, workload, ExistenceList, OsdInfo};
use crate::store::ObjectStore;
use reef_core::crd::{ReefCluster, RequiredMetadata};
use reef_core::OsdError;

/// Data key under which the orchestration status is stored in its record.
pub const RECORD_DATA_KEY: &str = "status";

/// Status value of a freshly dispatched target.
pub const STATUS_STARTING: &str = "starting";
/// Status value reported while the prepare task is working.
pub const STATUS_ORCHESTRATING: &str = "orchestrating";
/// Status value of a successfully prepared target.
pub const STATUS_COMPLETED: &str = "completed";
/// Status value of a failed target.
pub const STATUS_FAILED: &str = "failed";

/// The provisioning report exchanged through a status record.
///
/// Written as `starting` by the operator, advanced by the prepare task, and
/// consumed here. The field names are part of the prepare-task contract.
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize, PartialEq)]
pub struct OrchestrationStatus {
    /// Current phase, one of the `STATUS_*` values.
    pub status: String,
    /// Human readable detail, the failure reason for failed targets.
    #[serde(default)]
    pub message: String,
    /// Whether the target is backed by a block-volume claim.
    #[serde(rename = "pvc-backed", default)]
    pub pvc_backed: bool,
    /// The OSDs prepared on the target, populated on completion.
    #[serde(default)]
    pub osds: Vec<OsdInfo>,
}

impl OrchestrationStatus {
    /// The initial report seeded by the operator at dispatch time.
    pub fn starting(pvc_backed: bool) -> Self {
        Self {
            status: STATUS_STARTING.to_string(),
            pvc_backed,
            ..Default::default()
        }
    }
}

/// Render a status record's data map.
pub fn record_data(status: &OrchestrationStatus) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    // Serialization of this struct cannot fail.
    data.insert(RECORD_DATA_KEY.to_string(), serde_json::to_string(status).unwrap_or_default());
    data
}

/// Parse the orchestration status out of its record.
pub fn parse_record(map: &ConfigMap) -> Result<OrchestrationStatus> {
    let raw = map
        .data
        .as_ref()
        .and_then(|data| data.get(RECORD_DATA_KEY))
        .context("status record is missing its status key")?;
    serde_json::from_str(raw).context("error parsing status record")
}

/// The lifecycle of one status record during a consume pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordState {
    /// Dispatched this pass, completion pending.
    Awaiting,
    /// Terminal report consumed; the record has been acted on.
    Handled,
    /// Present in the store but not awaited by this pass; swept.
    Lingering,
}

/// Consumes status records and creates workloads for prepared OSDs.
pub struct StatusConsumer {
    config: Arc<Config>,
    store: Arc<dyn ObjectStore>,
    shutdown: broadcast::Receiver<()>,
}

impl StatusConsumer {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, store: Arc<dyn ObjectStore>, shutdown: broadcast::Receiver<()>) -> Self {
        Self { config, store, shutdown }
    }

    /// Await the given records, returning the ids of newly created OSDs.
    ///
    /// Per-target failures land in `errors`. The returned error is reserved
    /// for cancellation, which aborts the reconcile pass.
    #[tracing::instrument(level = "debug", skip_all, fields(cluster = cluster.name(), awaited = awaited.len()))]
    pub async fn consume(
        mut self, cluster: &ReefCluster, awaited: Vec<AwaitedTarget>, existence: &ExistenceList, errors: &mut Vec<anyhow::Error>,
    ) -> Result<HashSet<i32>> {
        let mut created = HashSet::new();
        let mut states: HashMap<String, RecordState> = awaited.iter().map(|a| (a.record.clone(), RecordState::Awaiting)).collect();
        let poll_interval = Duration::from_millis(self.config.status_poll_interval_ms);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.config.status_wait_timeout_secs);

        // Change notifications wake the loop as soon as a prepare task
        // reports; the interval poll covers anything the watch misses.
        let selector = record_selector(cluster.name(), crate::osd::provision::RECORD_OSD_STATUS);
        let mut changes = match self.store.watch_config_maps(&selector).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(error = ?err, "error establishing status record watch, falling back to polling");
                futures::stream::pending().boxed()
            }
        };

        while states.values().any(|state| *state == RecordState::Awaiting) {
            for target in &awaited {
                if states[&target.record] != RecordState::Awaiting {
                    continue;
                }
                match self.poll_record(cluster, target, existence, &mut created, errors).await {
                    Ok(true) => {
                        states.insert(target.record.clone(), RecordState::Handled);
                    }
                    Ok(false) => (),
                    Err(err) => tracing::warn!(error = ?err, record = %target.record, "error polling status record"),
                }
            }
            if states.values().all(|state| *state != RecordState::Awaiting) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                for target in &awaited {
                    if states[&target.record] == RecordState::Awaiting {
                        errors.push(osd_err(OsdError::TargetFailed {
                            target: target.target.name.clone(),
                            message: "timed out waiting for the prepare task to report".into(),
                        }));
                    }
                }
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => (),
                // The pattern leaves this branch disabled if the watch ends.
                Some(_) = changes.next() => (),
                _ = self.shutdown.recv() => return Err(osd_err(OsdError::Canceled)),
            }
        }

        self.sweep_lingering_records(cluster, &states).await;
        Ok(created)
    }

    /// Poll one awaited record, returning `true` once it reaches a terminal
    /// state and has been acted on.
    async fn poll_record(
        &self, cluster: &ReefCluster, target: &AwaitedTarget, existence: &ExistenceList, created: &mut HashSet<i32>,
        errors: &mut Vec<anyhow::Error>,
    ) -> Result<bool> {
        let map = match self.store.get_config_map(&target.record).await? {
            Some(map) => map,
            // The record was seeded at dispatch; its absence means something
            // else deleted it. Treat as a failure of the target.
            None => {
                errors.push(osd_err(OsdError::TargetFailed {
                    target: target.target.name.clone(),
                    message: "status record disappeared while awaiting the prepare task".into(),
                }));
                return Ok(true);
            }
        };
        let status = parse_record(&map)?;
        match status.status.as_str() {
            STATUS_COMPLETED => {
                for info in &status.osds {
                    self.handle_prepared_osd(cluster, target, info, existence, created, errors).await;
                }
                if status.osds.is_empty() {
                    tracing::info!(target = %target.target.name, "prepare task found no devices to provision");
                }
                self.store.delete_config_map(&target.record).await?;
                self.store.delete_job(&prepare_job_name(&target.target.name)).await?;
                Ok(true)
            }
            STATUS_FAILED => {
                errors.push(osd_err(OsdError::TargetFailed {
                    target: target.target.name.clone(),
                    message: status.message.clone(),
                }));
                // The failed record is removed; the prepare job is kept so
                // its pod logs stay available.
                self.store.delete_config_map(&target.record).await?;
                Ok(true)
            }
            STATUS_STARTING | STATUS_ORCHESTRATING => Ok(false),
            other => {
                tracing::warn!(record = %target.record, status = other, "status record reports an unknown phase");
                Ok(false)
            }
        }
    }

    /// Create the daemon workload for one freshly prepared OSD.
    ///
    /// OSDs which already have a workload are left to the update coordinator.
    async fn handle_prepared_osd(
        &self, cluster: &ReefCluster, target: &AwaitedTarget, info: &OsdInfo, existence: &ExistenceList, created: &mut HashSet<i32>,
        errors: &mut Vec<anyhow::Error>,
    ) {
        if existence.contains(&info.id) {
            tracing::debug!(osd = info.id, "workload already exists, leaving to the update coordinator");
            return;
        }
        let deployment = match workload::build_deployment(cluster, &target.target, info) {
            Ok(deployment) => deployment,
            Err(err) => {
                errors.push(err.context(format!("error building workload for osd {}", info.id)));
                return;
            }
        };
        match self.store.create_deployment(deployment).await {
            Ok(()) => {
                tracing::info!(osd = info.id, target = %target.target.name, "created OSD workload");
                created.insert(info.id);
            }
            Err(err) => errors.push(err.context(format!("error creating workload for osd {}", info.id))),
        }
    }

    /// Delete status records no target of this pass is awaiting.
    ///
    /// Handled records were already deleted; anything else under the status
    /// record selector is a leftover from an interrupted earlier pass.
    async fn sweep_lingering_records(&self, cluster: &ReefCluster, states: &HashMap<String, RecordState>) {
        let selector = record_selector(cluster.name(), crate::osd::provision::RECORD_OSD_STATUS);
        let records = match self.store.list_config_maps(&selector).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error = ?err, "error listing status records for the lingering sweep");
                return;
            }
        };
        for record in records {
            let name = record.metadata.name.clone().unwrap_or_default();
            if states.contains_key(&name) {
                continue;
            }
            tracing::warn!(record = %name, state = ?RecordState::Lingering, "sweeping lingering status record");
            if let Err(err) = self.store.delete_config_map(&name).await {
                tracing::warn!(error = ?err, record = %name, "error deleting lingering status record");
            }
        }
    }
}
