//! Update coordination for pre-existing OSD daemons.
//!
//! Every daemon whose workload predates this pass gets its spec regenerated
//! from the current cluster intent and applied, but only once the data plane
//! confirms the daemon can stop safely. Confirmed-safe daemons are updated
//! in batches: the data plane may answer an ok-to-stop query with a whole
//! group of daemons that can go down together.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use k8s_openapi::api::apps::v1::Deployment;

use crate::config::Config;
use crate::dataplane::{DataPlane, OkToStopError};
use crate::osd::{osd_err, osd_workload_selector, workload, ExistenceList};
use crate::store::ObjectStore;
use reef_core::crd::{ReefCluster, RequiredMetadata};
use reef_core::labels::OsdLabels;
use reef_core::OsdError;

/// FIFO queue of OSD ids awaiting a spec update.
///
/// Ids keep their arrival order; batch removal serves the case where one
/// ok-to-stop answer covers several queued daemons at once.
#[derive(Debug, Default)]
pub struct UpdateQueue {
    queue: VecDeque<i32>,
    members: HashSet<i32>,
}

impl UpdateQueue {
    /// Create a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an id; ids already queued are not duplicated.
    pub fn push(&mut self, id: i32) {
        if self.members.insert(id) {
            self.queue.push_back(id);
        }
    }

    /// Pop the oldest queued id.
    pub fn pop(&mut self) -> Option<i32> {
        let id = self.queue.pop_front()?;
        self.members.remove(&id);
        Some(id)
    }

    /// Indicates if the given id is queued.
    pub fn exists(&self, id: i32) -> bool {
        self.members.contains(&id)
    }

    /// Remove every listed id from the queue, preserving order of the rest.
    pub fn remove(&mut self, ids: &[i32]) {
        for id in ids {
            if self.members.remove(id) {
                self.queue.retain(|queued| queued != id);
            }
        }
    }

    /// Number of queued ids.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Indicates if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// A single daemon's pending update.
struct PendingUpdate {
    desired: Deployment,
    labels: OsdLabels,
    uuid: String,
}

/// Rolls current cluster intent onto pre-existing OSD daemons.
pub struct UpdateCoordinator {
    config: Arc<Config>,
    store: Arc<dyn ObjectStore>,
    dataplane: Arc<dyn DataPlane>,
}

impl UpdateCoordinator {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, store: Arc<dyn ObjectStore>, dataplane: Arc<dyn DataPlane>) -> Self {
        Self { config, store, dataplane }
    }

    /// Update every pre-existing daemon of the cluster, health gated.
    ///
    /// Daemons created earlier in this same pass already carry the current
    /// intent and are skipped. Per-daemon problems land in `errors`.
    #[tracing::instrument(level = "debug", skip_all, fields(cluster = cluster.name()))]
    pub async fn run(&self, cluster: &ReefCluster, existence: &ExistenceList, created: &HashSet<i32>, errors: &mut Vec<anyhow::Error>) -> Result<()> {
        let (mut queue, mut pending) = self.collect_pending(cluster, existence, created, errors).await?;
        if queue.is_empty() {
            return Ok(());
        }

        if cluster.spec.upgrade_osd_requires_healthy_pgs {
            match self.dataplane.pgs_clean().await {
                Ok(true) => (),
                Ok(false) => {
                    errors.push(osd_err(OsdError::SafetyGate(
                        "placement groups are not clean, deferring all OSD updates".into(),
                    )));
                    return Ok(());
                }
                Err(err) => {
                    errors.push(err.context("error checking placement group health"));
                    return Ok(());
                }
            }
        }

        while let Some(id) = queue.pop() {
            match self.ok_to_stop_with_retries(id).await {
                Ok(batch) => {
                    // The daemon popped from the queue is updated regardless
                    // of whether the data plane echoes it in the batch.
                    let mut ids = vec![id];
                    ids.extend(batch.into_iter().filter(|other| *other != id && queue.exists(*other)));
                    queue.remove(&ids);
                    self.apply_batch(cluster, &ids, &mut pending, errors).await;
                }
                Err(OkToStopError::NotSafe(_)) => {
                    if cluster.spec.continue_upgrade_after_checks_even_if_not_healthy {
                        tracing::warn!(osd = id, "updating despite a negative ok-to-stop answer, override is set");
                        self.apply_batch(cluster, &[id], &mut pending, errors).await;
                    } else {
                        errors.push(osd_err(OsdError::SafetyGate(format!(
                            "osd {} cannot stop safely, deferring its update",
                            id
                        ))));
                    }
                }
                Err(OkToStopError::Unavailable(err)) => {
                    if cluster.spec.continue_upgrade_after_checks_even_if_not_healthy {
                        tracing::warn!(osd = id, error = ?err, "updating despite an unanswered ok-to-stop query, override is set");
                        self.apply_batch(cluster, &[id], &mut pending, errors).await;
                    } else {
                        errors.push(osd_err(OsdError::Transient(format!(
                            "ok-to-stop query for osd {} failed: {:#}",
                            id, err
                        ))));
                    }
                }
            }
        }
        self.report_version_spread().await;
        Ok(())
    }

    /// Log whether the daemon population has converged on a single version.
    async fn report_version_spread(&self) {
        match self.dataplane.versions().await {
            Ok(versions) if versions.len() == 1 => {
                let version = versions.keys().next().cloned().unwrap_or_default();
                tracing::info!(%version, "all OSD daemons report a single version");
            }
            Ok(versions) => {
                tracing::debug!(spread = versions.len(), "OSD daemon versions have not converged yet");
            }
            Err(err) => tracing::debug!(error = ?err, "error querying daemon versions"),
        }
    }

    /// Build the update queue and the desired spec for every queued daemon.
    async fn collect_pending(
        &self, cluster: &ReefCluster, existence: &ExistenceList, created: &HashSet<i32>, errors: &mut Vec<anyhow::Error>,
    ) -> Result<(UpdateQueue, HashMap<i32, PendingUpdate>)> {
        let deployments = self
            .store
            .list_deployments(&osd_workload_selector(cluster.name()))
            .await
            .context("error listing workloads for update")?;
        let mut queue = UpdateQueue::new();
        let mut pending = HashMap::new();
        for deployment in &deployments {
            let labels = match workload::extract_osd_labels(deployment) {
                Ok(labels) => labels,
                Err(_) => continue,
            };
            if !existence.contains(&labels.id) || created.contains(&labels.id) {
                continue;
            }
            let target = match workload::target_for_existing(cluster, deployment) {
                Ok(Some(target)) => target,
                // The daemon's node or device set left the declared scope.
                // Such daemons are neither updated nor deleted.
                Ok(None) => {
                    tracing::info!(osd = labels.id, "OSD is no longer in the declared storage scope, leaving it untouched");
                    continue;
                }
                Err(err) => {
                    errors.push(err.context(format!("error resolving scope for osd {}", labels.id)));
                    continue;
                }
            };
            let info = match workload::extract_osd_info(deployment) {
                Ok(info) => info,
                Err(err) => {
                    errors.push(err.context(format!("error recovering prepare output for osd {}", labels.id)));
                    continue;
                }
            };
            let desired = match workload::build_deployment(cluster, &target, &info) {
                Ok(desired) => desired,
                Err(err) => {
                    errors.push(err.context(format!("error building desired workload for osd {}", labels.id)));
                    continue;
                }
            };
            queue.push(labels.id);
            pending.insert(labels.id, PendingUpdate { desired, labels, uuid: info.uuid });
        }
        tracing::debug!(queued = queue.len(), "update queue built");
        Ok((queue, pending))
    }

    /// Query ok-to-stop, retrying transient data-plane outages.
    async fn ok_to_stop_with_retries(&self, id: i32) -> Result<Vec<i32>, OkToStopError> {
        let mut attempt = 0;
        loop {
            match self.dataplane.ok_to_stop(id, self.config.ok_to_stop_max).await {
                Err(OkToStopError::Unavailable(err)) if attempt + 1 < self.config.ok_to_stop_retries => {
                    attempt += 1;
                    tracing::warn!(osd = id, attempt, error = ?err, "ok-to-stop query failed, retrying");
                }
                res => return res,
            }
        }
    }

    /// Apply a confirmed-safe batch of updates in parallel.
    async fn apply_batch(&self, cluster: &ReefCluster, ids: &[i32], pending: &mut HashMap<i32, PendingUpdate>, errors: &mut Vec<anyhow::Error>) {
        let mut updates = Vec::new();
        for id in ids {
            match pending.remove(id) {
                Some(update) => updates.push(update),
                None => tracing::warn!(osd = id, "confirmed-safe osd has no pending update"),
            }
        }
        let results = join_all(updates.iter().map(|update| self.apply_update(cluster, update))).await;
        for (update, res) in updates.iter().zip(results) {
            match res {
                Ok(()) => tracing::info!(osd = update.labels.id, "updated OSD workload"),
                Err(err) => errors.push(err.context(format!("error updating workload for osd {}", update.labels.id))),
            }
        }
    }

    /// Apply one daemon's update, rotating its keys first when due.
    async fn apply_update(&self, cluster: &ReefCluster, update: &PendingUpdate) -> Result<()> {
        let desired_generation = cluster.spec.security.cephx.desired_generation();
        if desired_generation > update.labels.cephx_key_generation {
            self.rotate_cephx(update).await?;
        }
        self.store.apply_deployment(update.desired.clone()).await
    }

    /// Rotate the daemon's auth keys ahead of its restart.
    ///
    /// Rotation happens while the old pod still runs; the replacement pod
    /// picks the fresh key up on activation. Encrypted daemons also rotate
    /// the lockbox identity guarding their on-disk key.
    async fn rotate_cephx(&self, update: &PendingUpdate) -> Result<()> {
        let entity = format!("osd.{}", update.labels.id);
        self.dataplane.auth_rotate(&entity).await.context("error rotating daemon key")?;
        if update.labels.encrypted && !update.uuid.is_empty() {
            let lockbox = format!("client.osd-lockbox.{}", update.uuid);
            self.dataplane.auth_rotate(&lockbox).await.context("error rotating lockbox key")?;
        }
        tracing::info!(osd = update.labels.id, "rotated auth keys");
        Ok(())
    }
}
