//! Object store access.
//!
//! All durable records the OSD controller reads and writes go through the
//! [`ObjectStore`] trait. Production uses [`KubeStore`] over the K8s API;
//! tests use the in-memory fake. Keeping the seam here means the
//! coordinators never talk to `kube::Api` directly and can be exercised
//! in-process.

#[cfg(test)]
pub mod fake;

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use http::StatusCode;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, Node, PersistentVolumeClaim, Secret};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::client::Client;
use kube::runtime::watcher;
use tokio::time::timeout;

use crate::config::Config;
use reef_core::crd::{ReefCluster, ReefClusterStatus};
use reef_core::labels::APP_NAME;

/// The default timeout used for K8s API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// The interface over every durable record this controller owns.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List OSD daemon workloads matching the given label selector.
    async fn list_deployments(&self, selector: &str) -> Result<Vec<Deployment>>;
    /// Fetch the named daemon workload, `None` when it does not exist.
    async fn get_deployment(&self, name: &str) -> Result<Option<Deployment>>;
    /// Create a daemon workload; an already existing workload of the same
    /// name is treated as success.
    async fn create_deployment(&self, deployment: Deployment) -> Result<()>;
    /// Server-side apply a daemon workload.
    async fn apply_deployment(&self, deployment: Deployment) -> Result<()>;
    /// Delete the named daemon workload, tolerating 404s.
    async fn delete_deployment(&self, name: &str) -> Result<()>;

    /// Fetch the named config map, `None` when it does not exist.
    async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>>;
    /// List config maps matching the given label selector.
    async fn list_config_maps(&self, selector: &str) -> Result<Vec<ConfigMap>>;
    /// Server-side apply a config map.
    async fn apply_config_map(&self, map: ConfigMap) -> Result<()>;
    /// Delete the named config map, tolerating 404s.
    async fn delete_config_map(&self, name: &str) -> Result<()>;
    /// Subscribe to changes of config maps matching the given label
    /// selector. The stream yields each changed map and never terminates
    /// on its own.
    async fn watch_config_maps(&self, selector: &str) -> Result<BoxStream<'static, ConfigMap>>;

    /// Fetch the named one-shot job, `None` when it does not exist.
    async fn get_job(&self, name: &str) -> Result<Option<Job>>;
    /// Create a one-shot job.
    async fn create_job(&self, job: Job) -> Result<()>;
    /// Delete the named job and its pods, tolerating 404s.
    async fn delete_job(&self, name: &str) -> Result<()>;

    /// List cron jobs matching the given label selector.
    async fn list_cron_jobs(&self, selector: &str) -> Result<Vec<CronJob>>;
    /// Server-side apply a cron job.
    async fn apply_cron_job(&self, job: CronJob) -> Result<()>;
    /// Delete the named cron job, tolerating 404s.
    async fn delete_cron_job(&self, name: &str) -> Result<()>;

    /// List volume claims matching the given label selector.
    async fn list_claims(&self, selector: &str) -> Result<Vec<PersistentVolumeClaim>>;
    /// Create a volume claim, returning it with its server-assigned name.
    async fn create_claim(&self, claim: PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;

    /// Fetch the named secret, `None` when it does not exist.
    async fn get_secret(&self, name: &str) -> Result<Option<Secret>>;
    /// Server-side apply a secret.
    async fn apply_secret(&self, secret: Secret) -> Result<()>;

    /// List the nodes of the platform topology.
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Update the status subresource of the named cluster record.
    async fn update_cluster_status(&self, name: &str, status: ReefClusterStatus) -> Result<()>;
}

/// The production [`ObjectStore`] over the K8s API.
pub struct KubeStore {
    client: Client,
    namespace: String,
}

impl KubeStore {
    /// Create a new instance scoped to the config's namespace.
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            namespace: config.namespace.clone(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where K: kube::Resource<DynamicType = ()> + serde::de::DeserializeOwned + Clone + std::fmt::Debug {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Map a get result, treating 404 as `None`.
fn some_or_404<K>(res: std::result::Result<K, kube::Error>) -> Result<Option<K>> {
    match res {
        Ok(val) => Ok(Some(val)),
        Err(kube::Error::Api(err)) if err.code == StatusCode::NOT_FOUND.as_u16() => Ok(None),
        Err(err) => Err(err).context("error fetching object from K8s API"),
    }
}

/// Map a delete result, treating 404 as success.
fn ok_or_404<K>(res: std::result::Result<K, kube::Error>) -> Result<()> {
    match res {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == StatusCode::NOT_FOUND.as_u16() => Ok(()),
        Err(err) => Err(err).context("error deleting object from K8s API"),
    }
}

/// Map a create result, treating 409 already-exists as success.
fn ok_or_409<K>(res: std::result::Result<K, kube::Error>) -> Result<()> {
    match res {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == StatusCode::CONFLICT.as_u16() => Ok(()),
        Err(err) => Err(err).context("error creating object in K8s API"),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn list_deployments(&self, selector: &str) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = self.api();
        let params = ListParams::default().labels(selector);
        let list = timeout(API_TIMEOUT, api.list(&params))
            .await
            .context("timeout while listing deployments")?
            .context("error listing deployments")?;
        Ok(list.items)
    }

    async fn get_deployment(&self, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = self.api();
        some_or_404(timeout(API_TIMEOUT, api.get(name)).await.context("timeout while fetching deployment")?)
    }

    async fn create_deployment(&self, deployment: Deployment) -> Result<()> {
        let api: Api<Deployment> = self.api();
        ok_or_409(
            timeout(API_TIMEOUT, api.create(&PostParams::default(), &deployment))
                .await
                .context("timeout while creating deployment")?,
        )
    }

    async fn apply_deployment(&self, deployment: Deployment) -> Result<()> {
        let api: Api<Deployment> = self.api();
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true;
        let name = deployment.metadata.name.clone().unwrap_or_default();
        timeout(API_TIMEOUT, api.patch(&name, &params, &Patch::Apply(&deployment)))
            .await
            .context("timeout while applying deployment")?
            .context("error applying deployment")?;
        Ok(())
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        let api: Api<Deployment> = self.api();
        ok_or_404(
            timeout(API_TIMEOUT, api.delete(name, &DeleteParams::default()))
                .await
                .context("timeout while deleting deployment")?,
        )
    }

    async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = self.api();
        some_or_404(timeout(API_TIMEOUT, api.get(name)).await.context("timeout while fetching config map")?)
    }

    async fn list_config_maps(&self, selector: &str) -> Result<Vec<ConfigMap>> {
        let api: Api<ConfigMap> = self.api();
        let params = ListParams::default().labels(selector);
        let list = timeout(API_TIMEOUT, api.list(&params))
            .await
            .context("timeout while listing config maps")?
            .context("error listing config maps")?;
        Ok(list.items)
    }

    async fn apply_config_map(&self, map: ConfigMap) -> Result<()> {
        let api: Api<ConfigMap> = self.api();
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true;
        let name = map.metadata.name.clone().unwrap_or_default();
        timeout(API_TIMEOUT, api.patch(&name, &params, &Patch::Apply(&map)))
            .await
            .context("timeout while applying config map")?
            .context("error applying config map")?;
        Ok(())
    }

    async fn delete_config_map(&self, name: &str) -> Result<()> {
        let api: Api<ConfigMap> = self.api();
        ok_or_404(
            timeout(API_TIMEOUT, api.delete(name, &DeleteParams::default()))
                .await
                .context("timeout while deleting config map")?,
        )
    }

    async fn watch_config_maps(&self, selector: &str) -> Result<BoxStream<'static, ConfigMap>> {
        let api: Api<ConfigMap> = self.api();
        let params = ListParams::default().labels(selector);
        let stream = watcher::watcher(api, params)
            .filter_map(|res| async move {
                match res {
                    Ok(watcher::Event::Applied(map)) => Some(vec![map]),
                    Ok(watcher::Event::Restarted(maps)) => Some(maps),
                    Ok(watcher::Event::Deleted(_)) => None,
                    Err(err) => {
                        tracing::debug!(error = ?err, "error from config map watch, will re-establish");
                        None
                    }
                }
            })
            .map(futures::stream::iter)
            .flatten()
            .boxed();
        Ok(stream)
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        let api: Api<Job> = self.api();
        some_or_404(timeout(API_TIMEOUT, api.get(name)).await.context("timeout while fetching job")?)
    }

    async fn create_job(&self, job: Job) -> Result<()> {
        let api: Api<Job> = self.api();
        timeout(API_TIMEOUT, api.create(&PostParams::default(), &job))
            .await
            .context("timeout while creating job")?
            .context("error creating job")?;
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        let api: Api<Job> = self.api();
        // Propagate the delete to the job's pods, else they linger as orphans.
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        ok_or_404(timeout(API_TIMEOUT, api.delete(name, &params)).await.context("timeout while deleting job")?)
    }

    async fn list_cron_jobs(&self, selector: &str) -> Result<Vec<CronJob>> {
        let api: Api<CronJob> = self.api();
        let params = ListParams::default().labels(selector);
        let list = timeout(API_TIMEOUT, api.list(&params))
            .await
            .context("timeout while listing cron jobs")?
            .context("error listing cron jobs")?;
        Ok(list.items)
    }

    async fn apply_cron_job(&self, job: CronJob) -> Result<()> {
        let api: Api<CronJob> = self.api();
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true;
        let name = job.metadata.name.clone().unwrap_or_default();
        timeout(API_TIMEOUT, api.patch(&name, &params, &Patch::Apply(&job)))
            .await
            .context("timeout while applying cron job")?
            .context("error applying cron job")?;
        Ok(())
    }

    async fn delete_cron_job(&self, name: &str) -> Result<()> {
        let api: Api<CronJob> = self.api();
        ok_or_404(
            timeout(API_TIMEOUT, api.delete(name, &DeleteParams::default()))
                .await
                .context("timeout while deleting cron job")?,
        )
    }

    async fn list_claims(&self, selector: &str) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = self.api();
        let params = ListParams::default().labels(selector);
        let list = timeout(API_TIMEOUT, api.list(&params))
            .await
            .context("timeout while listing volume claims")?
            .context("error listing volume claims")?;
        Ok(list.items)
    }

    async fn create_claim(&self, claim: PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = self.api();
        timeout(API_TIMEOUT, api.create(&PostParams::default(), &claim))
            .await
            .context("timeout while creating volume claim")?
            .context("error creating volume claim")
    }

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = self.api();
        some_or_404(timeout(API_TIMEOUT, api.get(name)).await.context("timeout while fetching secret")?)
    }

    async fn apply_secret(&self, secret: Secret) -> Result<()> {
        let api: Api<Secret> = self.api();
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true;
        let name = secret.metadata.name.clone().unwrap_or_default();
        timeout(API_TIMEOUT, api.patch(&name, &params, &Patch::Apply(&secret)))
            .await
            .context("timeout while applying secret")?
            .context("error applying secret")?;
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = timeout(API_TIMEOUT, api.list(&ListParams::default()))
            .await
            .context("timeout while listing nodes")?
            .context("error listing nodes")?;
        Ok(list.items)
    }

    async fn update_cluster_status(&self, name: &str, status: ReefClusterStatus) -> Result<()> {
        let api: Api<ReefCluster> = self.api();
        let patch = serde_json::json!({ "status": status });
        timeout(API_TIMEOUT, api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)))
            .await
            .context("timeout while updating cluster status")?
            .context("error updating cluster status")?;
        Ok(())
    }
}

/// Check a label map against a `k=v,k2=v2` equality selector.
pub fn selector_matches(labels: &std::collections::BTreeMap<String, String>, selector: &str) -> bool {
    selector.split(',').filter(|part| !part.is_empty()).all(|part| match part.split_once('=') {
        Some((key, val)) => labels.get(key).map(String::as_str) == Some(val),
        None => false,
    })
}
