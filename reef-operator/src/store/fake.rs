//! An in-memory [`ObjectStore`] used by tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, Node, PersistentVolumeClaim, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::store::{selector_matches, ObjectStore};
use reef_core::crd::ReefClusterStatus;

/// The mutable record state behind a [`FakeStore`].
#[derive(Default)]
pub struct FakeState {
    pub deployments: BTreeMap<String, Deployment>,
    pub config_maps: BTreeMap<String, ConfigMap>,
    pub jobs: BTreeMap<String, Job>,
    pub cron_jobs: BTreeMap<String, CronJob>,
    pub claims: BTreeMap<String, PersistentVolumeClaim>,
    pub secrets: BTreeMap<String, Secret>,
    pub nodes: Vec<Node>,
    pub cluster_status: Option<ReefClusterStatus>,

    /// Running counter used to derive generated claim names.
    pub generated_names: u32,
    /// Count of workload create calls, used to assert idempotence.
    pub deployments_created: u32,
    /// Count of workload apply calls.
    pub deployments_applied: u32,
    /// Count of workload delete calls.
    pub deployments_deleted: u32,
}

/// An in-memory object store recording everything the controller writes.
pub struct FakeStore {
    pub state: Mutex<FakeState>,
    /// Change events for applied config maps, feeding watch streams.
    changes: broadcast::Sender<ConfigMap>,
}

impl Default for FakeStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(FakeState::default()),
            changes,
        }
    }
}

impl FakeStore {
    /// Create a new empty instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the given closure over the locked state.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().expect("fake store poisoned");
        f(&mut state)
    }
}

fn labels_of(meta: &ObjectMeta) -> BTreeMap<String, String> {
    meta.labels.clone().unwrap_or_default()
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn list_deployments(&self, selector: &str) -> Result<Vec<Deployment>> {
        self.with_state(|state| {
            Ok(state
                .deployments
                .values()
                .filter(|d| selector_matches(&labels_of(&d.metadata), selector))
                .cloned()
                .collect())
        })
    }

    async fn get_deployment(&self, name: &str) -> Result<Option<Deployment>> {
        self.with_state(|state| Ok(state.deployments.get(name).cloned()))
    }

    async fn create_deployment(&self, deployment: Deployment) -> Result<()> {
        self.with_state(|state| {
            state.deployments_created += 1;
            let name = deployment.metadata.name.clone().unwrap_or_default();
            // Already-exists is treated as success, matching the production store.
            state.deployments.entry(name).or_insert(deployment);
            Ok(())
        })
    }

    async fn apply_deployment(&self, deployment: Deployment) -> Result<()> {
        self.with_state(|state| {
            state.deployments_applied += 1;
            let name = deployment.metadata.name.clone().unwrap_or_default();
            state.deployments.insert(name, deployment);
            Ok(())
        })
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        self.with_state(|state| {
            state.deployments_deleted += 1;
            state.deployments.remove(name);
            Ok(())
        })
    }

    async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>> {
        self.with_state(|state| Ok(state.config_maps.get(name).cloned()))
    }

    async fn list_config_maps(&self, selector: &str) -> Result<Vec<ConfigMap>> {
        self.with_state(|state| {
            Ok(state
                .config_maps
                .values()
                .filter(|cm| selector_matches(&labels_of(&cm.metadata), selector))
                .cloned()
                .collect())
        })
    }

    async fn apply_config_map(&self, map: ConfigMap) -> Result<()> {
        self.with_state(|state| {
            let name = map.metadata.name.clone().unwrap_or_default();
            state.config_maps.insert(name, map.clone());
        });
        // No subscribers is fine, the event is simply dropped.
        let _ = self.changes.send(map);
        Ok(())
    }

    async fn delete_config_map(&self, name: &str) -> Result<()> {
        self.with_state(|state| {
            state.config_maps.remove(name);
            Ok(())
        })
    }

    async fn watch_config_maps(&self, selector: &str) -> Result<BoxStream<'static, ConfigMap>> {
        let selector = selector.to_string();
        let stream = BroadcastStream::new(self.changes.subscribe())
            .filter_map(move |res| {
                let selector = selector.clone();
                async move {
                    let map = res.ok()?;
                    let labels = map.metadata.labels.clone().unwrap_or_default();
                    selector_matches(&labels, &selector).then(|| map)
                }
            })
            .boxed();
        Ok(stream)
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        self.with_state(|state| Ok(state.jobs.get(name).cloned()))
    }

    async fn create_job(&self, job: Job) -> Result<()> {
        self.with_state(|state| {
            let name = job.metadata.name.clone().unwrap_or_default();
            state.jobs.insert(name, job);
            Ok(())
        })
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        self.with_state(|state| {
            state.jobs.remove(name);
            Ok(())
        })
    }

    async fn list_cron_jobs(&self, selector: &str) -> Result<Vec<CronJob>> {
        self.with_state(|state| {
            Ok(state
                .cron_jobs
                .values()
                .filter(|job| selector_matches(&labels_of(&job.metadata), selector))
                .cloned()
                .collect())
        })
    }

    async fn apply_cron_job(&self, job: CronJob) -> Result<()> {
        self.with_state(|state| {
            let name = job.metadata.name.clone().unwrap_or_default();
            state.cron_jobs.insert(name, job);
            Ok(())
        })
    }

    async fn delete_cron_job(&self, name: &str) -> Result<()> {
        self.with_state(|state| {
            state.cron_jobs.remove(name);
            Ok(())
        })
    }

    async fn list_claims(&self, selector: &str) -> Result<Vec<PersistentVolumeClaim>> {
        self.with_state(|state| {
            Ok(state
                .claims
                .values()
                .filter(|claim| selector_matches(&labels_of(&claim.metadata), selector))
                .cloned()
                .collect())
        })
    }

    async fn create_claim(&self, mut claim: PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        self.with_state(|state| {
            if claim.metadata.name.is_none() {
                let base = claim.metadata.generate_name.clone().unwrap_or_default();
                state.generated_names += 1;
                claim.metadata.name = Some(format!("{}{:05}", base, state.generated_names));
            }
            let name = claim.metadata.name.clone().unwrap_or_default();
            state.claims.insert(name, claim.clone());
            Ok(claim)
        })
    }

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>> {
        self.with_state(|state| Ok(state.secrets.get(name).cloned()))
    }

    async fn apply_secret(&self, secret: Secret) -> Result<()> {
        self.with_state(|state| {
            let name = secret.metadata.name.clone().unwrap_or_default();
            state.secrets.insert(name, secret);
            Ok(())
        })
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.with_state(|state| Ok(state.nodes.clone()))
    }

    async fn update_cluster_status(&self, _name: &str, status: ReefClusterStatus) -> Result<()> {
        self.with_state(|state| {
            state.cluster_status = Some(status);
            Ok(())
        })
    }
}
