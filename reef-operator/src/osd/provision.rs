//! Prepare-task dispatch, the first phase of provisioning.
//!
//! For every resolved target the provisioner writes an initial status record
//! and launches a prepare task against the target's devices. The task runs
//! the provisioning image, which reports its findings back through the
//! status record; the status consumer picks the flow up from there.

use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec, Secret, VolumeDevice};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use maplit::btreemap;
use rand::RngCore;

use crate::osd::migrate::OsdReplaceInfo;
use crate::osd::resolver::{NodeTarget, ProvisionTarget, PvcTarget, TargetBacking};
use crate::osd::status::{record_data, OrchestrationStatus};
use crate::osd::{cluster_owner_reference, encryption_secret_name, envs, osd_err, prepare_job_name, status_record_name};
use crate::store::ObjectStore;
use reef_core::crd::{ReefCluster, RequiredMetadata};
use reef_core::labels::{canonical_labels, LABEL_KEY_FAILURE_DOMAIN, LABEL_KEY_RECORD};

/// Record-kind label value of prepare tasks.
pub const RECORD_PREPARE: &str = "prepare";
/// Record-kind label value of status records.
pub const RECORD_OSD_STATUS: &str = "osd-status";
/// Secret key holding the LUKS passphrase of an encrypted claim.
pub const DMCRYPT_KEY: &str = "dmcrypt-key";

/// The node label used to pin node-backed prepare tasks.
const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// A dispatched target whose status record is awaited.
pub struct AwaitedTarget {
    /// The originating provisioning target.
    pub target: ProvisionTarget,
    /// Name of the status record the prepare task reports through.
    pub record: String,
}

/// Dispatches prepare tasks for resolved provisioning targets.
pub struct Provisioner {
    store: Arc<dyn ObjectStore>,
}

impl Provisioner {
    /// Create a new instance.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Dispatch a prepare task per target, returning the awaited set.
    ///
    /// A target which fails to dispatch lands in `errors` and is excluded
    /// from the awaited set; the others proceed.
    #[tracing::instrument(level = "debug", skip_all, fields(cluster = cluster.name(), targets = targets.len()))]
    pub async fn dispatch(
        &self, cluster: &ReefCluster, targets: &[ProvisionTarget], replacement: Option<&OsdReplaceInfo>, errors: &mut Vec<anyhow::Error>,
    ) -> Vec<AwaitedTarget> {
        let mut awaited = Vec::new();
        for target in targets {
            match self.dispatch_target(cluster, target, replacement).await {
                Ok(record) => awaited.push(AwaitedTarget { target: target.clone(), record }),
                Err(err) => errors.push(err.context(format!("error dispatching prepare task for target {}", target.name))),
            }
        }
        awaited
    }

    async fn dispatch_target(&self, cluster: &ReefCluster, target: &ProvisionTarget, replacement: Option<&OsdReplaceInfo>) -> Result<String> {
        if target.is_encrypted() {
            self.ensure_encryption_secret(cluster, target).await?;
        }

        // Seed the status record before the task exists, so a consumer always
        // finds a record for every dispatched target.
        let record = status_record_name(&target.name);
        let map = status_record(cluster, &record, target);
        self.store.apply_config_map(map).await.context("error writing initial status record")?;

        let job = self.build_prepare_job(cluster, target, replacement)?;
        let name = job.metadata.name.clone().unwrap_or_default();
        // Prepare tasks are replaceable: a leftover task from an earlier pass
        // is deleted and recreated rather than reused, since its spec may be
        // stale.
        if self.store.get_job(&name).await?.is_some() {
            tracing::debug!(job = %name, "replacing leftover prepare task");
            self.store.delete_job(&name).await?;
        }
        self.store.create_job(job).await.context("error creating prepare task")?;
        tracing::info!(job = %name, target = %target.name, "dispatched prepare task");
        Ok(record)
    }

    /// Generate and persist the LUKS passphrase for an encrypted claim.
    ///
    /// An existing secret is left untouched; only rotation tasks replace it.
    async fn ensure_encryption_secret(&self, cluster: &ReefCluster, target: &ProvisionTarget) -> Result<()> {
        let name = encryption_secret_name(&target.name);
        if self.store.get_secret(&name).await?.is_some() {
            return Ok(());
        }
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let passphrase = base64::encode(key);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(cluster.namespace().to_string()),
                labels: Some(canonical_labels(cluster.name())),
                owner_references: Some(vec![cluster_owner_reference(cluster)]),
                ..Default::default()
            },
            string_data: Some(btreemap! { DMCRYPT_KEY.to_string() => passphrase }),
            ..Default::default()
        };
        self.store.apply_secret(secret).await.context("error writing encryption-key secret")?;
        tracing::info!(secret = %name, "generated encryption key for claim");
        Ok(())
    }

    fn build_prepare_job(&self, cluster: &ReefCluster, target: &ProvisionTarget, replacement: Option<&OsdReplaceInfo>) -> Result<Job> {
        let mut labels = canonical_labels(cluster.name());
        labels.insert(LABEL_KEY_RECORD.into(), RECORD_PREPARE.into());
        labels.insert(LABEL_KEY_FAILURE_DOMAIN.into(), target.name.clone());

        let mut env = match &target.backing {
            TargetBacking::Node(node) => envs::node_prepare_envs(cluster, node),
            TargetBacking::Pvc(pvc) => envs::pvc_prepare_envs(cluster, pvc),
        };
        if target.is_encrypted() {
            env.push(envs::env_from_secret(envs::ENV_DMCRYPT_SECRET, &encryption_secret_name(&target.name), DMCRYPT_KEY));
            env.extend(kms_envs(cluster));
        }
        // A planned replacement makes the prepare task wipe and rebuild the
        // named OSD instead of skipping the already-prepared device.
        if let Some(rep) = replacement {
            if rep.node == target.name {
                env.push(envs::env(envs::ENV_REPLACE_OSD, rep.id.to_string()));
            }
        }

        let pod_spec = match &target.backing {
            TargetBacking::Node(node) => self.node_prepare_pod(cluster, node, env)?,
            TargetBacking::Pvc(pvc) => self.pvc_prepare_pod(cluster, pvc, env)?,
        };

        Ok(Job {
            metadata: ObjectMeta {
                name: Some(prepare_job_name(&target.name)),
                namespace: Some(cluster.namespace().to_string()),
                labels: Some(labels.clone()),
                owner_references: Some(vec![cluster_owner_reference(cluster)]),
                ..Default::default()
            },
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn node_prepare_pod(&self, cluster: &ReefCluster, target: &NodeTarget, env: Vec<EnvVar>) -> Result<PodSpec> {
        use crate::osd::workload::{host_path_volume, mount, privileged};
        let data_dir = cluster.spec.require_data_dir_host_path().map_err(osd_err)?;
        let placement = cluster.spec.placement_for("prepare");
        Ok(PodSpec {
            restart_policy: Some("OnFailure".to_string()),
            node_selector: Some(btreemap! { HOSTNAME_LABEL.to_string() => target.node.name.clone() }),
            tolerations: placement.tolerations().map_err(osd_err)?,
            containers: vec![Container {
                name: "provision".to_string(),
                image: Some(cluster.spec.image.clone()),
                command: Some(vec!["osd-prepare".to_string()]),
                env: Some(env),
                volume_mounts: Some(vec![
                    mount("reef-data-dir", "/var/lib/ceph/osd"),
                    mount("devices", "/dev"),
                    mount("run-udev", "/run/udev"),
                ]),
                resources: {
                    let resources = cluster.spec.resources_for("prepare");
                    if resources.is_empty() { None } else { Some(resources.to_requirements()) }
                },
                security_context: Some(privileged()),
                ..Default::default()
            }],
            volumes: Some(vec![
                host_path_volume("reef-data-dir", data_dir),
                host_path_volume("devices", "/dev"),
                host_path_volume("run-udev", "/run/udev"),
            ]),
            ..Default::default()
        })
    }

    fn pvc_prepare_pod(&self, cluster: &ReefCluster, target: &PvcTarget, env: Vec<EnvVar>) -> Result<PodSpec> {
        use crate::osd::workload::{claim_volume, host_path_volume, mount, privileged};
        let mut volumes = vec![claim_volume("data-claim", &target.data_claim), host_path_volume("devices", "/dev")];
        let mut devices = vec![VolumeDevice {
            name: "data-claim".to_string(),
            device_path: format!("/{}", target.data_claim),
        }];
        if let Some(claim) = &target.metadata_claim {
            volumes.push(claim_volume("metadata-claim", claim));
            devices.push(VolumeDevice { name: "metadata-claim".to_string(), device_path: format!("/{}", claim) });
        }
        if let Some(claim) = &target.wal_claim {
            volumes.push(claim_volume("wal-claim", claim));
            devices.push(VolumeDevice { name: "wal-claim".to_string(), device_path: format!("/{}", claim) });
        }
        Ok(PodSpec {
            restart_policy: Some("OnFailure".to_string()),
            affinity: target.placement.affinity().map_err(osd_err)?,
            tolerations: target.placement.tolerations().map_err(osd_err)?,
            containers: vec![Container {
                name: "provision".to_string(),
                image: Some(cluster.spec.image.clone()),
                command: Some(vec!["osd-prepare".to_string()]),
                env: Some(env),
                volume_devices: Some(devices),
                volume_mounts: Some(vec![mount("devices", "/dev")]),
                resources: target.resources.as_ref().map(|res| res.to_requirements()),
                security_context: Some(privileged()),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        })
    }
}

/// KMS connection env vars for encrypted prepare tasks.
fn kms_envs(cluster: &ReefCluster) -> Vec<EnvVar> {
    let kms = &cluster.spec.security.key_management_service;
    if !kms.is_enabled() {
        return Vec::new();
    }
    let mut vars: Vec<EnvVar> = kms.connection_details.iter().map(|(key, val)| envs::env(key, val.clone())).collect();
    if let Some(token_secret) = kms.token_secret_name.as_deref().filter(|name| !name.is_empty()) {
        vars.push(envs::env_from_secret("VAULT_TOKEN", token_secret, "token"));
    }
    vars
}

/// Build the initial status record for a freshly dispatched target.
fn status_record(cluster: &ReefCluster, name: &str, target: &ProvisionTarget) -> k8s_openapi::api::core::v1::ConfigMap {
    let mut labels = canonical_labels(cluster.name());
    labels.insert(LABEL_KEY_RECORD.into(), RECORD_OSD_STATUS.into());
    labels.insert(LABEL_KEY_FAILURE_DOMAIN.into(), target.name.clone());
    let status = OrchestrationStatus::starting(target.is_pvc_backed());
    k8s_openapi::api::core::v1::ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(cluster.namespace().to_string()),
            labels: Some(labels),
            owner_references: Some(vec![cluster_owner_reference(cluster)]),
            ..Default::default()
        },
        data: Some(record_data(&status)),
        ..Default::default()
    }
}
