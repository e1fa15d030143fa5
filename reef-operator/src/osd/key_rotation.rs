//! Key-rotation scheduling for encrypted OSDs.
//!
//! Each encrypted, PVC-backed OSD gets a cron job which re-keys its LUKS
//! device in place on the declared schedule. The job must run on the same
//! host as the daemon to reach the device mapping, so it is pinned via pod
//! affinity onto the daemon's pod. Disabling rotation tears every job down.

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobTemplateSpec, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, PodAffinity, PodAffinityTerm, PodSpec, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use maplit::btreemap;

use crate::osd::provision::DMCRYPT_KEY;
use crate::osd::{encryption_secret_name, envs, key_rotation_job_name, osd_workload_selector, record_selector, workload};
use crate::store::ObjectStore;
use reef_core::crd::{ReefCluster, RequiredMetadata};
use reef_core::labels::{canonical_labels, LABEL_KEY_OSD_ID, LABEL_KEY_RECORD};

/// Record-kind label value of key-rotation cron jobs.
pub const RECORD_KEY_ROTATION: &str = "key-rotation";

/// The node label used to co-locate rotation jobs with their daemon.
const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Reconcile the key-rotation cron jobs against the current OSD population.
#[tracing::instrument(level = "debug", skip_all, fields(cluster = cluster.name()))]
pub async fn reconcile_key_rotation(cluster: &ReefCluster, store: &dyn ObjectStore) -> Result<()> {
    let selector = record_selector(cluster.name(), RECORD_KEY_ROTATION);
    let existing_jobs = store.list_cron_jobs(&selector).await.context("error listing key-rotation jobs")?;

    let rotation = &cluster.spec.security.key_rotation;
    if !rotation.enabled {
        for job in &existing_jobs {
            let name = job.metadata.name.clone().unwrap_or_default();
            tracing::info!(job = %name, "key rotation disabled, deleting rotation job");
            store.delete_cron_job(&name).await?;
        }
        return Ok(());
    }

    let deployments = store
        .list_deployments(&osd_workload_selector(cluster.name()))
        .await
        .context("error listing workloads for key rotation")?;
    let mut desired = std::collections::HashSet::new();
    for deployment in &deployments {
        let labels = match workload::extract_osd_labels(deployment) {
            Ok(labels) => labels,
            Err(_) => continue,
        };
        // Only encrypted PVC-backed daemons hold a rotatable key.
        if !labels.encrypted || labels.pvc.is_none() {
            continue;
        }
        let job = build_rotation_job(cluster, deployment, labels.id, rotation.schedule())?;
        let name = job.metadata.name.clone().unwrap_or_default();
        store.apply_cron_job(job).await.with_context(|| format!("error applying rotation job for osd {}", labels.id))?;
        desired.insert(name);
    }

    // Jobs whose daemon is gone, or no longer encrypted, are torn down.
    for job in &existing_jobs {
        let name = job.metadata.name.clone().unwrap_or_default();
        if !desired.contains(&name) {
            tracing::info!(job = %name, "deleting rotation job without a matching encrypted OSD");
            store.delete_cron_job(&name).await?;
        }
    }
    Ok(())
}

/// Build the rotation cron job for one encrypted daemon.
fn build_rotation_job(cluster: &ReefCluster, deployment: &Deployment, id: i32, schedule: &str) -> Result<CronJob> {
    let mut labels = canonical_labels(cluster.name());
    labels.insert(LABEL_KEY_RECORD.into(), RECORD_KEY_ROTATION.into());
    labels.insert(LABEL_KEY_OSD_ID.into(), id.to_string());

    Ok(CronJob {
        metadata: ObjectMeta {
            name: Some(key_rotation_job_name(id)),
            namespace: Some(cluster.namespace().to_string()),
            labels: Some(labels.clone()),
            // The rotation job follows its daemon's lifecycle, not the
            // cluster's: deleting the deployment garbage-collects the job.
            owner_references: Some(vec![deployment_owner_reference(deployment)?]),
            ..Default::default()
        },
        spec: Some(CronJobSpec {
            schedule: schedule.to_string(),
            concurrency_policy: Some("Forbid".to_string()),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(JobSpec {
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(labels),
                            ..Default::default()
                        }),
                        spec: Some(rotation_pod(cluster, deployment, id)?),
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// The pod rotating one daemon's LUKS key in place.
fn rotation_pod(cluster: &ReefCluster, deployment: &Deployment, id: i32) -> Result<PodSpec> {
    use crate::osd::workload::{host_path_volume, mount, privileged};
    let claims = claim_names(deployment);
    let secret = encryption_secret_name(claims.first().map(String::as_str).unwrap_or_default());

    let mut env: Vec<EnvVar> = vec![envs::env_from_secret(envs::ENV_DMCRYPT_SECRET, &secret, DMCRYPT_KEY)];
    // Device order matters to the rotation tool: data, then metadata, then wal.
    env.push(envs::env("ROOK_ROTATION_DEVICES", claims.join(",")));
    let kms = &cluster.spec.security.key_management_service;
    if kms.is_enabled() {
        env.extend(kms.connection_details.iter().map(|(key, val)| envs::env(key, val.clone())));
        if let Some(token_secret) = kms.token_secret_name.as_deref().filter(|name| !name.is_empty()) {
            env.push(envs::env_from_secret("VAULT_TOKEN", token_secret, "token"));
        }
    }

    Ok(PodSpec {
        restart_policy: Some("OnFailure".to_string()),
        // Pin onto the daemon's host; the device mapping only exists there.
        affinity: Some(Affinity {
            pod_affinity: Some(PodAffinity {
                required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                    label_selector: Some(LabelSelector {
                        match_labels: Some(btreemap! { LABEL_KEY_OSD_ID.to_string() => id.to_string() }),
                        match_expressions: None,
                    }),
                    topology_key: HOSTNAME_LABEL.to_string(),
                    ..Default::default()
                }]),
                preferred_during_scheduling_ignored_during_execution: None,
            }),
            ..Default::default()
        }),
        host_ipc: Some(true),
        containers: vec![Container {
            name: "key-rotation".to_string(),
            image: Some(cluster.spec.image.clone()),
            command: Some(vec!["key-rotate".to_string()]),
            env: Some(env),
            volume_mounts: Some(vec![mount("devices", "/dev"), mount("run-udev", "/run/udev")]),
            security_context: Some(privileged()),
            ..Default::default()
        }],
        volumes: Some(vec![host_path_volume("devices", "/dev"), host_path_volume("run-udev", "/run/udev")]),
        ..Default::default()
    })
}

/// The daemon's claim names in device order: data, metadata, wal.
fn claim_names(deployment: &Deployment) -> Vec<String> {
    let volumes = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .and_then(|pod| pod.volumes.as_ref());
    let claim_of = |volume: &str| -> Option<String> {
        volumes?
            .iter()
            .find(|vol| vol.name == volume)
            .and_then(|vol| vol.persistent_volume_claim.as_ref())
            .map(|src| src.claim_name.clone())
    };
    ["data-claim", "metadata-claim", "wal-claim"].iter().filter_map(|name| claim_of(name)).collect()
}

/// Owner reference onto the daemon deployment.
fn deployment_owner_reference(deployment: &Deployment) -> Result<OwnerReference> {
    let name = deployment.metadata.name.clone().context("deployment is missing its name")?;
    Ok(OwnerReference {
        api_version: "apps/v1".into(),
        kind: "Deployment".into(),
        name,
        uid: deployment.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}
