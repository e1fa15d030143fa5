//! OSD daemon workload construction.
//!
//! Builds the deployment running one prepared OSD, and recovers typed OSD
//! information back out of live deployments. The deployment is the durable
//! record of an OSD's identity: its labels carry the [`OsdLabels`] set and
//! its container env carries the prepare output, so a fresh reconcile can
//! rebuild its full picture of the population from the workload list alone.

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, HostPathVolumeSource, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, SecurityContext,
    Volume, VolumeDevice, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use maplit::btreemap;

use crate::osd::resolver::{self, ProvisionTarget, PvcTarget, TargetBacking};
use crate::osd::{cluster_owner_reference, envs, osd_deployment_name, osd_err, OsdInfo};
use reef_core::crd::{require_name_and_interface, ReefCluster, RequiredMetadata};
use reef_core::labels::{
    OsdLabels, APP_NAME, LABEL_KEY_APP, LABEL_KEY_CLUSTER, LABEL_KEY_OSD_ID,
};
use reef_core::OsdError;

/// The node label used to pin non-portable daemons.
const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
/// The pod annotation consumed by the multus network plugin.
const MULTUS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";

const OSD_CONTAINER: &str = "osd";
const ACTIVATE_CONTAINER: &str = "activate";
const BLKDEVMAPPER_CONTAINER: &str = "blkdevmapper";
const ENCRYPTION_OPEN_CONTAINER: &str = "encryption-open";
const ENCRYPTION_MAPPER_CONTAINER: &str = "blkdevmapper-encryption";
const EXPAND_CONTAINER: &str = "expand-bluefs";
const CHOWN_CONTAINER: &str = "chown-container-data-dir";

const DATA_DIR_VOLUME: &str = "reef-data-dir";
const DEVICES_VOLUME: &str = "devices";
const UDEV_VOLUME: &str = "run-udev";
const BRIDGE_VOLUME: &str = "bridge";
const DATA_CLAIM_VOLUME: &str = "data-claim";
const METADATA_CLAIM_VOLUME: &str = "metadata-claim";
const WAL_CLAIM_VOLUME: &str = "wal-claim";

const DATA_DIR_MOUNT: &str = "/var/lib/ceph/osd";
const BRIDGE_MOUNT: &str = "/mnt";

/// Build the typed label set for an OSD created from the given target.
pub fn osd_labels(cluster: &ReefCluster, target: &ProvisionTarget, info: &OsdInfo) -> OsdLabels {
    let cephx_key_generation = cluster.spec.security.cephx.desired_generation();
    match &target.backing {
        TargetBacking::Node(node) => OsdLabels {
            id: info.id,
            cluster: cluster.name().to_string(),
            failure_domain: node.node.name.clone(),
            portable: false,
            encrypted: false,
            store_type: info.store.clone(),
            device_class: info.device_class.clone(),
            device_set: None,
            pvc: None,
            cephx_key_generation,
        },
        TargetBacking::Pvc(pvc) => OsdLabels {
            id: info.id,
            cluster: cluster.name().to_string(),
            failure_domain: pvc.data_claim.clone(),
            portable: pvc.portable,
            encrypted: pvc.encrypted,
            store_type: info.store.clone(),
            device_class: if info.device_class.is_empty() {
                pvc.device_class.clone().unwrap_or_default()
            } else {
                info.device_class.clone()
            },
            device_set: Some(pvc.device_set.clone()),
            pvc: Some(pvc.data_claim.clone()),
            cephx_key_generation,
        },
    }
}

/// Build the daemon deployment for one prepared OSD.
#[tracing::instrument(level = "debug", skip_all, fields(osd = info.id))]
pub fn build_deployment(cluster: &ReefCluster, target: &ProvisionTarget, info: &OsdInfo) -> Result<Deployment> {
    let labels = osd_labels(cluster, target, info);
    let name = osd_deployment_name(info.id);
    let label_map = labels.to_labels();
    // The selector is immutable after creation; keep it to the minimal
    // stable subset so label additions never orphan the pods.
    let selector_labels = btreemap! {
        LABEL_KEY_APP.to_string() => APP_NAME.to_string(),
        LABEL_KEY_CLUSTER.to_string() => labels.cluster.clone(),
        LABEL_KEY_OSD_ID.to_string() => labels.id.to_string(),
    };

    let mut pod_spec = match &target.backing {
        TargetBacking::Node(_) => node_pod_spec(cluster, info)?,
        TargetBacking::Pvc(pvc) => pvc_pod_spec(cluster, pvc, info)?,
    };
    apply_placement(cluster, target, &mut pod_spec)?;
    apply_network(cluster, &mut pod_spec)?;
    pin_to_node(target, info, &mut pod_spec);

    let mut annotations = std::collections::BTreeMap::new();
    if cluster.spec.network.is_multus() {
        annotations.insert(MULTUS_ANNOTATION.to_string(), multus_networks(cluster)?);
    }

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(cluster.namespace().to_string()),
            labels: Some(label_map.clone()),
            owner_references: Some(vec![cluster_owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            // An OSD holds an exclusive device lock, so the old pod must be
            // fully gone before its successor starts.
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                rolling_update: None,
            }),
            selector: LabelSelector {
                match_labels: Some(selector_labels),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(label_map),
                    annotations: if annotations.is_empty() { None } else { Some(annotations) },
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// The pod spec for an OSD backed by node-local devices.
fn node_pod_spec(cluster: &ReefCluster, info: &OsdInfo) -> Result<PodSpec> {
    let data_dir = cluster.spec.require_data_dir_host_path().map_err(osd_err)?;
    let volumes = vec![
        host_path_volume(DATA_DIR_VOLUME, data_dir),
        host_path_volume(DEVICES_VOLUME, "/dev"),
        host_path_volume(UDEV_VOLUME, "/run/udev"),
    ];
    let mounts = vec![
        mount(DATA_DIR_VOLUME, DATA_DIR_MOUNT),
        mount(DEVICES_VOLUME, "/dev"),
        mount(UDEV_VOLUME, "/run/udev"),
    ];
    Ok(PodSpec {
        init_containers: Some(vec![
            activate_container(cluster, info, mounts.clone()),
            chown_container(cluster, mounts.clone()),
        ]),
        containers: vec![osd_container(cluster, info, mounts)],
        volumes: Some(volumes),
        ..Default::default()
    })
}

/// The pod spec for an OSD backed by a block-volume claim.
///
/// Raw block claims cannot be mounted directly, so an init chain copies the
/// device nodes into a shared memory-backed bridge that the daemon container
/// then consumes. Encrypted claims add a LUKS-open step in front.
fn pvc_pod_spec(cluster: &ReefCluster, pvc: &PvcTarget, info: &OsdInfo) -> Result<PodSpec> {
    let mut volumes = vec![
        Volume {
            name: BRIDGE_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                size_limit: None,
            }),
            ..Default::default()
        },
        host_path_volume(DEVICES_VOLUME, "/dev"),
        host_path_volume(UDEV_VOLUME, "/run/udev"),
        claim_volume(DATA_CLAIM_VOLUME, &pvc.data_claim),
    ];
    let mut init_containers = vec![blkdevmapper_container(cluster, BLKDEVMAPPER_CONTAINER, DATA_CLAIM_VOLUME, &pvc.data_claim)];
    if pvc.encrypted {
        init_containers.push(encryption_open_container(cluster, &pvc.data_claim));
        init_containers.push(encryption_mapper_container(cluster, &pvc.data_claim));
    }
    if let Some(claim) = &pvc.metadata_claim {
        volumes.push(claim_volume(METADATA_CLAIM_VOLUME, claim));
        init_containers.push(blkdevmapper_container(cluster, "blkdevmapper-metadata", METADATA_CLAIM_VOLUME, claim));
    }
    if let Some(claim) = &pvc.wal_claim {
        volumes.push(claim_volume(WAL_CLAIM_VOLUME, claim));
        init_containers.push(blkdevmapper_container(cluster, "blkdevmapper-wal", WAL_CLAIM_VOLUME, claim));
    }

    let mounts = vec![
        mount(BRIDGE_VOLUME, BRIDGE_MOUNT),
        mount(DEVICES_VOLUME, "/dev"),
        mount(UDEV_VOLUME, "/run/udev"),
    ];
    init_containers.push(activate_container(cluster, info, mounts.clone()));
    if !pvc.encrypted {
        // Expansion tooling cannot grow a mapped LUKS device in place.
        init_containers.push(expand_container(cluster, info, mounts.clone()));
    }
    init_containers.push(chown_container(cluster, mounts.clone()));

    Ok(PodSpec {
        init_containers: Some(init_containers),
        containers: vec![osd_container(cluster, info, mounts)],
        volumes: Some(volumes),
        // The bridge device nodes must stay visible across containers.
        host_ipc: Some(true),
        ..Default::default()
    })
}

/// Merge declared placement, tolerations and spread constraints into the pod.
fn apply_placement(cluster: &ReefCluster, target: &ProvisionTarget, pod: &mut PodSpec) -> Result<()> {
    let placement = match &target.backing {
        TargetBacking::Node(_) => cluster.spec.placement_for("osd"),
        // Device-set placement wins wholesale over the role default when any
        // of its blocks is declared.
        TargetBacking::Pvc(pvc) => {
            let set_placement = &pvc.placement;
            if set_placement.node_affinity.is_some()
                || set_placement.pod_affinity.is_some()
                || set_placement.pod_anti_affinity.is_some()
                || set_placement.tolerations.is_some()
                || set_placement.topology_spread_constraints.is_some()
            {
                set_placement.clone()
            } else {
                cluster.spec.placement_for("osd")
            }
        }
    };
    pod.affinity = placement.affinity().map_err(osd_err)?;
    pod.tolerations = placement.tolerations().map_err(osd_err)?;
    pod.topology_spread_constraints = placement.topology_spread_constraints().map_err(osd_err)?;
    Ok(())
}

/// Apply host-network settings to the pod.
fn apply_network(cluster: &ReefCluster, pod: &mut PodSpec) -> Result<()> {
    if cluster.spec.network.is_host() {
        pod.host_network = Some(true);
        pod.dns_policy = Some("ClusterFirstWithHostNet".to_string());
    }
    Ok(())
}

/// Render the multus annotation value from the declared selectors.
///
/// Selector validation happens here, at workload-build time, so a malformed
/// selector fails the target instead of producing a pod multus rejects.
fn multus_networks(cluster: &ReefCluster) -> Result<String> {
    let mut networks = Vec::new();
    for role in ["public", "cluster"] {
        if let Some(parsed) = cluster.spec.network.multus_selector(role, Some(require_name_and_interface)) {
            networks.push(parsed.map_err(osd_err)?.to_string());
        }
    }
    if networks.is_empty() {
        return Err(osd_err(OsdError::Configuration("multus provider selected but no network selectors declared".into())));
    }
    Ok(networks.join(", "))
}

/// Pin the daemon to its node unless it is a portable PVC-backed OSD.
fn pin_to_node(target: &ProvisionTarget, info: &OsdInfo, pod: &mut PodSpec) {
    let portable = match &target.backing {
        TargetBacking::Node(_) => false,
        TargetBacking::Pvc(pvc) => pvc.portable,
    };
    if !portable && !info.node.is_empty() {
        pod.node_selector = Some(btreemap! { HOSTNAME_LABEL.to_string() => info.node.clone() });
    }
}

fn osd_container(cluster: &ReefCluster, info: &OsdInfo, mounts: Vec<VolumeMount>) -> Container {
    Container {
        name: OSD_CONTAINER.to_string(),
        image: Some(cluster.spec.image.clone()),
        command: Some(vec!["ceph-osd".to_string()]),
        args: Some(vec![
            "--foreground".to_string(),
            "--id".to_string(),
            info.id.to_string(),
            "--osd-uuid".to_string(),
            info.uuid.clone(),
        ]),
        env: Some(envs::daemon_envs(cluster, info)),
        volume_mounts: Some(mounts),
        resources: {
            let resources = cluster.spec.resources_for("osd");
            if resources.is_empty() { None } else { Some(resources.to_requirements()) }
        },
        security_context: Some(privileged()),
        ..Default::default()
    }
}

/// Init container activating the prepared OSD into the container data dir.
fn activate_container(cluster: &ReefCluster, info: &OsdInfo, mounts: Vec<VolumeMount>) -> Container {
    Container {
        name: ACTIVATE_CONTAINER.to_string(),
        image: Some(cluster.spec.image.clone()),
        command: Some(vec!["ceph-volume".to_string()]),
        args: Some(vec![
            info.cv_mode.clone(),
            "activate".to_string(),
            "--no-systemd".to_string(),
            info.id.to_string(),
            info.uuid.clone(),
        ]),
        env: Some(envs::daemon_envs(cluster, info)),
        volume_mounts: Some(mounts),
        security_context: Some(privileged()),
        ..Default::default()
    }
}

/// Init container copying a raw block device into the bridge volume.
fn blkdevmapper_container(cluster: &ReefCluster, name: &str, volume: &str, claim: &str) -> Container {
    Container {
        name: name.to_string(),
        image: Some(cluster.spec.image.clone()),
        command: Some(vec!["cp".to_string()]),
        args: Some(vec!["-a".to_string(), format!("/{}", claim), format!("{}/{}", BRIDGE_MOUNT, claim)]),
        volume_devices: Some(vec![VolumeDevice {
            name: volume.to_string(),
            device_path: format!("/{}", claim),
        }]),
        volume_mounts: Some(vec![mount(BRIDGE_VOLUME, BRIDGE_MOUNT)]),
        security_context: Some(privileged()),
        ..Default::default()
    }
}

/// Init container opening the LUKS mapping for an encrypted claim.
fn encryption_open_container(cluster: &ReefCluster, claim: &str) -> Container {
    let secret = crate::osd::encryption_secret_name(claim);
    Container {
        name: ENCRYPTION_OPEN_CONTAINER.to_string(),
        image: Some(cluster.spec.image.clone()),
        command: Some(vec!["bash".to_string(), "-c".to_string()]),
        args: Some(vec![format!(
            "cryptsetup luksOpen --disable-keyring {bridge}/{claim} {claim}-dmcrypt --key-file <(echo -n \"$CEPH_VOLUME_DMCRYPT_SECRET\")",
            bridge = BRIDGE_MOUNT,
            claim = claim,
        )]),
        env: Some(vec![envs::env_from_secret(envs::ENV_DMCRYPT_SECRET, &secret, crate::osd::provision::DMCRYPT_KEY)]),
        volume_mounts: Some(vec![mount(BRIDGE_VOLUME, BRIDGE_MOUNT), mount(DEVICES_VOLUME, "/dev")]),
        security_context: Some(privileged()),
        ..Default::default()
    }
}

/// Init container copying the opened LUKS mapping into the bridge volume.
///
/// Later steps consume the decrypted device through the bridge, the same
/// path they use for plain claims.
fn encryption_mapper_container(cluster: &ReefCluster, claim: &str) -> Container {
    Container {
        name: ENCRYPTION_MAPPER_CONTAINER.to_string(),
        image: Some(cluster.spec.image.clone()),
        command: Some(vec!["cp".to_string()]),
        args: Some(vec![
            "-a".to_string(),
            format!("/dev/mapper/{}-dmcrypt", claim),
            format!("{}/{}-dmcrypt", BRIDGE_MOUNT, claim),
        ]),
        volume_mounts: Some(vec![mount(BRIDGE_VOLUME, BRIDGE_MOUNT), mount(DEVICES_VOLUME, "/dev")]),
        security_context: Some(privileged()),
        ..Default::default()
    }
}

/// Init container growing the on-device store onto a resized claim.
fn expand_container(cluster: &ReefCluster, info: &OsdInfo, mounts: Vec<VolumeMount>) -> Container {
    Container {
        name: EXPAND_CONTAINER.to_string(),
        image: Some(cluster.spec.image.clone()),
        command: Some(vec!["ceph-bluestore-tool".to_string()]),
        args: Some(vec![
            "bluefs-bdev-expand".to_string(),
            "--path".to_string(),
            format!("{}/ceph-{}", DATA_DIR_MOUNT, info.id),
        ]),
        volume_mounts: Some(mounts),
        security_context: Some(privileged()),
        ..Default::default()
    }
}

fn chown_container(cluster: &ReefCluster, mounts: Vec<VolumeMount>) -> Container {
    Container {
        name: CHOWN_CONTAINER.to_string(),
        image: Some(cluster.spec.image.clone()),
        command: Some(vec!["chown".to_string()]),
        args: Some(vec!["--verbose".to_string(), "--recursive".to_string(), "ceph:ceph".to_string(), DATA_DIR_MOUNT.to_string()]),
        volume_mounts: Some(mounts),
        security_context: Some(privileged()),
        ..Default::default()
    }
}

pub(crate) fn privileged() -> SecurityContext {
    SecurityContext {
        privileged: Some(true),
        ..Default::default()
    }
}

pub(crate) fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: None,
        }),
        ..Default::default()
    }
}

pub(crate) fn claim_volume(name: &str, claim: &str) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            read_only: None,
        }),
        ..Default::default()
    }
}

pub(crate) fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

/// Parse the typed label set off a live OSD deployment.
pub fn extract_osd_labels(deployment: &Deployment) -> Result<OsdLabels, OsdError> {
    let labels = deployment.metadata.labels.clone().unwrap_or_default();
    OsdLabels::from_labels(&labels)
}

/// Recover the prepare output baked into a live OSD deployment.
pub fn extract_osd_info(deployment: &Deployment) -> Result<OsdInfo> {
    let labels = extract_osd_labels(deployment).map_err(osd_err)?;
    let container = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map(|pod| pod.containers.as_slice())
        .unwrap_or_default()
        .iter()
        .find(|container| container.name == OSD_CONTAINER)
        .context("deployment has no osd container")?;
    let env = |name: &str| -> String {
        container
            .env
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|var| var.name == name)
            .and_then(|var| var.value.clone())
            .unwrap_or_default()
    };
    Ok(OsdInfo {
        id: labels.id,
        uuid: env(envs::ENV_OSD_UUID),
        block_path: env(envs::ENV_BLOCK_PATH),
        cv_mode: env(envs::ENV_CV_MODE),
        store: labels.store_type.clone(),
        device_class: labels.device_class.clone(),
        encrypted: labels.encrypted,
        node: env(envs::ENV_NODE_NAME),
        lv_backed_pv: env(envs::ENV_LV_BACKED_PV) == "true",
    })
}

/// Reconstruct the provisioning target behind a live OSD deployment.
///
/// Returns `None` when the OSD's node or device set has been removed from
/// the declared storage scope; such daemons are left exactly as they are.
pub fn target_for_existing(cluster: &ReefCluster, deployment: &Deployment) -> Result<Option<ProvisionTarget>> {
    let labels = extract_osd_labels(deployment).map_err(osd_err)?;
    let storage = &cluster.spec.storage;
    if let Some(pvc) = &labels.pvc {
        let set_name = labels.device_set.clone().unwrap_or_default();
        let set = match storage.storage_class_device_sets.iter().find(|set| set.name == set_name) {
            Some(set) => set,
            None => return Ok(None),
        };
        let claim_for = |volume: &str| -> Option<String> {
            deployment
                .spec
                .as_ref()
                .and_then(|spec| spec.template.spec.as_ref())
                .and_then(|pod| pod.volumes.as_ref())
                .and_then(|volumes| volumes.iter().find(|vol| vol.name == volume))
                .and_then(|vol| vol.persistent_volume_claim.as_ref())
                .map(|src| src.claim_name.clone())
        };
        return Ok(Some(ProvisionTarget {
            name: pvc.clone(),
            backing: TargetBacking::Pvc(PvcTarget {
                device_set: set.name.clone(),
                data_claim: pvc.clone(),
                metadata_claim: claim_for(METADATA_CLAIM_VOLUME),
                wal_claim: claim_for(WAL_CLAIM_VOLUME),
                portable: set.portable,
                encrypted: set.encrypted,
                device_class: set.device_class.clone(),
                placement: set.placement.clone(),
                resources: set.resources.clone(),
            }),
        }));
    }
    let node_name = labels.failure_domain.clone();
    let resolved = match resolver::resolve_declared_node(storage, &node_name) {
        Some(node) => node,
        None => return Ok(None),
    };
    let location = resolver::crush_location(&resolved);
    Ok(Some(ProvisionTarget {
        name: node_name,
        backing: TargetBacking::Node(resolver::NodeTarget { node: resolved, location }),
    }))
}
