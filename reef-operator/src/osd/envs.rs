//! Environment contract of the provisioning image.
//!
//! The prepare task and the daemon containers are configured entirely through
//! environment variables. The `ROOK_*` names are the wire contract of the
//! provisioning image and must not be renamed.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, ObjectFieldSelector, SecretKeySelector};

use crate::osd::resolver::{NodeTarget, PvcTarget};
use crate::osd::OsdInfo;
use reef_core::crd::{Node, ReefCluster, RequiredMetadata};

pub const ENV_NODE_NAME: &str = "ROOK_NODE_NAME";
pub const ENV_CLUSTER_ID: &str = "ROOK_CLUSTER_ID";
pub const ENV_CLUSTER_NAME: &str = "ROOK_CLUSTER_NAME";
pub const ENV_POD_NAMESPACE: &str = "ROOK_POD_NAMESPACE";
pub const ENV_CONFIG_DIR: &str = "ROOK_CONFIG_DIR";
pub const ENV_CRUSHMAP_HOSTNAME: &str = "ROOK_CRUSHMAP_HOSTNAME";
pub const ENV_CRUSH_LOCATION: &str = "ROOK_CRUSHMAP_LOCATION";
pub const ENV_OSD_STORE_TYPE: &str = "ROOK_OSD_STORE_TYPE";
pub const ENV_DATA_DEVICES: &str = "ROOK_DATA_DEVICES";
pub const ENV_DATA_DEVICE_FILTER: &str = "ROOK_DATA_DEVICE_FILTER";
pub const ENV_DATA_DEVICE_PATH_FILTER: &str = "ROOK_DATA_DEVICE_PATH_FILTER";
pub const ENV_USE_ALL_DEVICES: &str = "ROOK_USE_ALL_DEVICES";
pub const ENV_PVC_BACKED_OSD: &str = "ROOK_PVC_BACKED_OSD";
pub const ENV_PVC_NAME: &str = "ROOK_PVC_NAME";
pub const ENV_METADATA_DEVICE: &str = "ROOK_METADATA_DEVICE";
pub const ENV_WAL_DEVICE: &str = "ROOK_WAL_DEVICE";
pub const ENV_CRUSH_DEVICE_CLASS: &str = "ROOK_OSD_CRUSH_DEVICE_CLASS";
pub const ENV_ENCRYPTED_DEVICE: &str = "ROOK_ENCRYPTED_DEVICE";
pub const ENV_REPLACE_OSD: &str = "ROOK_REPLACE_OSD";
pub const ENV_OSD_DATABASE_SIZE: &str = "ROOK_OSD_DATABASE_SIZE";
pub const ENV_OSD_WAL_SIZE: &str = "ROOK_OSD_WAL_SIZE";
pub const ENV_OSDS_PER_DEVICE: &str = "ROOK_OSDS_PER_DEVICE";
pub const ENV_CRUSHMAP_ROOT: &str = "ROOK_CRUSHMAP_ROOT";
pub const ENV_LV_BACKED_PV: &str = "ROOK_LV_BACKED_PV";
pub const ENV_OSD_ID: &str = "ROOK_OSD_ID";
pub const ENV_OSD_UUID: &str = "ROOK_OSD_UUID";
pub const ENV_BLOCK_PATH: &str = "ROOK_BLOCK_PATH";
pub const ENV_CV_MODE: &str = "ROOK_CV_MODE";
/// Read by the device-management tool itself when encrypting raw devices.
/// Hardcoded in that tool, do not rename.
pub const ENV_DMCRYPT_SECRET: &str = "CEPH_VOLUME_DMCRYPT_SECRET";

/// Backend-store knob keys recognized in the scope's `config` maps.
const CONFIG_DATABASE_SIZE: &str = "databaseSizeMB";
const CONFIG_WAL_SIZE: &str = "walSizeMB";
const CONFIG_OSDS_PER_DEVICE: &str = "osdsPerDevice";
const CONFIG_CRUSH_ROOT: &str = "crushRoot";

/// Build a plain-value env var.
pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar { name: name.to_string(), value: Some(value.into()), value_from: None }
}

/// Build an env var sourcing its value from a secret key.
pub fn env_from_secret(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
    }
}

/// Build an env var sourcing its value from the pod's own metadata.
pub fn env_from_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector { field_path: field_path.to_string(), api_version: None }),
            ..Default::default()
        }),
    }
}

/// Env vars shared by every container talking to the provisioning image.
fn common_envs(cluster: &ReefCluster) -> Vec<EnvVar> {
    use kube::Resource;
    vec![
        env(ENV_CLUSTER_ID, cluster.meta().uid.clone().unwrap_or_default()),
        env(ENV_CLUSTER_NAME, cluster.name()),
        env(ENV_POD_NAMESPACE, cluster.namespace()),
        env(ENV_CONFIG_DIR, cluster.spec.data_dir_host_path.clone().unwrap_or_else(|| "/var/lib/reef".into())),
        // Device-management tooling switches; LVM manages /dev nodes itself.
        env("CEPH_VOLUME_DEBUG", "1"),
        env("CEPH_VOLUME_SKIP_RESTORECON", "1"),
        env("DM_DISABLE_UDEV", "1"),
    ]
}

/// Env vars of a prepare task scanning a node's local devices.
pub fn node_prepare_envs(cluster: &ReefCluster, target: &NodeTarget) -> Vec<EnvVar> {
    let mut envs = common_envs(cluster);
    let node = &target.node;
    envs.push(env(ENV_NODE_NAME, node.name.clone()));
    envs.push(env(ENV_CRUSHMAP_HOSTNAME, node.name.clone()));
    envs.push(env(ENV_CRUSH_LOCATION, target.location.clone()));
    envs.push(env(ENV_OSD_STORE_TYPE, cluster.spec.storage.store_type()));
    envs.push(env(ENV_PVC_BACKED_OSD, "false"));
    envs.extend(selection_envs(node));
    envs.extend(store_config_envs(&node.config));
    envs
}

/// Env vars of a prepare task consuming a block-volume claim.
pub fn pvc_prepare_envs(cluster: &ReefCluster, target: &PvcTarget) -> Vec<EnvVar> {
    let mut envs = common_envs(cluster);
    envs.push(env(ENV_OSD_STORE_TYPE, cluster.spec.storage.store_type()));
    envs.push(env(ENV_PVC_BACKED_OSD, "true"));
    envs.push(env(ENV_PVC_NAME, target.data_claim.clone()));
    // Portable claims use the claim name as their failure domain; pinned
    // claims only learn their host from inside the prepare pod.
    let crushmap_hostname = if target.portable { target.data_claim.clone() } else { String::new() };
    envs.push(env(ENV_CRUSHMAP_HOSTNAME, crushmap_hostname));
    if let Some(metadata) = &target.metadata_claim {
        envs.push(env(ENV_METADATA_DEVICE, metadata.clone()));
    }
    if let Some(wal) = &target.wal_claim {
        envs.push(env(ENV_WAL_DEVICE, wal.clone()));
    }
    if let Some(class) = &target.device_class {
        envs.push(env(ENV_CRUSH_DEVICE_CLASS, class.clone()));
    }
    if target.encrypted {
        envs.push(env(ENV_ENCRYPTED_DEVICE, "true"));
    }
    // Claim-backed targets carry a whole device each; of the store knobs
    // only the crush root applies.
    if let Some(root) = cluster.spec.storage.config.get(CONFIG_CRUSH_ROOT) {
        if !root.is_empty() {
            envs.push(env(ENV_CRUSHMAP_ROOT, root.clone()));
        }
    }
    envs
}

/// Env vars carrying the merged store-config knobs, empty values omitted.
fn store_config_envs(config: &BTreeMap<String, String>) -> Vec<EnvVar> {
    let knobs = [
        (CONFIG_DATABASE_SIZE, ENV_OSD_DATABASE_SIZE),
        (CONFIG_WAL_SIZE, ENV_OSD_WAL_SIZE),
        (CONFIG_OSDS_PER_DEVICE, ENV_OSDS_PER_DEVICE),
        (CONFIG_CRUSH_ROOT, ENV_CRUSHMAP_ROOT),
    ];
    knobs
        .iter()
        .filter_map(|(key, name)| match config.get(*key) {
            Some(value) if !value.is_empty() => Some(env(name, value.clone())),
            _ => None,
        })
        .collect()
}

/// Device-selection env vars from a resolved node's declared selection.
fn selection_envs(node: &Node) -> Vec<EnvVar> {
    let mut envs = Vec::new();
    if !node.selection.devices.is_empty() {
        let devices = node
            .selection
            .devices
            .iter()
            .map(|device| if device.full_path.is_empty() { device.name.clone() } else { device.full_path.clone() })
            .collect::<Vec<_>>()
            .join(",");
        envs.push(env(ENV_DATA_DEVICES, devices));
    } else if !node.selection.device_filter.is_empty() {
        envs.push(env(ENV_DATA_DEVICE_FILTER, node.selection.device_filter.clone()));
    } else if !node.selection.device_path_filter.is_empty() {
        envs.push(env(ENV_DATA_DEVICE_PATH_FILTER, node.selection.device_path_filter.clone()));
    } else if node.selection.get_use_all_devices() {
        envs.push(env(ENV_USE_ALL_DEVICES, "true"));
    }
    envs
}

/// Env vars of a daemon container running a prepared OSD.
pub fn daemon_envs(cluster: &ReefCluster, info: &OsdInfo) -> Vec<EnvVar> {
    let mut envs = common_envs(cluster);
    envs.push(env(ENV_OSD_ID, info.id.to_string()));
    envs.push(env(ENV_OSD_UUID, info.uuid.clone()));
    envs.push(env(ENV_BLOCK_PATH, info.block_path.clone()));
    envs.push(env(ENV_CV_MODE, info.cv_mode.clone()));
    envs.push(env(ENV_NODE_NAME, info.node.clone()));
    envs.push(env(ENV_LV_BACKED_PV, info.lv_backed_pv.to_string()));
    envs.push(env_from_field("ROOK_POD_NAME", "metadata.name"));
    envs
}
