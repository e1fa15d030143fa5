//! Storage scope model.
//!
//! The storage scope declares which nodes, devices and block-volume sets the
//! cluster's OSDs are provisioned from. Node entries inherit any selection
//! field they leave empty from the cluster-wide scope.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::cluster::{Placement, ResourceSpec};

/// The default on-device storage format for new OSDs.
pub const DEFAULT_OSD_STORE: &str = "bluestore";
/// Confirmation string required before destructive backend-store migration.
pub const UPDATE_STORE_CONFIRMATION: &str = "yes-really-update-store";
/// Confirmation string required before destructive encryption migration.
pub const MIGRATE_OSDS_CONFIRMATION: &str = "yes-really-migrate-osds";

/// Node and device intent for the cluster's OSDs.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageScopeSpec {
    /// Enumerate all schedulable nodes instead of the declared node list.
    #[serde(default)]
    pub use_all_nodes: bool,
    /// Declared nodes, ignored when `useAllNodes` is set.
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Cluster-wide device selection, inherited by nodes which declare none.
    #[serde(flatten)]
    pub selection: Selection,
    /// Cluster-wide backend-store knobs, inherited per-key by nodes.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Block-volume device sets provisioned from volume-claim templates.
    #[serde(default)]
    pub storage_class_device_sets: Vec<StorageClassDeviceSet>,
    /// Backend-store type and migration confirmation.
    #[serde(default)]
    pub store: OsdStore,
    /// Destructive-migration confirmation for encryption changes.
    #[serde(default)]
    pub migration: MigrationSpec,
}

impl StorageScopeSpec {
    /// Indicates if the given node name is declared in the scope.
    pub fn node_exists(&self, name: &str) -> bool {
        self.nodes.iter().any(|node| node.name == name)
    }

    /// Resolve the named node against cluster-wide defaults.
    ///
    /// Returns `None` for undeclared nodes. Node-local selection fields win
    /// entirely over cluster-wide ones; config maps merge per-key with node
    /// keys winning.
    pub fn resolve_node(&self, name: &str) -> Option<Node> {
        let mut node = self.nodes.iter().find(|node| node.name == name)?.clone();
        if node.selection.use_all_devices.is_none() {
            node.selection.use_all_devices = self.selection.use_all_devices;
        }
        if node.selection.device_filter.is_empty() {
            node.selection.device_filter = self.selection.device_filter.clone();
        }
        if node.selection.device_path_filter.is_empty() {
            node.selection.device_path_filter = self.selection.device_path_filter.clone();
        }
        if node.selection.devices.is_empty() {
            node.selection.devices = self.selection.devices.clone();
        }
        if node.selection.directories.is_empty() {
            node.selection.directories = self.selection.directories.clone();
        }
        if node.selection.volume_claim_templates.is_empty() {
            node.selection.volume_claim_templates = self.selection.volume_claim_templates.clone();
        }
        for (key, val) in &self.config {
            node.config.entry(key.clone()).or_insert_with(|| val.clone());
        }
        Some(node)
    }

    /// Indicates if any node or the cluster scope asks for all devices.
    pub fn any_use_all_devices(&self) -> bool {
        self.selection.get_use_all_devices() || self.nodes.iter().any(|node| node.selection.get_use_all_devices())
    }

    /// Indicates if OSDs are provisioned from block-volume device sets.
    pub fn is_on_pvc(&self) -> bool {
        !self.storage_class_device_sets.is_empty()
    }

    /// Indicates if any device set asks for encryption.
    pub fn is_on_pvc_encrypted(&self) -> bool {
        self.storage_class_device_sets.iter().any(|set| set.encrypted)
    }

    /// The declared backend-store type, defaulting to `bluestore`.
    pub fn store_type(&self) -> &str {
        if self.store.store_type.is_empty() {
            DEFAULT_OSD_STORE
        } else {
            &self.store.store_type
        }
    }
}

/// A single declared node of the storage scope.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Kubernetes node name, or its hostname label value.
    pub name: String,
    /// Crush location override for this node's OSDs, `key=value` pairs.
    #[serde(default)]
    pub location: Option<String>,
    /// Node-local backend-store knobs, merged per-key over cluster config.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Node-local device selection.
    #[serde(flatten)]
    pub selection: Selection,
    /// Node-local resource overrides for the OSD daemons.
    #[serde(default)]
    pub resources: Option<ResourceSpec>,
}

/// Device selection fields shared by the cluster scope and nodes.
///
/// At most one selection mechanism is honored, in priority order: explicit
/// devices, name filter, path filter, use-all-devices.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    /// Consume every eligible device found on the node.
    #[serde(default)]
    pub use_all_devices: Option<bool>,
    /// Regular expression matched against device names.
    #[serde(default)]
    pub device_filter: String,
    /// Regular expression matched against device udev paths.
    #[serde(default)]
    pub device_path_filter: String,
    /// Explicitly named devices.
    #[serde(default)]
    pub devices: Vec<Device>,
    /// Host directories backing directory-based OSDs.
    #[serde(default)]
    pub directories: Vec<String>,
    /// Claim templates for node-local PVC-backed OSDs.
    #[serde(default)]
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,
}

impl Selection {
    /// The use-all-devices flag, defaulting to false when unset.
    pub fn get_use_all_devices(&self) -> bool {
        self.use_all_devices.unwrap_or(false)
    }
}

/// A single explicitly declared device.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Device name, e.g. `sda`.
    #[serde(default)]
    pub name: String,
    /// Full device path, e.g. `/dev/disk/by-id/...`, preferred over `name` when set.
    #[serde(default)]
    pub full_path: String,
    /// Per-device provisioning knobs (osdsPerDevice, metadataDevice, ...).
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// A set of identical PVC-backed OSDs provisioned from claim templates.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassDeviceSet {
    /// Set name, a component of every claim name in the set.
    pub name: String,
    /// Desired number of OSDs in the set.
    pub count: u32,
    /// Allow the OSDs to reschedule freely. When false each daemon is pinned
    /// to the node its claim was first bound on.
    #[serde(default)]
    pub portable: bool,
    /// Encrypt the backing block devices with a per-OSD LUKS key.
    #[serde(default)]
    pub encrypted: bool,
    /// Crush device class override for the set's OSDs.
    #[serde(default)]
    pub device_class: Option<String>,
    /// Placement constraints for the set's OSD pods.
    #[serde(default)]
    pub placement: Placement,
    /// Resource requests/limits for the set's OSD pods.
    #[serde(default)]
    pub resources: Option<ResourceSpec>,
    /// Claim templates, one named `data` required, `metadata` and `wal` optional.
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,
}

impl StorageClassDeviceSet {
    /// The claim template with the given name, if declared.
    pub fn template(&self, name: &str) -> Option<&VolumeClaimTemplate> {
        self.volume_claim_templates.iter().find(|tpl| tpl.name == name)
    }
}

/// A volume-claim template from which per-index claims are created.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimTemplate {
    /// Template name: `data`, `metadata` or `wal`.
    pub name: String,
    /// Storage class for the claims.
    #[serde(default)]
    pub storage_class_name: Option<String>,
    /// Claim access modes, defaults to `ReadWriteOnce`.
    #[serde(default)]
    pub access_modes: Vec<String>,
    /// Requested capacity, e.g. `10Gi`.
    pub storage: String,
}

/// Confirmation knob for destructive encryption migration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSpec {
    /// Exact confirmation string enabling destructive OSD migration.
    #[serde(default)]
    pub confirmation: String,
}

impl MigrationSpec {
    /// Indicates if the user has confirmed destructive migration.
    pub fn confirmed(&self) -> bool {
        self.confirmation == MIGRATE_OSDS_CONFIRMATION
    }
}

/// Backend-store type and the migration confirmation knob.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OsdStore {
    /// Desired on-device storage format.
    #[serde(default, rename = "type")]
    pub store_type: String,
    /// Exact confirmation string enabling destructive store migration.
    #[serde(default)]
    pub update_store: String,
}

impl OsdStore {
    /// Indicates if the user has confirmed destructive store migration.
    pub fn update_confirmed(&self) -> bool {
        self.update_store == UPDATE_STORE_CONFIRMATION
    }
}
