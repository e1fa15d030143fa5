//! Canonical labelling scheme for OSD-owned records.
//!
//! Every durable record this operator creates carries the canonical labels,
//! and OSD workloads additionally carry the full [`OsdLabels`] set. All label
//! reads go through [`OsdLabels::from_labels`] so the rest of the codebase
//! never does raw string lookups.

use std::collections::BTreeMap;

use crate::error::OsdError;

/// Application name of this operator's OSD workloads.
pub const APP_NAME: &str = "reef-osd";

/// Label indicating the app to which a resource belongs.
pub const LABEL_KEY_APP: &str = "app";
/// Label indicating the component controlling a resource.
pub const LABEL_KEY_CONTROLLED_BY: &str = "reef.rs/controlled-by";
/// Label indicating the cluster to which a resource belongs.
pub const LABEL_KEY_CLUSTER: &str = "reef.rs/cluster";
/// Label carrying the integer OSD id.
pub const LABEL_KEY_OSD_ID: &str = "osd-id";
/// Label carrying the OSD's failure-domain value.
pub const LABEL_KEY_FAILURE_DOMAIN: &str = "failure-domain";
/// Label carrying the OSD's portability flag.
pub const LABEL_KEY_PORTABLE: &str = "portable";
/// Label carrying the OSD's encryption flag.
pub const LABEL_KEY_ENCRYPTED: &str = "encrypted";
/// Label carrying the OSD's backend-store type.
pub const LABEL_KEY_OSD_STORE: &str = "osd-store";
/// Label carrying the OSD's crush device class.
pub const LABEL_KEY_DEVICE_CLASS: &str = "device-class";
/// Label carrying the originating device-set name, PVC-backed OSDs only.
pub const LABEL_KEY_DEVICE_SET: &str = "reef.rs/device-set";
/// Label carrying the backing claim name, PVC-backed OSDs only.
pub const LABEL_KEY_PVC: &str = "reef.rs/pvc";
/// Label carrying the cephx key generation baked into the daemon.
pub const LABEL_KEY_CEPHX_KEY_GENERATION: &str = "cephx-key-generation";

/// Label naming the record kind of non-workload records (`osd-status`,
/// `prepare`, `key-rotation`).
pub const LABEL_KEY_RECORD: &str = "reef.rs/record";

/// Label carrying a device set claim's index within the set.
pub const LABEL_KEY_SET_INDEX: &str = "reef.rs/set-index";
/// Label carrying a device set claim's stable identity `<set>-<template>-<index>`.
pub const LABEL_KEY_DEVICE_SET_PVC_ID: &str = "reef.rs/device-set-pvc-id";

/// The canonical labels applied to every record this operator owns.
pub fn canonical_labels(cluster: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_KEY_APP.into(), APP_NAME.into());
    labels.insert(LABEL_KEY_CONTROLLED_BY.into(), "reef-operator".into());
    labels.insert(LABEL_KEY_CLUSTER.into(), cluster.into());
    labels
}

/// The typed label set carried by an OSD workload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OsdLabels {
    /// The stable integer OSD id.
    pub id: i32,
    /// The owning cluster's name.
    pub cluster: String,
    /// The OSD's failure-domain value (host name or claim name).
    pub failure_domain: String,
    /// Whether the daemon may reschedule freely.
    pub portable: bool,
    /// Whether the backing device is encrypted.
    pub encrypted: bool,
    /// The on-device storage format the daemon was prepared with.
    pub store_type: String,
    /// The OSD's crush device class.
    pub device_class: String,
    /// The originating device set, PVC-backed OSDs only.
    pub device_set: Option<String>,
    /// The backing claim name, PVC-backed OSDs only.
    pub pvc: Option<String>,
    /// The cephx key generation the daemon was last updated with.
    pub cephx_key_generation: u32,
}

impl OsdLabels {
    /// Render the full label map for an OSD workload.
    pub fn to_labels(&self) -> BTreeMap<String, String> {
        let mut labels = canonical_labels(&self.cluster);
        labels.insert(LABEL_KEY_OSD_ID.into(), self.id.to_string());
        labels.insert(LABEL_KEY_FAILURE_DOMAIN.into(), self.failure_domain.clone());
        labels.insert(LABEL_KEY_PORTABLE.into(), self.portable.to_string());
        labels.insert(LABEL_KEY_ENCRYPTED.into(), self.encrypted.to_string());
        labels.insert(LABEL_KEY_OSD_STORE.into(), self.store_type.clone());
        labels.insert(LABEL_KEY_DEVICE_CLASS.into(), self.device_class.clone());
        labels.insert(LABEL_KEY_CEPHX_KEY_GENERATION.into(), self.cephx_key_generation.to_string());
        if let Some(device_set) = &self.device_set {
            labels.insert(LABEL_KEY_DEVICE_SET.into(), device_set.clone());
        }
        if let Some(pvc) = &self.pvc {
            labels.insert(LABEL_KEY_PVC.into(), pvc.clone());
        }
        labels
    }

    /// Parse the typed label set from a workload's label map.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Result<Self, OsdError> {
        let id = labels
            .get(LABEL_KEY_OSD_ID)
            .ok_or_else(|| OsdError::Configuration(format!("workload is missing the {} label", LABEL_KEY_OSD_ID)))?
            .parse::<i32>()
            .map_err(|err| OsdError::Configuration(format!("workload carries a malformed {} label: {}", LABEL_KEY_OSD_ID, err)))?;
        let get = |key: &str| labels.get(key).cloned().unwrap_or_default();
        let get_bool = |key: &str| labels.get(key).map(|val| val == "true").unwrap_or(false);
        let cephx_key_generation = labels
            .get(LABEL_KEY_CEPHX_KEY_GENERATION)
            .and_then(|val| val.parse::<u32>().ok())
            .unwrap_or(0);
        Ok(Self {
            id,
            cluster: get(LABEL_KEY_CLUSTER),
            failure_domain: get(LABEL_KEY_FAILURE_DOMAIN),
            portable: get_bool(LABEL_KEY_PORTABLE),
            encrypted: get_bool(LABEL_KEY_ENCRYPTED),
            store_type: get(LABEL_KEY_OSD_STORE),
            device_class: get(LABEL_KEY_DEVICE_CLASS),
            device_set: labels.get(LABEL_KEY_DEVICE_SET).cloned(),
            pvc: labels.get(LABEL_KEY_PVC).cloned(),
            cephx_key_generation,
        })
    }
}
