//! ReefCluster CRD.
//!
//! The code here is used to generate the actual CRD used in K8s.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, ResourceRequirements, Toleration, TopologySpreadConstraint};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::network::NetworkSpec;
use crate::crd::security::SecuritySpec;
use crate::crd::storage::StorageScopeSpec;
use crate::error::OsdError;

pub type ReefCluster = ReefClusterCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the ReefCluster resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "ReefClusterCRD",
    status = "ReefClusterStatus",
    group = "reef.rs",
    version = "v1beta1",
    kind = "ReefCluster",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "reefcluster",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Data Dir","type":"string","jsonPath":".spec.dataDirHostPath"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// The container image used for data-plane daemons and prepare tasks.
    pub image: String,

    /// Host directory under which daemon data directories are rooted.
    ///
    /// Required for node-backed provisioning. Its absence is a fatal
    /// configuration error when the storage scope declares nodes.
    #[serde(default)]
    pub data_dir_host_path: Option<String>,

    /// Node, device and block-volume intent for the cluster's OSDs.
    #[serde(default)]
    pub storage: StorageScopeSpec,

    /// Encryption, key rotation and cephx settings.
    #[serde(default)]
    pub security: SecuritySpec,

    /// Network provider settings.
    #[serde(default)]
    pub network: NetworkSpec,

    /// Per-role placement constraints, keyed by role name (`osd`, `prepare`).
    #[serde(default)]
    pub placement: BTreeMap<String, Placement>,

    /// Per-role resource requests/limits, keyed by role name (`osd`, `prepare`).
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceSpec>,

    /// Proceed with OSD updates even when the data plane cannot confirm
    /// that stopping the daemon is safe.
    #[serde(default)]
    pub continue_upgrade_after_checks_even_if_not_healthy: bool,

    /// Require all placement groups to be clean before any OSD update.
    #[serde(default)]
    pub upgrade_osd_requires_healthy_pgs: bool,
}

impl ClusterSpec {
    /// The declared host data directory, or a configuration error when
    /// node-backed provisioning needs one and none was declared.
    pub fn require_data_dir_host_path(&self) -> Result<&str, OsdError> {
        match self.data_dir_host_path.as_deref() {
            Some(path) if !path.is_empty() => Ok(path),
            _ => Err(OsdError::Configuration("dataDirHostPath must be set for node-backed storage".into())),
        }
    }

    /// Placement constraints for the given role, defaulting to empty.
    pub fn placement_for(&self, role: &str) -> Placement {
        self.placement.get(role).cloned().unwrap_or_default()
    }

    /// Resource requirements for the given role, defaulting to empty.
    pub fn resources_for(&self, role: &str) -> ResourceSpec {
        self.resources.get(role).cloned().unwrap_or_default()
    }
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReefClusterStatus {
    /// Coarse lifecycle phase of the cluster's OSD population.
    #[serde(default)]
    pub phase: Option<String>,
    /// Human readable detail for the current phase.
    #[serde(default)]
    pub message: Option<String>,
    /// Fine-grained reconciliation conditions.
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
}

/// A single reconciliation condition reported on the cluster record.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Condition type, one of `Progressing`, `Ready`, `Failure`.
    #[serde(rename = "type")]
    pub condition_type: String,
    /// Condition status, `True` or `False`.
    pub status: String,
    /// Human readable message, names the OSD being processed while progressing.
    #[serde(default)]
    pub message: Option<String>,
}

/// Scheduling constraints for a role's pods.
///
/// Affinity and toleration blocks are carried as raw JSON and deserialized
/// into their typed `k8s-openapi` forms on demand. This keeps the CRD schema
/// open while workload builders still get typed values.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    #[serde(default)]
    pub node_affinity: Option<serde_json::Value>,
    #[serde(default)]
    pub pod_affinity: Option<serde_json::Value>,
    #[serde(default)]
    pub pod_anti_affinity: Option<serde_json::Value>,
    #[serde(default)]
    pub tolerations: Option<serde_json::Value>,
    #[serde(default)]
    pub topology_spread_constraints: Option<serde_json::Value>,
}

impl Placement {
    /// Deserialize the typed affinity block for a pod spec.
    pub fn affinity(&self) -> Result<Option<Affinity>, OsdError> {
        let mut affinity = Affinity::default();
        let mut any = false;
        if let Some(val) = &self.node_affinity {
            affinity.node_affinity = Some(decode("nodeAffinity", val.clone())?);
            any = true;
        }
        if let Some(val) = &self.pod_affinity {
            affinity.pod_affinity = Some(decode("podAffinity", val.clone())?);
            any = true;
        }
        if let Some(val) = &self.pod_anti_affinity {
            affinity.pod_anti_affinity = Some(decode("podAntiAffinity", val.clone())?);
            any = true;
        }
        Ok(if any { Some(affinity) } else { None })
    }

    /// Deserialize the typed tolerations block for a pod spec.
    pub fn tolerations(&self) -> Result<Option<Vec<Toleration>>, OsdError> {
        self.tolerations.as_ref().map(|val| decode("tolerations", val.clone())).transpose()
    }

    /// Deserialize the typed topology spread constraints for a pod spec.
    pub fn topology_spread_constraints(&self) -> Result<Option<Vec<TopologySpreadConstraint>>, OsdError> {
        self.topology_spread_constraints
            .as_ref()
            .map(|val| decode("topologySpreadConstraints", val.clone()))
            .transpose()
    }
}

fn decode<T: serde::de::DeserializeOwned>(field: &str, val: serde_json::Value) -> Result<T, OsdError> {
    serde_json::from_value(val).map_err(|err| OsdError::Configuration(format!("invalid placement block {}: {}", field, err)))
}

/// Resource requests and limits for a role's containers.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
}

impl ResourceSpec {
    /// Indicates if no requests nor limits have been declared.
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty() && self.requests.is_empty()
    }

    /// Convert into the typed `k8s-openapi` requirements object.
    pub fn to_requirements(&self) -> ResourceRequirements {
        let quantities = |map: &BTreeMap<String, String>| -> BTreeMap<String, Quantity> {
            map.iter().map(|(key, val)| (key.clone(), Quantity(val.clone()))).collect()
        };
        ResourceRequirements {
            limits: if self.limits.is_empty() { None } else { Some(quantities(&self.limits)) },
            requests: if self.requests.is_empty() { None } else { Some(quantities(&self.requests)) },
        }
    }
}
