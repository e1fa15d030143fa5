//! Reef CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns

mod cluster;
mod network;
mod security;
mod storage;


use kube::Resource;

pub use cluster::{ClusterCondition, ClusterSpec, Placement, ReefCluster, ReefClusterStatus, ResourceSpec};
pub use network::{require_name_and_interface, MultusSelector, MultusValidator, NetworkSpec};
pub use security::{CephxKeyRotationPolicy, CephxSpec, KeyManagementServiceSpec, KeyRotationSpec, SecuritySpec};
pub use storage::{Device, MigrationSpec, Node, OsdStore, Selection, StorageClassDeviceSet, StorageScopeSpec, VolumeClaimTemplate};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;
}

impl RequiredMetadata for ReefCluster {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}
