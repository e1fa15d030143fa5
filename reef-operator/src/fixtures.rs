//! Shared fixtures used by tests throughout this crate.

#![allow(dead_code)]

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node as K8sNode, NodeCondition, NodeStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use maplit::btreemap;

use std::sync::Arc;

use crate::config::Config;
use crate::osd::resolver::{self, NodeTarget, ProvisionTarget, PvcTarget, TargetBacking};
use crate::osd::{workload, OsdInfo};
use reef_core::crd::{ClusterSpec, Node, ReefCluster, StorageClassDeviceSet, VolumeClaimTemplate};

/// A runtime config tuned for fast test polling.
pub fn config() -> Arc<Config> {
    config_from_env(Vec::new())
}

/// A runtime config with the given env entries layered over the test base.
pub fn config_from_env(overrides: Vec<(String, String)>) -> Arc<Config> {
    let mut env: Vec<(String, String)> = vec![
        ("RUST_LOG".into(), "error".into()),
        ("NAMESPACE".into(), "reef".into()),
        ("POD_NAME".into(), "reef-operator-0".into()),
        ("STATUS_POLL_INTERVAL_MS".into(), "3".into()),
        ("STATUS_WAIT_TIMEOUT_SECS".into(), "5".into()),
    ];
    for (key, value) in overrides {
        if let Some(entry) = env.iter_mut().find(|(existing, _)| *existing == key) {
            entry.1 = value;
        } else {
            env.push((key, value));
        }
    }
    Arc::new(envy::from_iter::<_, Config>(env).expect("error building test config"))
}

/// A minimal cluster record with an empty storage scope.
pub fn cluster(name: &str) -> ReefCluster {
    let mut cluster = ReefCluster::new(
        name,
        ClusterSpec {
            image: "reef/reef:v1.0.0".into(),
            data_dir_host_path: Some("/var/lib/reef".into()),
            ..Default::default()
        },
    );
    cluster.metadata.namespace = Some("reef".into());
    cluster.metadata.uid = Some(format!("uid-{}", name));
    cluster
}

/// A cluster whose storage scope declares the given nodes, all devices.
pub fn cluster_with_nodes(name: &str, nodes: &[&str]) -> ReefCluster {
    let mut cluster = cluster(name);
    cluster.spec.storage.selection.use_all_devices = Some(true);
    cluster.spec.storage.nodes = nodes
        .iter()
        .map(|node| Node {
            name: node.to_string(),
            ..Default::default()
        })
        .collect();
    cluster
}

/// A cluster whose storage scope declares the given device set.
pub fn cluster_with_device_set(name: &str, set: StorageClassDeviceSet) -> ReefCluster {
    let mut cluster = cluster(name);
    cluster.spec.storage.storage_class_device_sets = vec![set];
    cluster
}

/// A device set with a single data claim template.
pub fn device_set(name: &str, count: u32) -> StorageClassDeviceSet {
    StorageClassDeviceSet {
        name: name.to_string(),
        count,
        volume_claim_templates: vec![VolumeClaimTemplate {
            name: "data".into(),
            storage: "10Gi".into(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// A ready, schedulable platform node carrying the hostname label.
pub fn platform_node(name: &str) -> K8sNode {
    K8sNode {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(btreemap! { "kubernetes.io/hostname".to_string() => name.to_string() }),
            ..Default::default()
        },
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A prepare-task report for one OSD.
pub fn osd_info(id: i32, node: &str) -> OsdInfo {
    OsdInfo {
        id,
        uuid: format!("uuid-{}", id),
        block_path: format!("/dev/mapper/osd-{}", id),
        cv_mode: "raw".into(),
        store: "bluestore".into(),
        node: node.to_string(),
        ..Default::default()
    }
}

/// The provisioning target for one of the cluster's declared nodes.
pub fn node_target(cluster: &ReefCluster, node: &str) -> ProvisionTarget {
    let resolved = resolver::resolve_declared_node(&cluster.spec.storage, node).expect("node is not declared in the fixture cluster");
    let location = resolver::crush_location(&resolved);
    ProvisionTarget {
        name: node.to_string(),
        backing: TargetBacking::Node(NodeTarget { node: resolved, location }),
    }
}

/// The provisioning target for one index of a device set.
pub fn pvc_target(set: &StorageClassDeviceSet, data_claim: &str) -> ProvisionTarget {
    ProvisionTarget {
        name: data_claim.to_string(),
        backing: TargetBacking::Pvc(PvcTarget {
            device_set: set.name.clone(),
            data_claim: data_claim.to_string(),
            metadata_claim: None,
            wal_claim: None,
            portable: set.portable,
            encrypted: set.encrypted,
            device_class: set.device_class.clone(),
            placement: set.placement.clone(),
            resources: set.resources.clone(),
        }),
    }
}

/// A live OSD deployment as the workload builder would have created it.
pub fn osd_deployment(cluster: &ReefCluster, target: &ProvisionTarget, info: &OsdInfo) -> Deployment {
    workload::build_deployment(cluster, target, info).expect("error building fixture deployment")
}
