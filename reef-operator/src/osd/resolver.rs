//! Storage-intent resolution.
//!
//! Converts the declared storage scope and device sets into a deterministic
//! list of provisioning targets, one per eligible node or per device-set
//! index. Invalid or missing nodes are logged and skipped; only impossible
//! configuration aborts the pass.

use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Node as K8sNode;

use crate::osd::device_set;
use crate::osd::osd_err;
use crate::store::ObjectStore;
use reef_core::crd::{Node, Placement, ReefCluster, RequiredMetadata, ResourceSpec};
use reef_core::OsdError;

/// The node label carrying its hostname.
const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// A single unit of provisioning, addressed by node name or claim name.
#[derive(Clone, Debug)]
pub struct ProvisionTarget {
    /// The target's address: node name, or data claim name for PVC targets.
    pub name: String,
    /// What backs the target.
    pub backing: TargetBacking,
}

/// The backing of a provisioning target.
#[derive(Clone, Debug)]
pub enum TargetBacking {
    /// Local devices on a declared node.
    Node(NodeTarget),
    /// A block-volume claim from a device set.
    Pvc(PvcTarget),
}

impl ProvisionTarget {
    /// Indicates if this target is backed by a block-volume claim.
    pub fn is_pvc_backed(&self) -> bool {
        matches!(self.backing, TargetBacking::Pvc(_))
    }

    /// Indicates if this target's devices are to be encrypted.
    pub fn is_encrypted(&self) -> bool {
        match &self.backing {
            TargetBacking::Node(_) => false,
            TargetBacking::Pvc(pvc) => pvc.encrypted,
        }
    }
}

/// A node-backed provisioning target with fully resolved selection.
#[derive(Clone, Debug)]
pub struct NodeTarget {
    /// The resolved node, cluster defaults merged in.
    pub node: Node,
    /// The crush location of daemons provisioned on this node.
    pub location: String,
}

/// A PVC-backed provisioning target for one device-set index.
#[derive(Clone, Debug)]
pub struct PvcTarget {
    /// The originating device set.
    pub device_set: String,
    /// The backing data claim.
    pub data_claim: String,
    /// The metadata claim, when the set declares a `metadata` template.
    pub metadata_claim: Option<String>,
    /// The WAL claim, when the set declares a `wal` template.
    pub wal_claim: Option<String>,
    /// Whether the daemon may reschedule freely.
    pub portable: bool,
    /// Whether the backing devices are encrypted.
    pub encrypted: bool,
    /// Crush device class override.
    pub device_class: Option<String>,
    /// Placement constraints of the set.
    pub placement: Placement,
    /// Resource overrides of the set.
    pub resources: Option<ResourceSpec>,
}

/// The storage-intent resolver.
pub struct Resolver {
    store: Arc<dyn ObjectStore>,
}

impl Resolver {
    /// Create a new instance.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Resolve the cluster's declared scope into provisioning targets.
    ///
    /// Per-target problems land in `errors`; the returned error is reserved
    /// for resolver-level configuration problems which abort the pass.
    #[tracing::instrument(level = "debug", skip_all, fields(cluster = cluster.name()))]
    pub async fn resolve(&self, cluster: &ReefCluster, errors: &mut Vec<anyhow::Error>) -> Result<Vec<ProvisionTarget>> {
        let mut targets = Vec::new();
        targets.extend(self.resolve_nodes(cluster).await?);
        let pvc_targets = device_set::prepare_device_sets(cluster, self.store.as_ref(), errors).await;
        targets.extend(pvc_targets.into_iter().map(|pvc| ProvisionTarget {
            name: pvc.data_claim.clone(),
            backing: TargetBacking::Pvc(pvc),
        }));
        tracing::debug!(targets = targets.len(), "storage scope resolved");
        Ok(targets)
    }

    /// Expand and filter the node branch of the storage scope.
    async fn resolve_nodes(&self, cluster: &ReefCluster) -> Result<Vec<ProvisionTarget>> {
        let storage = &cluster.spec.storage;
        if !storage.use_all_nodes && storage.nodes.is_empty() {
            return Ok(Vec::new());
        }
        // Node-backed provisioning is impossible without a host data dir.
        cluster.spec.require_data_dir_host_path().map_err(osd_err)?;

        let platform_nodes = self.store.list_nodes().await.context("error listing platform nodes")?;
        let placement = cluster.spec.placement_for("osd");

        let declared: Vec<String> = if storage.use_all_nodes {
            if !storage.nodes.is_empty() {
                tracing::warn!("useAllNodes is set, ignoring the explicitly declared node list");
            }
            platform_nodes.iter().filter_map(node_name).collect()
        } else {
            storage.nodes.iter().map(|node| node.name.clone()).collect()
        };

        let mut targets = Vec::new();
        for name in declared {
            let platform_node = match find_platform_node(&platform_nodes, &name) {
                Some(node) => node,
                None => {
                    tracing::warn!(node = %name, "declared node not found in platform topology, skipping");
                    continue;
                }
            };
            if !node_is_eligible(platform_node, &placement)? {
                tracing::info!(node = %name, "node is not eligible for OSDs, skipping");
                continue;
            }
            let resolved = match resolve_declared_node(storage, &name) {
                Some(node) => node,
                None => {
                    tracing::warn!(node = %name, "node could not be resolved against the storage scope, skipping");
                    continue;
                }
            };
            let location = crush_location(&resolved);
            targets.push(ProvisionTarget {
                name: name.clone(),
                backing: TargetBacking::Node(NodeTarget { node: resolved, location }),
            });
        }
        Ok(targets)
    }
}

/// Resolve a declared node, synthesizing an entry under `useAllNodes`.
pub(crate) fn resolve_declared_node(storage: &reef_core::crd::StorageScopeSpec, name: &str) -> Option<Node> {
    if storage.node_exists(name) {
        storage.resolve_node(name)
    } else if storage.use_all_nodes {
        // Under useAllNodes the node list is rewritten from the platform
        // enumeration; synthesize an empty entry and resolve it so cluster
        // wide selection is inherited.
        let mut scope = storage.clone();
        scope.nodes.push(Node { name: name.to_string(), ..Default::default() });
        scope.resolve_node(name)
    } else {
        None
    }
}

/// The crush location string for a resolved node.
pub(crate) fn crush_location(node: &Node) -> String {
    match &node.location {
        Some(location) if !location.is_empty() => location.clone(),
        _ => format!("root=default host={}", node.name.replace('.', "-")),
    }
}

fn node_name(node: &K8sNode) -> Option<String> {
    node.metadata.name.clone()
}

/// Find a platform node by name or by its hostname label.
fn find_platform_node<'a>(nodes: &'a [K8sNode], name: &str) -> Option<&'a K8sNode> {
    nodes.iter().find(|node| {
        node.metadata.name.as_deref() == Some(name)
            || node
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(HOSTNAME_LABEL))
                .map(String::as_str)
                == Some(name)
    })
}

/// Check a platform node's readiness, schedulability and placement match.
fn node_is_eligible(node: &K8sNode, placement: &Placement) -> Result<bool> {
    if node.spec.as_ref().and_then(|spec| spec.unschedulable).unwrap_or(false) {
        return Ok(false);
    }
    if !node_is_ready(node) {
        return Ok(false);
    }
    if !tolerates_taints(node, placement)? {
        return Ok(false);
    }
    if !matches_node_affinity(node, placement).map_err(osd_err)? {
        return Ok(false);
    }
    Ok(true)
}

fn node_is_ready(node: &K8sNode) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| conditions.iter().any(|cond| cond.type_ == "Ready" && cond.status == "True"))
        .unwrap_or(false)
}

/// Check the node's scheduling taints against the declared tolerations.
fn tolerates_taints(node: &K8sNode, placement: &Placement) -> Result<bool> {
    let taints = match node.spec.as_ref().and_then(|spec| spec.taints.as_ref()) {
        Some(taints) => taints,
        None => return Ok(true),
    };
    let tolerations = placement.tolerations().map_err(osd_err)?.unwrap_or_default();
    for taint in taints {
        if taint.effect != "NoSchedule" && taint.effect != "NoExecute" {
            continue;
        }
        let tolerated = tolerations.iter().any(|tol| {
            let key_matches = match tol.key.as_deref() {
                None | Some("") => true,
                Some(key) => key == taint.key,
            };
            let effect_matches = match tol.effect.as_deref() {
                None | Some("") => true,
                Some(effect) => effect == taint.effect,
            };
            let value_matches = match tol.operator.as_deref() {
                Some("Exists") => true,
                _ => tol.value.as_deref().unwrap_or_default() == taint.value.as_deref().unwrap_or_default(),
            };
            key_matches && effect_matches && value_matches
        });
        if !tolerated {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Check the node's labels against required node affinity, if declared.
fn matches_node_affinity(node: &K8sNode, placement: &Placement) -> Result<bool, OsdError> {
    let affinity = match placement.affinity()? {
        Some(affinity) => affinity,
        None => return Ok(true),
    };
    let required = match affinity.node_affinity.and_then(|na| na.required_during_scheduling_ignored_during_execution) {
        Some(selector) => selector,
        None => return Ok(true),
    };
    let labels = node.metadata.labels.clone().unwrap_or_default();
    // Terms are OR'd; expressions within a term are AND'd.
    let matched = required.node_selector_terms.iter().any(|term| {
        term.match_expressions
            .as_ref()
            .map(|exprs| {
                exprs.iter().all(|expr| {
                    let value = labels.get(&expr.key);
                    match expr.operator.as_str() {
                        "In" => value.map(|val| expr.values.as_ref().map(|vals| vals.contains(val)).unwrap_or(false)).unwrap_or(false),
                        "NotIn" => value.map(|val| !expr.values.as_ref().map(|vals| vals.contains(val)).unwrap_or(false)).unwrap_or(true),
                        "Exists" => value.is_some(),
                        "DoesNotExist" => value.is_none(),
                        _ => false,
                    }
                })
            })
            .unwrap_or(true)
    });
    Ok(matched)
}
