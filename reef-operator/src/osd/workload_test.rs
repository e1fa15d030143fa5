use anyhow::Result;
use maplit::btreemap;

use super::workload::{build_deployment, extract_osd_info, extract_osd_labels, target_for_existing};
use crate::fixtures;
use crate::osd::resolver::TargetBacking as Backing;

#[test]
fn node_deployment_carries_identity_and_recreate_strategy() -> Result<()> {
    let cluster = fixtures::cluster_with_nodes("test-cluster", &["node1"]);
    let target = fixtures::node_target(&cluster, "node1");
    let info = fixtures::osd_info(0, "node1");

    let deployment = build_deployment(&cluster, &target, &info)?;

    let name = deployment.metadata.name.as_deref().unwrap_or_default();
    assert_eq!(name, "reef-osd-0", "unexpected workload name, got {}", name);
    let labels = extract_osd_labels(&deployment)?;
    assert_eq!(labels.id, 0, "unexpected osd id label, got {}", labels.id);
    assert_eq!(labels.failure_domain, "node1", "unexpected failure domain, got {}", labels.failure_domain);
    assert!(!labels.portable, "node-backed daemons are never portable");
    assert!(!labels.encrypted, "node-backed daemons are never encrypted");

    let spec = deployment.spec.as_ref().expect("deployment has no spec");
    let strategy = spec.strategy.as_ref().and_then(|s| s.type_.as_deref()).unwrap_or_default();
    assert_eq!(strategy, "Recreate", "expected the Recreate strategy, got {}", strategy);
    let selector = spec.selector.match_labels.clone().unwrap_or_default();
    assert_eq!(selector.len(), 3, "expected the minimal immutable selector, got {:?}", selector);

    let owners = deployment.metadata.owner_references.clone().unwrap_or_default();
    assert_eq!(owners.len(), 1, "expected a single owner reference, got {:?}", owners);
    assert_eq!(owners[0].kind, "ReefCluster", "expected the cluster as owner, got {}", owners[0].kind);

    let pod = spec.template.spec.as_ref().expect("deployment has no pod spec");
    let pinned = pod.node_selector.clone().unwrap_or_default();
    assert_eq!(
        pinned,
        btreemap! { "kubernetes.io/hostname".to_string() => "node1".to_string() },
        "expected the daemon to be pinned to its node",
    );
    Ok(())
}

#[test]
fn encrypted_pvc_deployment_opens_luks_and_skips_expansion() -> Result<()> {
    let mut set = fixtures::device_set("set1", 1);
    set.encrypted = true;
    let cluster = fixtures::cluster_with_device_set("test-cluster", set.clone());
    let target = fixtures::pvc_target(&set, "set1-data-0-aaaaa");
    let info = fixtures::osd_info(1, "node1");

    let deployment = build_deployment(&cluster, &target, &info)?;

    let labels = extract_osd_labels(&deployment)?;
    assert!(labels.encrypted, "expected the encrypted label to be set");
    assert_eq!(labels.pvc.as_deref(), Some("set1-data-0-aaaaa"), "unexpected pvc label, got {:?}", labels.pvc);

    let pod = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .expect("deployment has no pod spec");
    let inits: Vec<&str> = pod
        .init_containers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|container| container.name.as_str())
        .collect();
    assert_eq!(
        inits,
        vec!["blkdevmapper", "encryption-open", "blkdevmapper-encryption", "activate", "chown-container-data-dir"],
        "unexpected init chain for an encrypted claim",
    );
    let mapper = pod
        .init_containers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|container| container.name == "blkdevmapper-encryption")
        .expect("missing the mapper bridge container");
    let args = mapper.args.clone().unwrap_or_default();
    assert!(
        args.contains(&"/dev/mapper/set1-data-0-aaaaa-dmcrypt".to_string()),
        "expected the opened mapping to be bridged, got {:?}",
        args
    );
    assert_eq!(pod.host_ipc, Some(true), "expected host IPC for the device bridge");
    Ok(())
}

#[test]
fn plain_pvc_deployment_expands_on_activation() -> Result<()> {
    let set = fixtures::device_set("set1", 1);
    let cluster = fixtures::cluster_with_device_set("test-cluster", set.clone());
    let target = fixtures::pvc_target(&set, "set1-data-0-aaaaa");
    let info = fixtures::osd_info(1, "node1");

    let deployment = build_deployment(&cluster, &target, &info)?;

    let pod = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .expect("deployment has no pod spec");
    let inits: Vec<&str> = pod
        .init_containers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|container| container.name.as_str())
        .collect();
    assert!(inits.contains(&"expand-bluefs"), "expected the expansion init container, got {:?}", inits);
    assert!(!inits.contains(&"encryption-open"), "unexpected LUKS open container for a plain claim, got {:?}", inits);
    Ok(())
}

#[test]
fn prepare_output_round_trips_through_the_deployment() -> Result<()> {
    let cluster = fixtures::cluster_with_nodes("test-cluster", &["node1"]);
    let target = fixtures::node_target(&cluster, "node1");
    let mut info = fixtures::osd_info(3, "node1");
    info.lv_backed_pv = true;

    let deployment = build_deployment(&cluster, &target, &info)?;
    let recovered = extract_osd_info(&deployment)?;

    assert_eq!(recovered, info, "prepare output did not survive the round trip\nexpected: {:?}\ngot: {:?}", info, recovered);
    Ok(())
}

#[test]
fn target_for_existing_resolves_in_scope_nodes_only() -> Result<()> {
    let cluster = fixtures::cluster_with_nodes("test-cluster", &["node1"]);
    let target = fixtures::node_target(&cluster, "node1");
    let info = fixtures::osd_info(0, "node1");
    let deployment = build_deployment(&cluster, &target, &info)?;

    let resolved = target_for_existing(&cluster, &deployment)?;
    match resolved {
        Some(target) => assert!(matches!(target.backing, Backing::Node(_)), "expected a node-backed target"),
        None => panic!("expected the in-scope node to resolve"),
    }

    // Dropping the node from the scope leaves the daemon untouched.
    let mut shrunk = cluster.clone();
    shrunk.spec.storage.nodes.clear();
    let resolved = target_for_existing(&shrunk, &deployment)?;
    assert!(resolved.is_none(), "expected an out-of-scope daemon to resolve to None, got {:?}", resolved.map(|t| t.name));
    Ok(())
}

#[test]
fn target_for_existing_resolves_device_set_membership() -> Result<()> {
    let set = fixtures::device_set("set1", 1);
    let cluster = fixtures::cluster_with_device_set("test-cluster", set.clone());
    let target = fixtures::pvc_target(&set, "set1-data-0-aaaaa");
    let info = fixtures::osd_info(1, "node1");
    let deployment = build_deployment(&cluster, &target, &info)?;

    let resolved = target_for_existing(&cluster, &deployment)?.expect("expected the in-scope claim to resolve");
    match &resolved.backing {
        Backing::Pvc(pvc) => {
            assert_eq!(pvc.device_set, "set1", "unexpected device set, got {}", pvc.device_set);
            assert_eq!(pvc.data_claim, "set1-data-0-aaaaa", "unexpected data claim, got {}", pvc.data_claim);
        }
        other => panic!("expected a PVC-backed target, got {:?}", other),
    }

    // Dropping the set from the scope leaves the daemon untouched.
    let mut shrunk = cluster.clone();
    shrunk.spec.storage.storage_class_device_sets.clear();
    let resolved = target_for_existing(&shrunk, &deployment)?;
    assert!(resolved.is_none(), "expected an out-of-scope daemon to resolve to None, got {:?}", resolved.map(|t| t.name));
    Ok(())
}

#[test]
fn multus_networks_render_into_the_pod_annotation() -> Result<()> {
    let mut cluster = fixtures::cluster_with_nodes("test-cluster", &["node1"]);
    cluster.spec.network.provider = "multus".into();
    cluster.spec.network.selectors.insert("public".into(), "default/public-net@net1".into());
    let target = fixtures::node_target(&cluster, "node1");
    let info = fixtures::osd_info(0, "node1");

    let deployment = build_deployment(&cluster, &target, &info)?;

    let annotations = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.annotations.clone())
        .unwrap_or_default();
    let networks = annotations.get("k8s.v1.cni.cncf.io/networks").cloned().unwrap_or_default();
    assert_eq!(networks, "default/public-net@net1", "unexpected multus annotation, got {}", networks);

    // A selector missing its interface fails the build.
    cluster.spec.network.selectors.insert("public".into(), "default/public-net".into());
    let res = build_deployment(&cluster, &target, &info);
    assert!(res.is_err(), "expected a malformed selector to fail the workload build");

    // The multus provider without any selector is a configuration error.
    cluster.spec.network.selectors.clear();
    let res = build_deployment(&cluster, &target, &info);
    assert!(res.is_err(), "expected the multus provider without selectors to fail the workload build");
    Ok(())
}
