use anyhow::Result;
use k8s_openapi::api::core::v1::EnvVar;

use super::envs::{daemon_envs, node_prepare_envs, pvc_prepare_envs};
use crate::fixtures;
use crate::osd::resolver::TargetBacking;

fn value_of<'a>(envs: &'a [EnvVar], name: &str) -> Option<&'a str> {
    envs.iter().find(|var| var.name == name).and_then(|var| var.value.as_deref())
}

#[test]
fn node_prepare_envs_carry_the_declared_store_knobs() -> Result<()> {
    let mut cluster = fixtures::cluster_with_nodes("test-cluster", &["node1"]);
    cluster.spec.storage.config.insert("databaseSizeMB".into(), "1024".into());
    cluster.spec.storage.config.insert("crushRoot".into(), "rack1".into());
    cluster.spec.storage.nodes[0].config.insert("osdsPerDevice".into(), "2".into());
    let target = fixtures::node_target(&cluster, "node1");
    let node = match &target.backing {
        TargetBacking::Node(node) => node,
        other => panic!("expected a node-backed target, got {:?}", other),
    };

    let envs = node_prepare_envs(&cluster, node);

    let database = value_of(&envs, "ROOK_OSD_DATABASE_SIZE");
    assert_eq!(database, Some("1024"), "expected the cluster-wide database size, got {:?}", database);
    let per_device = value_of(&envs, "ROOK_OSDS_PER_DEVICE");
    assert_eq!(per_device, Some("2"), "expected the node-level osds-per-device knob, got {:?}", per_device);
    let root = value_of(&envs, "ROOK_CRUSHMAP_ROOT");
    assert_eq!(root, Some("rack1"), "expected the crush root, got {:?}", root);
    let wal = value_of(&envs, "ROOK_OSD_WAL_SIZE");
    assert!(wal.is_none(), "undeclared knobs must be omitted, got {:?}", wal);
    Ok(())
}

#[test]
fn pvc_prepare_envs_carry_the_crush_root() -> Result<()> {
    let set = fixtures::device_set("set1", 1);
    let mut cluster = fixtures::cluster_with_device_set("test-cluster", set.clone());
    cluster.spec.storage.config.insert("crushRoot".into(), "rack2".into());
    let target = fixtures::pvc_target(&set, "set1-data-0-aaaaa");
    let pvc = match &target.backing {
        TargetBacking::Pvc(pvc) => pvc,
        other => panic!("expected a claim-backed target, got {:?}", other),
    };

    let envs = pvc_prepare_envs(&cluster, pvc);

    let root = value_of(&envs, "ROOK_CRUSHMAP_ROOT");
    assert_eq!(root, Some("rack2"), "expected the crush root, got {:?}", root);
    Ok(())
}

#[test]
fn daemon_envs_carry_the_lv_backed_flag() -> Result<()> {
    let cluster = fixtures::cluster_with_nodes("test-cluster", &["node1"]);
    let mut info = fixtures::osd_info(0, "node1");
    info.lv_backed_pv = true;

    let envs = daemon_envs(&cluster, &info);

    let flag = value_of(&envs, "ROOK_LV_BACKED_PV");
    assert_eq!(flag, Some("true"), "expected the lv-backed flag to be emitted, got {:?}", flag);
    Ok(())
}
