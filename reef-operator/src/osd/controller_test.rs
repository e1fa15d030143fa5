use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::provision::RECORD_OSD_STATUS;
use super::status::{parse_record, record_data, OrchestrationStatus, STATUS_COMPLETED, STATUS_FAILED, STATUS_STARTING};
use super::{status_record_name, Controller};
use crate::dataplane::fake::FakeDataPlane;
use crate::fixtures;
use crate::store::fake::FakeStore;
use reef_core::labels::LABEL_KEY_RECORD;
use reef_core::OsdError;

/// Stand in for the prepare tasks the controller dispatches.
///
/// Polls the store for freshly seeded status records and advances each one
/// with a scripted entry to its terminal report, the way a real prepare pod
/// would through the API server.
fn spawn_prepare_stub(store: Arc<FakeStore>, script: HashMap<String, OrchestrationStatus>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            store.with_state(|state| {
                for (name, map) in state.config_maps.iter_mut() {
                    let is_status_record = map
                        .metadata
                        .labels
                        .as_ref()
                        .and_then(|labels| labels.get(LABEL_KEY_RECORD))
                        .map(|kind| kind == RECORD_OSD_STATUS)
                        .unwrap_or(false);
                    if !is_status_record {
                        continue;
                    }
                    let current = match parse_record(map) {
                        Ok(current) => current,
                        Err(_) => continue,
                    };
                    if current.status != STATUS_STARTING {
                        continue;
                    }
                    if let Some(report) = script.get(name) {
                        map.data = Some(record_data(report));
                    }
                }
            });
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
}

fn controller(store: Arc<FakeStore>, dataplane: Arc<FakeDataPlane>) -> (broadcast::Sender<()>, Controller) {
    let (tx, _rx) = broadcast::channel(1);
    let controller = Controller::new(fixtures::config(), store, dataplane, tx.clone());
    (tx, controller)
}

fn completed(id: i32, node: &str) -> OrchestrationStatus {
    OrchestrationStatus {
        status: STATUS_COMPLETED.into(),
        osds: vec![fixtures::osd_info(id, node)],
        ..Default::default()
    }
}

fn status_phase(store: &FakeStore) -> String {
    store.with_state(|state| {
        state
            .cluster_status
            .as_ref()
            .and_then(|status| status.phase.clone())
            .unwrap_or_default()
    })
}

#[tokio::test]
async fn reconcile_provisions_a_fresh_cluster() -> Result<()> {
    let cluster = fixtures::cluster_with_nodes("test-cluster", &["node1", "node2"]);
    let store = Arc::new(FakeStore::new());
    store.with_state(|state| state.nodes = vec![fixtures::platform_node("node1"), fixtures::platform_node("node2")]);
    let stub = spawn_prepare_stub(
        store.clone(),
        HashMap::from([
            (status_record_name("node1"), completed(0, "node1")),
            (status_record_name("node2"), completed(1, "node2")),
        ]),
    );

    let (_tx, controller) = controller(store.clone(), Arc::new(FakeDataPlane::new()));
    controller.reconcile(&cluster).await?;
    stub.abort();

    store.with_state(|state| {
        assert!(state.deployments.contains_key("reef-osd-0"), "expected a workload for osd 0, got {:?}", state.deployments.keys());
        assert!(state.deployments.contains_key("reef-osd-1"), "expected a workload for osd 1, got {:?}", state.deployments.keys());
        assert!(state.config_maps.is_empty(), "expected consumed records to be deleted, got {:?}", state.config_maps.keys());
        assert!(state.jobs.is_empty(), "expected completed prepare jobs to be deleted, got {:?}", state.jobs.keys());
    });
    assert_eq!(status_phase(&store), "Ready", "expected the cluster to report Ready, got {}", status_phase(&store));
    Ok(())
}

#[tokio::test]
async fn reconcile_is_idempotent_across_passes() -> Result<()> {
    let cluster = fixtures::cluster_with_nodes("test-cluster", &["node1", "node2"]);
    let store = Arc::new(FakeStore::new());
    store.with_state(|state| state.nodes = vec![fixtures::platform_node("node1"), fixtures::platform_node("node2")]);
    let stub = spawn_prepare_stub(
        store.clone(),
        HashMap::from([
            (status_record_name("node1"), completed(0, "node1")),
            (status_record_name("node2"), completed(1, "node2")),
        ]),
    );

    let (_tx, controller) = controller(store.clone(), Arc::new(FakeDataPlane::new()));
    controller.reconcile(&cluster).await?;
    // The second pass finds both daemons existing and rolls updates onto
    // them instead of creating anything.
    controller.reconcile(&cluster).await?;
    stub.abort();

    store.with_state(|state| {
        assert_eq!(state.deployments_created, 2, "expected no additional creates on the second pass, got {}", state.deployments_created);
        assert_eq!(state.deployments_applied, 2, "expected both daemons to be updated on the second pass, got {}", state.deployments_applied);
    });
    assert_eq!(status_phase(&store), "Ready", "expected the cluster to report Ready, got {}", status_phase(&store));
    Ok(())
}

#[tokio::test]
async fn reconcile_reports_progress_when_updates_are_gated() -> Result<()> {
    let cluster = fixtures::cluster_with_nodes("test-cluster", &["node1"]);
    let store = Arc::new(FakeStore::new());
    store.with_state(|state| state.nodes = vec![fixtures::platform_node("node1")]);
    let dataplane = Arc::new(FakeDataPlane::new());
    let stub = spawn_prepare_stub(store.clone(), HashMap::from([(status_record_name("node1"), completed(0, "node1"))]));

    let (_tx, controller) = controller(store.clone(), dataplane.clone());
    controller.reconcile(&cluster).await?;
    // The daemon now exists; the data plane refuses to let it stop.
    dataplane.with_state(|state| {
        state.not_safe.insert(0);
    });
    controller.reconcile(&cluster).await?;
    stub.abort();

    let applied = store.with_state(|state| state.deployments_applied);
    assert_eq!(applied, 0, "expected the gated update to be deferred, got {} applies", applied);
    assert_eq!(status_phase(&store), "Progressing", "expected a gated pass to report Progressing, got {}", status_phase(&store));
    Ok(())
}

#[tokio::test]
async fn reconcile_surfaces_prepare_failures() -> Result<()> {
    let cluster = fixtures::cluster_with_nodes("test-cluster", &["node1"]);
    let store = Arc::new(FakeStore::new());
    store.with_state(|state| state.nodes = vec![fixtures::platform_node("node1")]);
    let failed = OrchestrationStatus {
        status: STATUS_FAILED.into(),
        message: "disk scan failed".into(),
        ..Default::default()
    };
    let stub = spawn_prepare_stub(store.clone(), HashMap::from([(status_record_name("node1"), failed)]));

    let (_tx, controller) = controller(store.clone(), Arc::new(FakeDataPlane::new()));
    let res = controller.reconcile(&cluster).await;
    stub.abort();

    let err = res.expect_err("expected the failed target to fail the pass");
    assert!(format!("{:#}", err).contains("disk scan failed"), "expected the prepare failure to surface, got {:#}", err);
    assert_eq!(status_phase(&store), "Failure", "expected the cluster to report Failure, got {}", status_phase(&store));
    let jobs = store.with_state(|state| state.jobs.len());
    assert_eq!(jobs, 1, "expected the failed prepare job to be kept for its logs, got {}", jobs);
    Ok(())
}

#[tokio::test]
async fn reconcile_aborts_on_shutdown() -> Result<()> {
    let cluster = fixtures::cluster_with_nodes("test-cluster", &["node1"]);
    let store = Arc::new(FakeStore::new());
    store.with_state(|state| state.nodes = vec![fixtures::platform_node("node1")]);
    // No stub: the prepare task never reports and the pass blocks awaiting it.

    let (tx, controller) = controller(store.clone(), Arc::new(FakeDataPlane::new()));
    let controller = Arc::new(controller);
    let handle: JoinHandle<Result<()>> = tokio::spawn({
        let controller = controller.clone();
        let cluster = cluster.clone();
        async move { controller.reconcile(&cluster).await }
    });
    // Let the pass reach its status wait before signalling shutdown.
    tokio::time::sleep(Duration::from_millis(20)).await;
    tx.send(()).expect("error sending shutdown signal");

    let err = handle.await?.expect_err("expected shutdown to abort the pass");
    assert!(
        matches!(err.downcast_ref::<OsdError>(), Some(OsdError::Canceled)),
        "expected a cancellation error, got {:#}",
        err
    );
    Ok(())
}

#[tokio::test]
async fn reconcile_provisions_an_encrypted_device_set_end_to_end() -> Result<()> {
    let mut set = fixtures::device_set("set1", 1);
    set.encrypted = true;
    let mut cluster = fixtures::cluster_with_device_set("test-cluster", set);
    cluster.spec.security.key_rotation.enabled = true;
    let store = Arc::new(FakeStore::new());
    // The store derives generated claim names from a counter, so the first
    // claim of the set lands on a known name.
    let claim = "set1-data-0-00001";
    let mut report = completed(2, claim);
    report.osds[0].encrypted = true;
    report.pvc_backed = true;
    let stub = spawn_prepare_stub(store.clone(), HashMap::from([(status_record_name(claim), report)]));

    let (_tx, controller) = controller(store.clone(), Arc::new(FakeDataPlane::new()));
    controller.reconcile(&cluster).await?;
    stub.abort();

    store.with_state(|state| {
        assert_eq!(state.claims.len(), 1, "expected one claim for the set, got {:?}", state.claims.keys());
        assert!(
            state.secrets.contains_key("reef-osd-encryption-key-set1-data-0-00001"),
            "expected an encryption-key secret for the claim, got {:?}",
            state.secrets.keys()
        );
        assert!(state.deployments.contains_key("reef-osd-2"), "expected a workload for osd 2, got {:?}", state.deployments.keys());
        assert!(
            state.cron_jobs.contains_key("reef-osd-key-rotation-2"),
            "expected a rotation job for the encrypted daemon, got {:?}",
            state.cron_jobs.keys()
        );
    });
    assert_eq!(status_phase(&store), "Ready", "expected the cluster to report Ready, got {}", status_phase(&store));
    Ok(())
}
