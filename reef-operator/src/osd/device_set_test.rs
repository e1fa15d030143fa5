use anyhow::Result;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use maplit::btreemap;

use super::device_set::{claim_identity, prepare_device_sets};
use crate::fixtures;
use crate::store::fake::FakeStore;
use reef_core::crd::VolumeClaimTemplate;
use reef_core::labels::LABEL_KEY_DEVICE_SET_PVC_ID;

#[tokio::test]
async fn expansion_creates_claims_and_is_idempotent() -> Result<()> {
    let cluster = fixtures::cluster_with_device_set("test-cluster", fixtures::device_set("set1", 2));
    let store = FakeStore::new();
    let mut errors = Vec::new();

    let first = prepare_device_sets(&cluster, &store, &mut errors).await;
    assert!(errors.is_empty(), "expected no errors on first expansion, got {:?}", errors);
    assert_eq!(first.len(), 2, "expected 2 targets, got {}", first.len());

    // A second pass must find the existing claims instead of creating more.
    let second = prepare_device_sets(&cluster, &store, &mut errors).await;
    assert!(errors.is_empty(), "expected no errors on second expansion, got {:?}", errors);
    let claims = store.with_state(|state| state.claims.len());
    assert_eq!(claims, 2, "expected the claim count to be stable across passes, got {}", claims);
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.data_claim, b.data_claim, "expected stable claim names across passes, got {} then {}", a.data_claim, b.data_claim);
    }
    Ok(())
}

#[tokio::test]
async fn expansion_rejects_a_set_without_a_data_template() -> Result<()> {
    let mut set = fixtures::device_set("set1", 1);
    set.volume_claim_templates = vec![VolumeClaimTemplate {
        name: "metadata".into(),
        storage: "5Gi".into(),
        ..Default::default()
    }];
    let cluster = fixtures::cluster_with_device_set("test-cluster", set);
    let store = FakeStore::new();
    let mut errors = Vec::new();

    let targets = prepare_device_sets(&cluster, &store, &mut errors).await;

    assert!(targets.is_empty(), "expected no targets for a set without a data template, got {}", targets.len());
    assert_eq!(errors.len(), 1, "expected exactly one error, got {:?}", errors);
    Ok(())
}

#[tokio::test]
async fn expansion_carries_metadata_and_wal_claims() -> Result<()> {
    let mut set = fixtures::device_set("set1", 1);
    set.volume_claim_templates.push(VolumeClaimTemplate {
        name: "metadata".into(),
        storage: "5Gi".into(),
        ..Default::default()
    });
    set.volume_claim_templates.push(VolumeClaimTemplate {
        name: "wal".into(),
        storage: "2Gi".into(),
        ..Default::default()
    });
    let cluster = fixtures::cluster_with_device_set("test-cluster", set);
    let store = FakeStore::new();
    let mut errors = Vec::new();

    let targets = prepare_device_sets(&cluster, &store, &mut errors).await;

    assert!(errors.is_empty(), "expected no errors, got {:?}", errors);
    assert_eq!(targets.len(), 1, "expected one target, got {}", targets.len());
    assert!(targets[0].metadata_claim.is_some(), "expected a metadata claim on the target");
    assert!(targets[0].wal_claim.is_some(), "expected a wal claim on the target");
    let claims = store.with_state(|state| state.claims.len());
    assert_eq!(claims, 3, "expected 3 claims to be created, got {}", claims);
    Ok(())
}

#[tokio::test]
async fn expansion_fails_an_index_with_duplicate_claims() -> Result<()> {
    let cluster = fixtures::cluster_with_device_set("test-cluster", fixtures::device_set("set1", 1));
    let store = FakeStore::new();
    let identity = claim_identity("set1", "data", 0);
    store.with_state(|state| {
        for suffix in ["aaaaa", "bbbbb"] {
            let name = format!("{}-{}", identity, suffix);
            state.claims.insert(
                name.clone(),
                PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some(name),
                        labels: Some(btreemap! { LABEL_KEY_DEVICE_SET_PVC_ID.to_string() => identity.clone() }),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            );
        }
    });
    let mut errors = Vec::new();

    let targets = prepare_device_sets(&cluster, &store, &mut errors).await;

    assert!(targets.is_empty(), "expected the ambiguous index to fail, got {} targets", targets.len());
    assert_eq!(errors.len(), 1, "expected exactly one error, got {:?}", errors);
    Ok(())
}

#[test]
fn claim_identity_is_stable() {
    let identity = claim_identity("set1", "data", 3);
    assert_eq!(identity, "set1-data-3", "unexpected claim identity, got {}", identity);
}
