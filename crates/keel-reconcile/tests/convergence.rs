//! Convergence tests for topology records against the in-memory topology
//! service: finalizer lifecycle, idempotence, teardown and invalid state.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use keel_core::api::topo::{Entity, EntitySpec, ObjectRef};
use keel_core::id::RecordKey;
use keel_core::record::{HasConditions, Record};
use keel_core::store::ResourceStore;
use keel_reconcile::config::{Config, IdentityField};
use keel_reconcile::engine::INVALID_CONDITION;
use keel_reconcile::remote::{Code, TopoObjectType};
use keel_test_utils::{
    Harness, TEST_NAMESPACE, assert_has_finalizer, assert_invalid, assert_not_invalid,
    assert_settled, drive, entity, fetch, kind, relation,
};

async fn uri_harness() -> Harness {
    let config = Config {
        identity_field: IdentityField::Uri,
        ..Harness::new().config
    };
    let h = Harness::with_config(config);
    h.add_namespace(TEST_NAMESPACE).await;
    h.add_topo_service(TEST_NAMESPACE).await;
    h
}

async fn converged_entity(h: &Harness) -> RecordKey {
    h.kinds.create(kind(TEST_NAMESPACE, "switch")).await.unwrap();
    let key = h
        .entities
        .create(entity(TEST_NAMESPACE, "leaf-1", "switch"))
        .await
        .unwrap()
        .key();
    drive(&h.entity_engine(), &key).await;
    key
}

#[tokio::test]
async fn entity_converges_with_finalizer_owner_and_remote_object() {
    keel_test_utils::init_test_logging();
    let h = Harness::with_topology().await;
    let kind = h.kinds.create(kind(TEST_NAMESPACE, "switch")).await.unwrap();
    let key = h
        .entities
        .create(entity(TEST_NAMESPACE, "leaf-1", "switch"))
        .await
        .unwrap()
        .key();

    // finalizer, owner reference, create
    let outcomes = drive(&h.entity_engine(), &key).await;
    assert_settled(&outcomes, 3);

    let record = fetch(&h.entities, &key).await;
    assert_has_finalizer(&record, &h.config.finalizer);
    assert!(record.meta.is_owned_by(kind.meta.uid.unwrap()));
    assert_eq!(record.meta.owner_references[0].kind, "Kind");

    let object = h.topo.object("leaf-1").unwrap().expect("remote entity");
    assert_eq!(object.object_type, TopoObjectType::Entity);
    assert_eq!(object.kind_id.as_deref(), Some("switch"));
    assert_eq!(h.topo.mutations().unwrap(), 1);
}

#[tokio::test]
async fn converged_record_is_a_fixed_point() {
    let h = Harness::with_topology().await;
    let key = converged_entity(&h).await;
    let before = fetch(&h.entities, &key).await;
    let gets = h.topo.calls("get").unwrap();

    for _ in 0..3 {
        let outcome = h.entity_engine().reconcile(&key).await.unwrap();
        assert!(!outcome.requeue);
    }

    assert_eq!(h.topo.mutations().unwrap(), 1, "no remote writes once converged");
    assert_eq!(h.topo.calls("get").unwrap(), gets + 3);
    let after = fetch(&h.entities, &key).await;
    assert_eq!(after.meta.resource_version, before.meta.resource_version);
}

#[tokio::test]
async fn kind_without_owner_converges_in_two_steps() {
    let h = Harness::with_topology().await;
    let key = h
        .kinds
        .create(kind(TEST_NAMESPACE, "switch"))
        .await
        .unwrap()
        .key();

    let outcomes = drive(&h.kind_engine(), &key).await;
    assert_settled(&outcomes, 2);
    let object = h.topo.object("switch").unwrap().unwrap();
    assert_eq!(object.object_type, TopoObjectType::Kind);
    assert!(object.kind_id.is_none());
    assert!(object.aspects.contains_key("keel.topo.Configurable"));
}

#[tokio::test]
async fn spec_change_updates_remote_object() {
    let h = Harness::with_topology().await;
    let key = converged_entity(&h).await;

    let mut record = fetch(&h.entities, &key).await;
    record
        .spec
        .aspects
        .insert("keel.topo.Location".into(), serde_json::json!({ "rack": 4 }));
    let record = h.entities.update(&record).await.unwrap();
    assert_eq!(record.meta.generation, 2);

    let outcomes = drive(&h.entity_engine(), &key).await;
    assert_settled(&outcomes, 1);
    assert_eq!(h.topo.calls("update").unwrap(), 1);
    let object = h.topo.object("leaf-1").unwrap().unwrap();
    assert_eq!(object.aspects["keel.topo.Location"]["rack"], 4);
}

#[tokio::test]
async fn out_of_band_removal_is_repaired() {
    let h = Harness::with_topology().await;
    let key = converged_entity(&h).await;
    h.topo.remove_out_of_band("leaf-1").unwrap();

    drive(&h.entity_engine(), &key).await;
    assert!(h.topo.object("leaf-1").unwrap().is_some());
    assert_eq!(h.topo.calls("create").unwrap(), 2);
}

#[tokio::test]
async fn racing_create_is_treated_as_success() {
    let h = Harness::with_topology().await;
    h.kinds.create(kind(TEST_NAMESPACE, "switch")).await.unwrap();
    let key = h
        .entities
        .create(entity(TEST_NAMESPACE, "leaf-1", "switch"))
        .await
        .unwrap()
        .key();
    h.topo.fail_next("create", Code::AlreadyExists).unwrap();

    let outcomes = drive(&h.entity_engine(), &key).await;
    assert_settled(&outcomes, 3);
}

#[tokio::test]
async fn deletion_removes_remote_object_then_finalizer() {
    let h = Harness::with_topology().await;
    let key = converged_entity(&h).await;

    h.entities.delete(&key).await.unwrap();
    assert!(fetch(&h.entities, &key).await.meta.is_deleting());

    let outcomes = drive(&h.entity_engine(), &key).await;
    assert_settled(&outcomes, 1);
    assert!(h.topo.object("leaf-1").unwrap().is_none());
    assert!(h.entities.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn remote_not_found_on_delete_counts_as_deleted() {
    let h = Harness::with_topology().await;
    let key = converged_entity(&h).await;
    h.topo.remove_out_of_band("leaf-1").unwrap();

    h.entities.delete(&key).await.unwrap();
    drive(&h.entity_engine(), &key).await;

    assert_eq!(h.topo.calls("delete").unwrap(), 1);
    assert!(h.entities.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_delete_keeps_finalizer() {
    let h = Harness::with_topology().await;
    let key = converged_entity(&h).await;
    h.entities.delete(&key).await.unwrap();
    h.topo.fail_next("delete", Code::Unavailable).unwrap();

    let err = h.entity_engine().reconcile(&key).await.unwrap_err();
    assert!(err.class().is_retryable());
    let record = fetch(&h.entities, &key).await;
    assert_has_finalizer(&record, &h.config.finalizer);
    assert!(h.topo.object("leaf-1").unwrap().is_some());

    drive(&h.entity_engine(), &key).await;
    assert!(h.entities.get(&key).await.unwrap().is_none());
    assert!(h.topo.object("leaf-1").unwrap().is_none());
}

#[tokio::test]
async fn terminating_namespace_skips_remote_cleanup() {
    let h = Harness::with_topology().await;
    let key = converged_entity(&h).await;

    h.terminate_namespace(TEST_NAMESPACE).await;
    h.entities.delete(&key).await.unwrap();
    drive(&h.entity_engine(), &key).await;

    assert!(h.entities.get(&key).await.unwrap().is_none());
    assert_eq!(h.topo.calls("delete").unwrap(), 0);
    assert!(h.topo.object("leaf-1").unwrap().is_some());
}

#[tokio::test]
async fn missing_topology_service_is_retryable_after_finalizer() {
    let h = Harness::new();
    h.add_namespace(TEST_NAMESPACE).await;
    let key = h
        .entities
        .create(entity(TEST_NAMESPACE, "leaf-1", "switch"))
        .await
        .unwrap()
        .key();
    let engine = h.entity_engine();

    assert!(engine.reconcile(&key).await.unwrap().requeue);
    let err = engine.reconcile(&key).await.unwrap_err();
    assert!(err.class().is_retryable(), "{err}");

    h.add_topo_service(TEST_NAMESPACE).await;
    drive(&engine, &key).await;
    assert!(h.topo.object("leaf-1").unwrap().is_some());
}

#[tokio::test]
async fn relation_references_source_and_target() {
    let h = Harness::with_topology().await;
    let key = h
        .relations
        .create(relation(TEST_NAMESPACE, "leaf-1-spine-1", "link", "leaf-1", "spine-1"))
        .await
        .unwrap()
        .key();

    drive(&h.relation_engine(), &key).await;
    let object = h.topo.object("leaf-1-spine-1").unwrap().unwrap();
    assert_eq!(object.object_type, TopoObjectType::Relation);
    assert_eq!(object.kind_id.as_deref(), Some("link"));
    assert_eq!(object.source_id.as_deref(), Some("leaf-1"));
    assert_eq!(object.target_id.as_deref(), Some("spine-1"));
}

#[tokio::test]
async fn empty_uri_is_reported_and_not_retried() {
    let h = uri_harness().await;
    let key = h
        .entities
        .create(entity(TEST_NAMESPACE, "leaf-1", "switch"))
        .await
        .unwrap()
        .key();

    let outcomes = drive(&h.entity_engine(), &key).await;
    assert_settled(&outcomes, 2);
    let record = fetch(&h.entities, &key).await;
    assert_invalid(&record, "EmptyUri");
    assert_eq!(h.topo.mutations().unwrap(), 0);

    // Re-running does not rewrite an unchanged condition.
    drive(&h.entity_engine(), &key).await;
    let again = fetch(&h.entities, &key).await;
    assert_eq!(again.meta.resource_version, record.meta.resource_version);
}

#[tokio::test]
async fn fixing_the_spec_clears_the_invalid_condition() {
    let h = uri_harness().await;
    let key = h
        .entities
        .create(entity(TEST_NAMESPACE, "leaf-1", "switch"))
        .await
        .unwrap()
        .key();
    drive(&h.entity_engine(), &key).await;

    let mut record = fetch(&h.entities, &key).await;
    record.spec.uri = Some("device:leaf-1".into());
    h.entities.update(&record).await.unwrap();
    drive(&h.entity_engine(), &key).await;

    let record = fetch(&h.entities, &key).await;
    assert_not_invalid(&record);
    assert!(h.topo.object("device:leaf-1").unwrap().is_some());
}

#[tokio::test]
async fn invalid_record_is_released_without_remote_call() {
    let h = uri_harness().await;
    let key = h
        .entities
        .create(entity(TEST_NAMESPACE, "leaf-1", "switch"))
        .await
        .unwrap()
        .key();
    drive(&h.entity_engine(), &key).await;

    h.entities.delete(&key).await.unwrap();
    drive(&h.entity_engine(), &key).await;
    assert!(h.entities.get(&key).await.unwrap().is_none());
    assert_eq!(h.topo.calls("delete").unwrap(), 0);
}

#[tokio::test]
async fn empty_kind_reference_is_invalid() {
    let h = Harness::with_topology().await;
    let key = h
        .entities
        .create(Record::<Entity>::new(
            TEST_NAMESPACE,
            "orphan",
            EntitySpec {
                kind: ObjectRef::named(""),
                ..EntitySpec::default()
            },
        ))
        .await
        .unwrap()
        .key();

    drive(&h.entity_engine(), &key).await;
    let record = fetch(&h.entities, &key).await;
    assert_invalid(&record, "EmptyKind");
    assert!(record.status.condition(INVALID_CONDITION).is_some());
}
