//! Contracts the controllers rely on: watch event order over a record's
//! lifecycle and the wire shape of stored records.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use keel_core::api::config::{InstallPhase, Model, ModelSpec, ModelStatus, RegistryStatus};
use keel_core::api::topo::{Entity, EntitySpec, ObjectRef};
use keel_core::prelude::*;
use tokio::sync::broadcast::error::TryRecvError;

fn leaf() -> Record<Entity> {
    Record::new(
        "network",
        "leaf-1",
        EntitySpec {
            kind: ObjectRef::named("switch"),
            ..EntitySpec::default()
        },
    )
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<WatchEvent>) -> Vec<EventType> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event.event_type),
            Err(TryRecvError::Empty) => return seen,
            Err(err) => panic!("watch failed: {err}"),
        }
    }
}

#[tokio::test]
async fn finalized_lifecycle_emits_ordered_events() {
    let store = InMemoryResourceStore::<Entity>::new();
    let mut events = store.watch();

    let mut record = store.create(leaf()).await.unwrap();
    record.meta.add_finalizer("keel.dev/remote-state");
    let record = store.update(&record).await.unwrap();
    store.delete(&record.key()).await.unwrap();
    // A repeated deletion request changes nothing.
    store.delete(&record.key()).await.unwrap();

    let mut deleting = store.get(&record.key()).await.unwrap().unwrap();
    assert!(deleting.meta.is_deleting());
    deleting.meta.remove_finalizer("keel.dev/remote-state");
    store.update(&deleting).await.unwrap();

    assert_eq!(
        drain(&mut events),
        [
            EventType::Added,
            EventType::Modified,
            EventType::Modified,
            EventType::Deleted
        ]
    );
    assert!(store.get(&record.key()).await.unwrap().is_none());
}

#[tokio::test]
async fn deleting_records_refuse_spec_changes_but_accept_status() {
    let store = InMemoryResourceStore::<Entity>::new();
    let mut record = store.create(leaf()).await.unwrap();
    record.meta.add_finalizer("keel.dev/remote-state");
    store.update(&record).await.unwrap();
    store.delete(&record.key()).await.unwrap();

    let mut deleting = store.get(&record.key()).await.unwrap().unwrap();
    deleting.spec.uri = Some("device:leaf-1".into());
    let err = store.update(&deleting).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Invalid);

    let mut deleting = store.get(&record.key()).await.unwrap().unwrap();
    let before = deleting.meta.resource_version;
    let generation = deleting.meta.generation;
    assert!(
        deleting
            .status
            .set_condition("Invalid", "EmptyUri", "no uri", generation)
    );
    let stored = store.update_status(&deleting).await.unwrap();
    assert_eq!(stored.meta.resource_version, before + 1);
    assert_eq!(stored.meta.generation, deleting.meta.generation);
}

#[tokio::test]
async fn model_records_use_camel_case_wire_names() {
    let store = InMemoryResourceStore::<Model>::new();
    let mut record = Record::<Model>::new("network", "devicesim", ModelSpec::default());
    record.status = ModelStatus {
        registry_statuses: vec![RegistryStatus {
            target: TargetId::new("network/config-0"),
            phase: InstallPhase::Pending,
            artifact: None,
        }],
        conditions: Vec::new(),
    };
    let stored = store.create(record).await.unwrap();

    let json = serde_json::to_value(&stored).unwrap();
    assert_eq!(json["meta"]["resourceVersion"], 1);
    assert_eq!(json["meta"]["generation"], 1);
    assert!(json["meta"]["creationTimestamp"].is_string());
    assert_eq!(json["status"]["registryStatuses"][0]["phase"], "Pending");

    let back: Record<Model> = serde_json::from_value(json).unwrap();
    assert_eq!(back, stored);
}
