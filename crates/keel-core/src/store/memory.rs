//! In-memory record store.
//!
//! This module provides [`InMemoryResourceStore`], a simple implementation of
//! the [`ResourceStore`] trait suitable for testing and local simulation.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **Single-process only**: State is not shared across process boundaries
//! - **Bounded watch buffer**: Slow subscribers observe `Lagged` and must relist

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;

use super::{EventType, ListOptions, ResourceStore, WatchEvent};
use crate::error::{Error, Result};
use crate::id::{RecordKey, RecordUid};
use crate::record::{Record, ResourceKind};

/// Capacity of the watch channel.
const WATCH_CAPACITY: usize = 1024;

/// In-memory record store for testing.
///
/// ## Example
///
/// ```rust
/// use keel_core::api::topo::{Kind, KindSpec};
/// use keel_core::record::Record;
/// use keel_core::store::ResourceStore;
/// use keel_core::store::memory::InMemoryResourceStore;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> keel_core::Result<()> {
/// let store = InMemoryResourceStore::<Kind>::new();
/// let stored = store.create(Record::new("network", "switch", KindSpec::default())).await?;
/// assert_eq!(stored.meta.resource_version, 1);
/// # Ok(())
/// # }
/// ```
pub struct InMemoryResourceStore<K: ResourceKind> {
    records: RwLock<BTreeMap<RecordKey, Record<K>>>,
    events: broadcast::Sender<WatchEvent>,
}

impl<K: ResourceKind> std::fmt::Debug for InMemoryResourceStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryResourceStore")
            .field("kind", &K::KIND)
            .finish_non_exhaustive()
    }
}

impl<K: ResourceKind> Default for InMemoryResourceStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl<K: ResourceKind> InMemoryResourceStore<K> {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            records: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Returns the number of records currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.records.read().map_err(poison_err)?.len())
    }

    /// Returns true if the store holds no records.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn emit(&self, event_type: EventType, key: RecordKey) {
        // No receivers is fine.
        let _ = self.events.send(WatchEvent {
            event_type,
            kind: K::KIND,
            key,
        });
    }

    fn check_version(existing: &Record<K>, incoming: &Record<K>) -> Result<()> {
        if existing.meta.resource_version == incoming.meta.resource_version {
            Ok(())
        } else {
            Err(Error::Conflict {
                kind: K::KIND,
                key: existing.key().to_string(),
                expected: incoming.meta.resource_version,
                actual: existing.meta.resource_version,
            })
        }
    }
}

#[async_trait]
impl<K: ResourceKind> ResourceStore<K> for InMemoryResourceStore<K> {
    async fn get(&self, key: &RecordKey) -> Result<Option<Record<K>>> {
        let records = self.records.read().map_err(poison_err)?;
        Ok(records.get(key).cloned())
    }

    async fn list(&self, options: &ListOptions) -> Result<Vec<Record<K>>> {
        let records = self.records.read().map_err(poison_err)?;
        Ok(records
            .values()
            .filter(|r| options.matches(*r))
            .cloned()
            .collect())
    }

    async fn create(&self, mut record: Record<K>) -> Result<Record<K>> {
        let key = record.key();
        if key.namespace.is_empty() || key.name.is_empty() {
            return Err(Error::Invalid(format!(
                "{} requires a namespace and a name",
                K::KIND
            )));
        }
        {
            let mut records = self.records.write().map_err(poison_err)?;
            if records.contains_key(&key) {
                return Err(Error::AlreadyExists {
                    kind: K::KIND,
                    key: key.to_string(),
                });
            }
            record.meta.uid = Some(RecordUid::generate());
            record.meta.resource_version = 1;
            record.meta.generation = 1;
            record.meta.creation_timestamp = Some(Utc::now());
            record.meta.deletion_timestamp = None;
            records.insert(key.clone(), record.clone());
        }
        self.emit(EventType::Added, key);
        Ok(record)
    }

    async fn update(&self, record: &Record<K>) -> Result<Record<K>> {
        let key = record.key();
        let (stored, removed) = {
            let mut records = self.records.write().map_err(poison_err)?;
            let existing = records
                .get(&key)
                .ok_or_else(|| Error::not_found(K::KIND, &key))?;
            Self::check_version(existing, record)?;

            let spec_changed = existing.spec != record.spec;
            if spec_changed && existing.meta.is_deleting() {
                return Err(Error::Invalid(format!(
                    "{} {key} is being deleted; spec is frozen",
                    K::KIND
                )));
            }

            let mut next = existing.clone();
            next.spec = record.spec.clone();
            next.meta.labels = record.meta.labels.clone();
            next.meta.annotations = record.meta.annotations.clone();
            next.meta.finalizers = record.meta.finalizers.clone();
            next.meta.owner_references = record.meta.owner_references.clone();
            next.meta.resource_version += 1;
            if spec_changed {
                next.meta.generation += 1;
            }

            let removed = next.meta.is_deleting() && next.meta.finalizers.is_empty();
            if removed {
                records.remove(&key);
            } else {
                records.insert(key.clone(), next.clone());
            }
            (next, removed)
        };
        let event = if removed {
            EventType::Deleted
        } else {
            EventType::Modified
        };
        self.emit(event, key);
        Ok(stored)
    }

    async fn update_status(&self, record: &Record<K>) -> Result<Record<K>> {
        let key = record.key();
        let stored = {
            let mut records = self.records.write().map_err(poison_err)?;
            let existing = records
                .get_mut(&key)
                .ok_or_else(|| Error::not_found(K::KIND, &key))?;
            Self::check_version(existing, record)?;
            existing.status = record.status.clone();
            existing.meta.resource_version += 1;
            existing.clone()
        };
        self.emit(EventType::Modified, key);
        Ok(stored)
    }

    async fn delete(&self, key: &RecordKey) -> Result<()> {
        let event = {
            let mut records = self.records.write().map_err(poison_err)?;
            let existing = records
                .get_mut(key)
                .ok_or_else(|| Error::not_found(K::KIND, key))?;
            if existing.meta.finalizers.is_empty() {
                records.remove(key);
                Some(EventType::Deleted)
            } else if existing.meta.is_deleting() {
                None
            } else {
                existing.meta.deletion_timestamp = Some(Utc::now());
                existing.meta.resource_version += 1;
                Some(EventType::Modified)
            }
        };
        if let Some(event) = event {
            self.emit(event, key.clone());
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::topo::{Entity, EntitySpec, KIND_NAME_FIELD, ObjectRef};
    use crate::error::ErrorClass;

    fn entity(name: &str, kind: &str) -> Record<Entity> {
        Record::new(
            "network",
            name,
            EntitySpec {
                kind: ObjectRef::named(kind),
                ..EntitySpec::default()
            },
        )
    }

    #[tokio::test]
    async fn create_assigns_metadata_and_rejects_duplicates() {
        let store = InMemoryResourceStore::<Entity>::new();
        let stored = store.create(entity("leaf-1", "switch")).await.unwrap();
        assert_eq!(stored.meta.resource_version, 1);
        assert_eq!(stored.meta.generation, 1);
        assert!(stored.meta.uid.is_some());

        let err = store.create(entity("leaf-1", "switch")).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::AlreadyExists);
    }

    #[tokio::test]
    async fn stale_writes_conflict() {
        let store = InMemoryResourceStore::<Entity>::new();
        let stored = store.create(entity("leaf-1", "switch")).await.unwrap();
        let mut first = stored.clone();
        first.meta.add_finalizer("f");
        store.update(&first).await.unwrap();

        let mut stale = stored;
        stale.status.conditions.clear();
        let err = store.update_status(&stale).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Conflict);
    }

    #[tokio::test]
    async fn update_bumps_generation_only_on_spec_change() {
        let store = InMemoryResourceStore::<Entity>::new();
        let stored = store.create(entity("leaf-1", "switch")).await.unwrap();

        let mut meta_only = stored.clone();
        meta_only.meta.labels.insert("tier".into(), "leaf".into());
        let stored = store.update(&meta_only).await.unwrap();
        assert_eq!(stored.meta.generation, 1);

        let mut spec_change = stored.clone();
        spec_change.spec.uri = Some("leaf:1".into());
        let stored = store.update(&spec_change).await.unwrap();
        assert_eq!(stored.meta.generation, 2);
        assert_eq!(stored.meta.resource_version, 3);
    }

    #[tokio::test]
    async fn delete_waits_for_finalizers() {
        let store = InMemoryResourceStore::<Entity>::new();
        let mut stored = store.create(entity("leaf-1", "switch")).await.unwrap();
        stored.meta.add_finalizer("keel.dev/remote");
        let stored = store.update(&stored).await.unwrap();

        store.delete(&stored.key()).await.unwrap();
        let pending = store.get(&stored.key()).await.unwrap().unwrap();
        assert!(pending.meta.is_deleting());

        let mut frozen = pending.clone();
        frozen.spec.uri = Some("changed".into());
        let err = store.update(&frozen).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Invalid);

        let mut cleared = pending;
        cleared.meta.remove_finalizer("keel.dev/remote");
        store.update(&cleared).await.unwrap();
        assert!(store.get(&cleared.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_without_finalizers_removes_immediately() {
        let store = InMemoryResourceStore::<Entity>::new();
        let stored = store.create(entity("leaf-1", "switch")).await.unwrap();
        let mut events = store.watch();
        store.delete(&stored.key()).await.unwrap();
        assert!(store.is_empty().unwrap());
        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::Deleted);
        assert_eq!(event.kind, "Entity");

        let err = store.delete(&stored.key()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[tokio::test]
    async fn list_filters_by_namespace_label_and_field() {
        let store = InMemoryResourceStore::<Entity>::new();
        store
            .create(entity("leaf-1", "switch").with_label("tier", "leaf"))
            .await
            .unwrap();
        store.create(entity("spine-1", "switch")).await.unwrap();
        store.create(entity("host-1", "server")).await.unwrap();
        let mut other = entity("leaf-9", "switch");
        other.meta.namespace = "lab".into();
        store.create(other).await.unwrap();

        let switches = store
            .list(&ListOptions::in_namespace("network").with_field(KIND_NAME_FIELD, "switch"))
            .await
            .unwrap();
        let names: Vec<_> = switches.iter().map(|r| r.meta.name.as_str()).collect();
        assert_eq!(names, ["leaf-1", "spine-1"]);

        let leaves = store
            .list(&ListOptions::all().with_label("tier", "leaf"))
            .await
            .unwrap();
        assert_eq!(leaves.len(), 1);
    }
}
