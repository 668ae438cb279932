//! Pluggable storage for typed records.
//!
//! The [`ResourceStore`] trait is the only way controllers read and write
//! records. The durable implementation lives outside this workspace; the
//! in-memory implementation in [`memory`] backs tests and local simulation.
//!
//! ## Design Principles
//!
//! - **Optimistic concurrency**: every write carries the `resource_version` the
//!   caller read; a stale version fails with [`Error::Conflict`](crate::Error)
//! - **Split writes**: `update` never touches `status`, `update_status` never
//!   touches `spec` or metadata
//! - **Deferred removal**: `delete` only marks a record while finalizers remain;
//!   the write that empties the finalizer set removes it
//! - **Level-triggered watches**: events carry keys, never diffs. Subscribers
//!   re-read current state.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::id::RecordKey;
use crate::record::{Record, ResourceKind};

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// The record was created.
    Added,
    /// The record changed, including a deletion request.
    Modified,
    /// The record was physically removed.
    Deleted,
}

/// A change notification for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// What happened.
    pub event_type: EventType,
    /// Kind of the record.
    pub kind: &'static str,
    /// Key of the record.
    pub key: RecordKey,
}

/// Filters for [`ResourceStore::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Restrict to one namespace.
    pub namespace: Option<String>,
    /// Every label must match.
    pub labels: BTreeMap<String, String>,
    /// Indexed field path and value that must match.
    pub field: Option<(String, String)>,
}

impl ListOptions {
    /// Lists every record.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Lists records in one namespace.
    #[must_use]
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    /// Adds a label requirement.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Adds several label requirements.
    #[must_use]
    pub fn with_labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        self.labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Adds an indexed field requirement.
    #[must_use]
    pub fn with_field(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.field = Some((path.into(), value.into()));
        self
    }

    /// Returns true if `record` passes every filter.
    #[must_use]
    pub fn matches<K: ResourceKind>(&self, record: &Record<K>) -> bool {
        if self
            .namespace
            .as_deref()
            .is_some_and(|ns| ns != record.meta.namespace)
        {
            return false;
        }
        if !record.meta.matches_labels(&self.labels) {
            return false;
        }
        match &self.field {
            None => true,
            Some((path, value)) => K::indexed_fields(&record.spec)
                .iter()
                .any(|(p, v)| p == path && v == value),
        }
    }
}

/// Typed record storage with optimistic concurrency and watches.
///
/// ## Write Semantics
///
/// | Operation | Touches | Version check |
/// |-----------|---------|---------------|
/// | `create` | everything | key must be free |
/// | `update` | spec, labels, annotations, finalizers, owners | yes |
/// | `update_status` | status | yes |
/// | `delete` | deletion marker | no |
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent reconciles.
#[async_trait]
pub trait ResourceStore<K: ResourceKind>: Send + Sync {
    /// Gets a record by key.
    ///
    /// Returns `None` if the record does not exist.
    async fn get(&self, key: &RecordKey) -> Result<Option<Record<K>>>;

    /// Lists records matching `options`, ordered by key.
    async fn list(&self, options: &ListOptions) -> Result<Vec<Record<K>>>;

    /// Stores a new record and returns it with store-assigned metadata.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the key is taken.
    async fn create(&self, record: Record<K>) -> Result<Record<K>>;

    /// Replaces spec and mutable metadata.
    ///
    /// Returns the stored record. If the record was pending removal and the
    /// write empties its finalizer set, the record is removed and the returned
    /// value is its final state.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Conflict` on a stale `resource_version`, or
    /// `Invalid` when the spec changes after deletion was requested.
    async fn update(&self, record: &Record<K>) -> Result<Record<K>>;

    /// Replaces status only.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `Conflict` on a stale `resource_version`.
    async fn update_status(&self, record: &Record<K>) -> Result<Record<K>>;

    /// Requests removal of a record.
    ///
    /// Records without finalizers are removed immediately; others are marked
    /// with a deletion timestamp and kept until the finalizers are cleared.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the record does not exist.
    async fn delete(&self, key: &RecordKey) -> Result<()>;

    /// Subscribes to change notifications.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
