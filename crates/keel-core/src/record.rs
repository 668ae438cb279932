//! Typed resource records.
//!
//! A [`Record`] pairs store-managed [`ObjectMeta`] with an author-supplied
//! `spec` and an engine-owned `status`. The shape of `spec` and `status` is
//! fixed per kind through the [`ResourceKind`] trait.
//!
//! ## Ownership rules
//!
//! - `spec` is written by authors only. Once `deletion_timestamp` is set the
//!   store refuses spec changes.
//! - `status` is written by the engine only, through `update_status`.
//! - `finalizers` holds cleanup tokens. The store keeps a record whose
//!   deletion was requested until this set is empty.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::id::{RecordKey, RecordUid};

/// A kind of record the store can hold.
///
/// Implemented by zero-sized marker types in [`crate::api`].
pub trait ResourceKind: Send + Sync + 'static {
    /// Kind name, used in errors, logs and metric labels.
    const KIND: &'static str;

    /// Desired state.
    type Spec: Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Observed state.
    type Status: Clone
        + PartialEq
        + Default
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// Field paths and values this kind exposes for indexed lookup.
    fn indexed_fields(_spec: &Self::Spec) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

/// Reference from a dependent record to the record that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    /// Kind of the owner.
    pub kind: String,
    /// Name of the owner, in the dependent's namespace.
    pub name: String,
    /// Uid of the owner incarnation.
    pub uid: RecordUid,
}

/// Store-managed metadata shared by every record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Scope the record lives in.
    pub namespace: String,
    /// Name, unique within the namespace.
    pub name: String,
    /// Assigned on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<RecordUid>,
    /// Optimistic-concurrency version, bumped on every write.
    #[serde(default)]
    pub resource_version: u64,
    /// Bumped whenever `spec` changes.
    #[serde(default)]
    pub generation: u64,
    /// Free-form labels used for selection.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Free-form annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Ordered set of cleanup tokens.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Owners of this record.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    /// Set by the store on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set once removal has been requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Creates metadata for a record that has not been stored yet.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: None,
            resource_version: 0,
            generation: 0,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            finalizers: Vec::new(),
            owner_references: Vec::new(),
            creation_timestamp: None,
            deletion_timestamp: None,
        }
    }

    /// Returns the record key.
    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.namespace, &self.name)
    }

    /// Returns true once removal has been requested.
    #[must_use]
    pub const fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Returns true if `token` is in the finalizer set.
    #[must_use]
    pub fn has_finalizer(&self, token: &str) -> bool {
        self.finalizers.iter().any(|f| f == token)
    }

    /// Adds `token` to the finalizer set. Returns false if it was present.
    pub fn add_finalizer(&mut self, token: &str) -> bool {
        if self.has_finalizer(token) {
            return false;
        }
        self.finalizers.push(token.to_string());
        true
    }

    /// Removes `token` from the finalizer set. Returns false if it was absent.
    pub fn remove_finalizer(&mut self, token: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != token);
        self.finalizers.len() != before
    }

    /// Returns true if an owner reference to `uid` exists.
    #[must_use]
    pub fn is_owned_by(&self, uid: RecordUid) -> bool {
        self.owner_references.iter().any(|o| o.uid == uid)
    }

    /// Returns the value of an annotation.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Returns true if every `(key, value)` in `selector` is present in the labels.
    #[must_use]
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// A typed record as held by the store.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Record<K: ResourceKind> {
    /// Store-managed metadata.
    pub meta: ObjectMeta,
    /// Desired state.
    pub spec: K::Spec,
    /// Observed state.
    #[serde(default)]
    pub status: K::Status,
}

impl<K: ResourceKind> Record<K> {
    /// Creates an unsaved record with default status.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: K::Spec) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            spec,
            status: K::Status::default(),
        }
    }

    /// Returns the record key.
    #[must_use]
    pub fn key(&self) -> RecordKey {
        self.meta.key()
    }

    /// Adds a label, builder style.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.labels.insert(key.into(), value.into());
        self
    }

    /// Adds an annotation, builder style.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.annotations.insert(key.into(), value.into());
        self
    }
}

impl<K: ResourceKind> Clone for Record<K> {
    fn clone(&self) -> Self {
        Self {
            meta: self.meta.clone(),
            spec: self.spec.clone(),
            status: self.status.clone(),
        }
    }
}

impl<K: ResourceKind> PartialEq for Record<K> {
    fn eq(&self, other: &Self) -> bool {
        self.meta == other.meta && self.spec == other.spec && self.status == other.status
    }
}

impl<K: ResourceKind> fmt::Debug for Record<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(K::KIND)
            .field("meta", &self.meta)
            .field("spec", &self.spec)
            .field("status", &self.status)
            .finish()
    }
}

/// A status condition.
///
/// Conditions record facts about a record that are not transient, such as a
/// spec that cannot be mapped onto the remote model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. `Invalid`.
    #[serde(rename = "type")]
    pub type_: String,
    /// Short machine-readable reason.
    pub reason: String,
    /// Human-readable detail.
    pub message: String,
    /// Generation the condition was computed from.
    pub observed_generation: u64,
    /// When the condition last changed.
    pub last_transition_time: DateTime<Utc>,
}

/// Status types that carry a condition list.
pub trait HasConditions {
    /// Returns the conditions.
    fn conditions(&self) -> &[Condition];

    /// Returns the conditions for editing.
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    /// Returns the condition of the given type.
    fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions().iter().find(|c| c.type_ == type_)
    }

    /// Sets a condition, keeping the transition time when nothing changed.
    ///
    /// Returns true if the status changed.
    fn set_condition(
        &mut self,
        type_: &str,
        reason: &str,
        message: &str,
        observed_generation: u64,
    ) -> bool {
        if let Some(existing) = self.conditions().iter().find(|c| c.type_ == type_) {
            if existing.reason == reason
                && existing.message == message
                && existing.observed_generation == observed_generation
            {
                return false;
            }
        }
        let conditions = self.conditions_mut();
        conditions.retain(|c| c.type_ != type_);
        conditions.push(Condition {
            type_: type_.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
            last_transition_time: Utc::now(),
        });
        true
    }

    /// Removes a condition. Returns true if it was present.
    fn clear_condition(&mut self, type_: &str) -> bool {
        let conditions = self.conditions_mut();
        let before = conditions.len();
        conditions.retain(|c| c.type_ != type_);
        conditions.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::topo::{Kind, TopoStatus};

    #[test]
    fn finalizers_behave_as_a_set() {
        let mut meta = ObjectMeta::new("ns", "a");
        assert!(meta.add_finalizer("keel.dev/remote"));
        assert!(!meta.add_finalizer("keel.dev/remote"));
        assert_eq!(meta.finalizers.len(), 1);
        assert!(meta.remove_finalizer("keel.dev/remote"));
        assert!(!meta.remove_finalizer("keel.dev/remote"));
        assert!(!meta.has_finalizer("keel.dev/remote"));
    }

    #[test]
    fn label_selector_requires_every_pair() {
        let mut meta = ObjectMeta::new("ns", "a");
        meta.labels.insert("app".into(), "topo".into());
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), "topo".to_string());
        assert!(meta.matches_labels(&selector));
        selector.insert("tier".to_string(), "core".to_string());
        assert!(!meta.matches_labels(&selector));
    }

    #[test]
    fn set_condition_is_stable_for_same_input() {
        let mut status = TopoStatus::default();
        assert!(status.set_condition("Invalid", "EmptyUri", "uri is empty", 2));
        let first = status.condition("Invalid").cloned().unwrap();
        assert!(!status.set_condition("Invalid", "EmptyUri", "uri is empty", 2));
        assert_eq!(status.condition("Invalid"), Some(&first));
        assert!(status.set_condition("Invalid", "EmptyUri", "uri is empty", 3));
        assert!(status.clear_condition("Invalid"));
        assert!(status.conditions().is_empty());
    }

    #[test]
    fn record_serializes_with_camel_case_meta() {
        let record = Record::<Kind>::new("ns", "switch", crate::api::topo::KindSpec::default());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["meta"]["resourceVersion"], 0);
        let back: Record<Kind> = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
