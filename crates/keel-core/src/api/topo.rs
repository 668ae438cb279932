//! Topology kinds: `Kind`, `Entity` and `Relation`.
//!
//! Each topology record maps onto exactly one object in the remote topology
//! service. Entities and relations reference their kind by name, which is
//! also exposed as the indexed field [`KIND_NAME_FIELD`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::{Condition, HasConditions, ResourceKind};

/// Indexed field holding the referenced kind name.
pub const KIND_NAME_FIELD: &str = "spec.kind.name";

/// Free-form typed properties attached to a topology object.
pub type Aspects = BTreeMap<String, serde_json::Value>;

/// Reference to another record in the same namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    /// Record name.
    pub name: String,
    /// Remote URI of the referenced object, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl ObjectRef {
    /// Creates a reference by name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: None,
        }
    }
}

/// Observed state of a topology record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopoStatus {
    /// Non-transient facts about the record.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HasConditions for TopoStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

/// Marker for topology kind records.
#[derive(Debug)]
pub struct Kind;

/// Desired state of a topology kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindSpec {
    /// Aspects copied onto the remote kind.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aspects: Aspects,
}

impl ResourceKind for Kind {
    const KIND: &'static str = "Kind";
    type Spec = KindSpec;
    type Status = TopoStatus;
}

/// Marker for topology entity records.
#[derive(Debug)]
pub struct Entity;

/// Desired state of a topology entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySpec {
    /// Remote URI, used as the remote identity in URI mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Kind of the entity.
    pub kind: ObjectRef,
    /// Aspects copied onto the remote entity.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aspects: Aspects,
}

impl ResourceKind for Entity {
    const KIND: &'static str = "Entity";
    type Spec = EntitySpec;
    type Status = TopoStatus;

    fn indexed_fields(spec: &EntitySpec) -> Vec<(&'static str, String)> {
        vec![(KIND_NAME_FIELD, spec.kind.name.clone())]
    }
}

/// Marker for topology relation records.
#[derive(Debug)]
pub struct Relation;

/// Desired state of a topology relation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationSpec {
    /// Remote URI, used as the remote identity in URI mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Kind of the relation.
    pub kind: ObjectRef,
    /// Source entity.
    pub source: ObjectRef,
    /// Target entity.
    pub target: ObjectRef,
    /// Aspects copied onto the remote relation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aspects: Aspects,
}

impl ResourceKind for Relation {
    const KIND: &'static str = "Relation";
    type Spec = RelationSpec;
    type Status = TopoStatus;

    fn indexed_fields(spec: &RelationSpec) -> Vec<(&'static str, String)> {
        vec![(KIND_NAME_FIELD, spec.kind.name.clone())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_indexes_its_kind_name() {
        let spec = EntitySpec {
            kind: ObjectRef::named("switch"),
            ..EntitySpec::default()
        };
        assert_eq!(
            Entity::indexed_fields(&spec),
            vec![(KIND_NAME_FIELD, "switch".to_string())]
        );
        assert!(Kind::indexed_fields(&KindSpec::default()).is_empty());
    }

    #[test]
    fn relation_spec_parses_from_json() {
        let spec: RelationSpec = serde_json::from_value(serde_json::json!({
            "kind": {"name": "link"},
            "source": {"name": "leaf-1"},
            "target": {"name": "spine-1", "uri": "spine:1"},
            "aspects": {"speed": "100G"}
        }))
        .unwrap();
        assert_eq!(spec.target.uri.as_deref(), Some("spine:1"));
        assert_eq!(spec.aspects["speed"], "100G");
        assert!(spec.uri.is_none());
    }
}
