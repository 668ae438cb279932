//! Configuration model kinds: `Model` and `ModelRegistry`.
//!
//! A model describes a pluggable configuration schema. Its compiled plugin
//! artifact is pushed to every eligible registry replica in the model's
//! namespace; the per-replica progress lives in [`ModelStatus`].

use serde::{Deserialize, Serialize};

use super::topo::ObjectRef;
use super::workload::Volume;
use crate::id::TargetId;
use crate::record::{Condition, HasConditions, ResourceKind};

/// Marker for configuration model records.
#[derive(Debug)]
pub struct Model;

/// Plugin coordinates of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSpec {
    /// Plugin type, e.g. `Devicesim`.
    #[serde(rename = "type")]
    pub type_: String,
    /// Plugin version, e.g. `1.0.0`.
    pub version: String,
}

/// One schema module of a model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    /// Module name.
    pub name: String,
    /// Publishing organization.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organization: String,
    /// Module revision.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    /// Schema source text.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
}

impl ModuleSpec {
    /// Returns the file name the module source is mounted under.
    #[must_use]
    pub fn file_name(&self) -> String {
        if self.revision.is_empty() {
            format!("{}.yang", self.name)
        } else {
            format!("{}-{}.yang", self.name, self.revision)
        }
    }
}

/// Desired state of a configuration model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    /// Plugin coordinates. Required for the model to be installable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginSpec>,
    /// Schema modules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<ModuleSpec>,
    /// Other models whose modules this model imports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<ObjectRef>,
}

/// Install progress of a model on one registry replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstallPhase {
    /// The replica is eligible but not yet reachable.
    Pending,
    /// The replica is reachable and awaiting the push.
    Installing,
    /// The artifact has been committed on the replica.
    Installed,
}

impl InstallPhase {
    /// Returns the metric label for this phase.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Installing => "installing",
            Self::Installed => "installed",
        }
    }
}

/// Per-replica status entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    /// Replica the entry tracks.
    pub target: TargetId,
    /// Install progress.
    pub phase: InstallPhase,
    /// Filename of the artifact last committed on the replica.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

/// Observed state of a configuration model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    /// One entry per eligible replica, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub registry_statuses: Vec<RegistryStatus>,
    /// Non-transient facts about the model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HasConditions for ModelStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

impl ResourceKind for Model {
    const KIND: &'static str = "Model";
    type Spec = ModelSpec;
    type Status = ModelStatus;
}

/// Marker for model registry records.
#[derive(Debug)]
pub struct ModelRegistry;

/// Desired state of a model registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRegistrySpec {
    /// Volume that holds installed plugins.
    pub volume: Volume,
}

/// Model registries carry no observed state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRegistryStatus {}

impl ResourceKind for ModelRegistry {
    const KIND: &'static str = "ModelRegistry";
    type Spec = ModelRegistrySpec;
    type Status = ModelRegistryStatus;
}
