//! Seed files for the local control plane.
//!
//! A seed is one JSON document listing the records to create at startup:
//!
//! ```json
//! {
//!   "namespaces": ["network"],
//!   "services": [{ "meta": { "namespace": "network", "name": "topo", "labels": { "app": "topo" } },
//!                  "spec": { "clusterIp": "10.96.0.10", "ports": [{ "port": 5150 }] } }],
//!   "artifacts": [{ "type": "Devicesim", "version": "1.0.0", "content": "..." }]
//! }
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use keel_core::api::config::{Model, ModelRegistry};
use keel_core::api::topo::{Entity, Kind, Relation};
use keel_core::api::workload::{Pod, Service};
use keel_core::record::Record;

/// A compiled plugin served from memory.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedArtifact {
    /// Plugin type.
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Plugin version.
    pub version: String,
    /// Artifact bytes, as text.
    #[serde(default)]
    pub content: String,
}

/// Records loaded into the local control plane.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Seed {
    pub namespaces: Vec<String>,
    pub services: Vec<Record<Service>>,
    pub pods: Vec<Record<Pod>>,
    pub registries: Vec<Record<ModelRegistry>>,
    pub models: Vec<Record<Model>>,
    pub kinds: Vec<Record<Kind>>,
    pub entities: Vec<Record<Entity>>,
    pub relations: Vec<Record<Relation>>,
    pub artifacts: Vec<SeedArtifact>,
}

impl Seed {
    /// Reads a seed from a JSON file.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read seed {}", path.display()))?;
        Self::from_slice(&raw).with_context(|| format!("invalid seed {}", path.display()))
    }

    /// Parses a seed document.
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Every namespace the seed names or places a record in.
    pub fn scopes(&self) -> BTreeSet<String> {
        let mut scopes: BTreeSet<String> = self.namespaces.iter().cloned().collect();
        scopes.extend(self.services.iter().map(|r| r.meta.namespace.clone()));
        scopes.extend(self.pods.iter().map(|r| r.meta.namespace.clone()));
        scopes.extend(self.registries.iter().map(|r| r.meta.namespace.clone()));
        scopes.extend(self.models.iter().map(|r| r.meta.namespace.clone()));
        scopes.extend(self.kinds.iter().map(|r| r.meta.namespace.clone()));
        scopes.extend(self.entities.iter().map(|r| r.meta.namespace.clone()));
        scopes.extend(self.relations.iter().map(|r| r.meta.namespace.clone()));
        scopes.retain(|s| !s.is_empty());
        scopes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETWORK: &str = include_str!("../seeds/network.json");

    #[test]
    fn bundled_seed_parses() {
        let seed = Seed::from_slice(NETWORK.as_bytes()).unwrap();
        assert_eq!(seed.scopes(), BTreeSet::from(["network".to_string()]));
        assert_eq!(seed.kinds.len(), 1);
        assert_eq!(seed.entities.len(), 2);
        assert_eq!(seed.relations[0].spec.source.name, "leaf-1");
        assert!(seed.models[0].spec.plugin.is_some());
        assert_eq!(seed.artifacts[0].plugin_type, "Devicesim");
    }

    #[test]
    fn unknown_sections_are_rejected() {
        assert!(Seed::from_slice(br#"{ "deployments": [] }"#).is_err());
    }

    #[test]
    fn scopes_include_record_namespaces() {
        let seed = Seed::from_slice(
            br#"{ "namespaces": ["a"],
                  "kinds": [{ "meta": { "namespace": "b", "name": "switch" }, "spec": {} }] }"#,
        )
        .unwrap();
        assert_eq!(
            seed.scopes(),
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
    }
}
