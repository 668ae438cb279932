//! Scope and workload kinds: `Namespace`, `Service` and `Pod`.
//!
//! These records are inputs only. Controllers read them to decide whether a
//! scope is being torn down and to discover remote endpoints; the admission
//! mutator edits `Pod` specs before they are stored.

use serde::{Deserialize, Serialize};

use crate::id::RecordKey;
use crate::record::{Record, ResourceKind};

/// Marker for namespace records.
///
/// Namespace records live in their own scope: the record for namespace `net`
/// has key `net/net`.
#[derive(Debug)]
pub struct Namespace;

impl Namespace {
    /// Returns the key of the record describing namespace `name`.
    #[must_use]
    pub fn key(name: &str) -> RecordKey {
        RecordKey::new(name, name)
    }

    /// Returns an unsaved record describing namespace `name`.
    #[must_use]
    pub fn record(name: &str) -> Record<Self> {
        Record::new(name, name, NamespaceSpec {})
    }
}

/// Namespaces carry no desired state of their own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSpec {}

/// Namespaces carry no observed state of their own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceStatus {}

impl ResourceKind for Namespace {
    const KIND: &'static str = "Namespace";
    type Spec = NamespaceSpec;
    type Status = NamespaceStatus;
}

/// Marker for service records.
#[derive(Debug)]
pub struct Service;

/// How a service is exposed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    /// Virtual cluster address.
    #[default]
    ClusterIP,
    /// Exposed on every node.
    NodePort,
    /// Exposed through an external balancer.
    LoadBalancer,
}

/// A named service port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    /// Port name.
    #[serde(default)]
    pub name: String,
    /// Port number.
    pub port: u16,
}

/// Desired state of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Exposure type.
    #[serde(default, rename = "type")]
    pub service_type: ServiceType,
    /// Cluster address; `None` (the string) for headless services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
    /// Exposed ports.
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

impl ServiceSpec {
    /// Returns true for a cluster-addressable, non-headless service.
    #[must_use]
    pub fn is_cluster_addressable(&self) -> bool {
        self.service_type == ServiceType::ClusterIP
            && self
                .cluster_ip
                .as_deref()
                .is_some_and(|ip| !ip.is_empty() && ip != "None")
    }
}

/// Services carry no observed state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {}

impl ResourceKind for Service {
    const KIND: &'static str = "Service";
    type Spec = ServiceSpec;
    type Status = ServiceStatus;
}

/// Marker for pod records.
#[derive(Debug)]
pub struct Pod;

/// Source of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    /// Scratch space that lives as long as the pod.
    EmptyDir {},
    /// Files projected from a config map.
    ConfigMap {
        /// Config map name.
        name: String,
    },
    /// A persistent claim.
    PersistentVolumeClaim {
        /// Claim name.
        claim_name: String,
    },
    /// A directory on the node.
    HostPath {
        /// Path on the node.
        path: String,
    },
}

/// A named volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name, unique within the pod.
    pub name: String,
    /// Backing source.
    pub source: VolumeSource,
}

/// Mount of a volume into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// Volume name.
    pub name: String,
    /// Path inside the container.
    pub mount_path: String,
    /// Path within the volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

/// Environment variable of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

impl EnvVar {
    /// Creates an environment variable.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A container of a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Volume mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

/// Desired state of a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// Init containers, run to completion in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    /// Application containers.
    #[serde(default)]
    pub containers: Vec<Container>,
    /// Volumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

/// Observed state of a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    /// Pod address once scheduled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
    /// True once every container passes readiness.
    #[serde(default)]
    pub ready: bool,
}

impl ResourceKind for Pod {
    const KIND: &'static str = "Pod";
    type Spec = PodSpec;
    type Status = PodStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_services_are_not_addressable() {
        let mut spec = ServiceSpec {
            cluster_ip: Some("None".into()),
            ..ServiceSpec::default()
        };
        assert!(!spec.is_cluster_addressable());
        spec.cluster_ip = Some("10.0.0.12".into());
        assert!(spec.is_cluster_addressable());
        spec.service_type = ServiceType::NodePort;
        assert!(!spec.is_cluster_addressable());
    }

    #[test]
    fn volume_source_uses_tagged_form() {
        let volume: Volume = serde_json::from_value(serde_json::json!({
            "name": "registry",
            "source": {"persistentVolumeClaim": {"claim_name": "plugins"}}
        }))
        .unwrap();
        assert_eq!(
            volume.source,
            VolumeSource::PersistentVolumeClaim {
                claim_name: "plugins".into()
            }
        );
    }
}
