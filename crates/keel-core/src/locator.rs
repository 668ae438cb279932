//! Remote target discovery.
//!
//! A [`TargetLocator`] answers "which live endpoints implement this backend
//! role in this scope". Two shapes of role exist:
//!
//! - **Service**: one logical service per scope (the topology service). The
//!   first cluster-addressable service with matching labels wins.
//! - **Replica**: every workload replica with matching labels that advertises
//!   the required capability. Each replica is a separate fan-out target.
//!
//! [`StoreLocator`] resolves both from `Service` and `Pod` records.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::api::workload::{Pod, Service};
use crate::error::{Error, Result};
use crate::id::TargetId;
use crate::store::{ListOptions, ResourceStore};

/// Default DNS suffix of cluster services.
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Shape of a backend role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    /// One service per scope.
    Service,
    /// Every eligible replica in the scope.
    Replica,
}

/// Describes the backend role to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSelector {
    /// Shape of the role.
    pub kind: RoleKind,
    /// Labels the backing records must carry.
    pub labels: BTreeMap<String, String>,
    /// Port to dial. Services fall back to their first declared port.
    pub port: Option<u16>,
    /// Annotation that must be set to `true` for a replica to be eligible.
    pub capability: Option<String>,
}

impl RoleSelector {
    /// Selects the first service carrying `app=<app>`.
    #[must_use]
    pub fn service(app: impl Into<String>) -> Self {
        Self {
            kind: RoleKind::Service,
            labels: BTreeMap::from([("app".to_string(), app.into())]),
            port: None,
            capability: None,
        }
    }

    /// Selects every replica advertising `capability`, dialed on `port`.
    #[must_use]
    pub fn replicas(capability: impl Into<String>, port: u16) -> Self {
        Self {
            kind: RoleKind::Replica,
            labels: BTreeMap::new(),
            port: Some(port),
            capability: Some(capability.into()),
        }
    }
}

/// One resolved endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Stable identity of the backing record.
    pub target: TargetId,
    /// Dial address, `host:port`. Empty while unreachable.
    pub address: String,
    /// True when the endpoint can accept calls now.
    pub reachable: bool,
}

/// Resolves live endpoints for a backend role.
#[async_trait]
pub trait TargetLocator: Send + Sync {
    /// Returns endpoints for `role` in `scope`, ordered by target identity.
    async fn resolve(&self, scope: &str, role: &RoleSelector) -> Result<Vec<Endpoint>>;
}

/// Locator backed by `Service` and `Pod` records.
pub struct StoreLocator {
    services: Arc<dyn ResourceStore<Service>>,
    pods: Arc<dyn ResourceStore<Pod>>,
    cluster_domain: String,
}

impl std::fmt::Debug for StoreLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLocator")
            .field("cluster_domain", &self.cluster_domain)
            .finish_non_exhaustive()
    }
}

impl StoreLocator {
    /// Creates a locator over the given stores.
    #[must_use]
    pub fn new(
        services: Arc<dyn ResourceStore<Service>>,
        pods: Arc<dyn ResourceStore<Pod>>,
        cluster_domain: impl Into<String>,
    ) -> Self {
        Self {
            services,
            pods,
            cluster_domain: cluster_domain.into(),
        }
    }

    async fn resolve_service(&self, scope: &str, role: &RoleSelector) -> Result<Vec<Endpoint>> {
        let services = self
            .services
            .list(&ListOptions::in_namespace(scope).with_labels(&role.labels))
            .await?;
        let endpoint = services.iter().find_map(|svc| {
            if !svc.spec.is_cluster_addressable() {
                return None;
            }
            let port = role
                .port
                .or_else(|| svc.spec.ports.first().map(|p| p.port))?;
            Some(Endpoint {
                target: TargetId::from(&svc.key()),
                address: format!(
                    "{}.{}.svc.{}:{port}",
                    svc.meta.name, svc.meta.namespace, self.cluster_domain
                ),
                reachable: true,
            })
        });
        Ok(endpoint.into_iter().collect())
    }

    async fn resolve_replicas(&self, scope: &str, role: &RoleSelector) -> Result<Vec<Endpoint>> {
        let port = role
            .port
            .ok_or_else(|| Error::Invalid("replica roles require a port".into()))?;
        let pods = self
            .pods
            .list(&ListOptions::in_namespace(scope).with_labels(&role.labels))
            .await?;
        Ok(pods
            .iter()
            .filter(|pod| !pod.meta.is_deleting())
            .filter(|pod| {
                role.capability.as_deref().is_none_or(|cap| {
                    pod.meta
                        .annotation(cap)
                        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
                })
            })
            .map(|pod| {
                let ip = pod.status.pod_ip.as_deref().filter(|ip| !ip.is_empty());
                Endpoint {
                    target: TargetId::from(&pod.key()),
                    address: ip.map(|ip| format!("{ip}:{port}")).unwrap_or_default(),
                    reachable: pod.status.ready && ip.is_some(),
                }
            })
            .collect())
    }
}

#[async_trait]
impl TargetLocator for StoreLocator {
    async fn resolve(&self, scope: &str, role: &RoleSelector) -> Result<Vec<Endpoint>> {
        match role.kind {
            RoleKind::Service => self.resolve_service(scope, role).await,
            RoleKind::Replica => self.resolve_replicas(scope, role).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::workload::{PodSpec, PodStatus, ServicePort, ServiceSpec, ServiceType};
    use crate::record::Record;
    use crate::store::memory::InMemoryResourceStore;

    const CAPABILITY: &str = "registry.config.keel.dev/inject";

    fn service(name: &str, app: &str, cluster_ip: &str) -> Record<Service> {
        Record::new(
            "net",
            name,
            ServiceSpec {
                service_type: ServiceType::ClusterIP,
                cluster_ip: Some(cluster_ip.into()),
                ports: vec![ServicePort {
                    name: "grpc".into(),
                    port: 5150,
                }],
            },
        )
        .with_label("app", app)
    }

    fn pod(name: &str, ip: Option<&str>, ready: bool, capable: bool) -> Record<Pod> {
        let mut record = Record::<Pod>::new("net", name, PodSpec::default());
        record.status = PodStatus {
            pod_ip: ip.map(str::to_string),
            ready,
        };
        if capable {
            record = record.with_annotation(CAPABILITY, "true");
        }
        record
    }

    fn locator() -> (
        Arc<InMemoryResourceStore<Service>>,
        Arc<InMemoryResourceStore<Pod>>,
        StoreLocator,
    ) {
        let services = Arc::new(InMemoryResourceStore::new());
        let pods = Arc::new(InMemoryResourceStore::new());
        let locator = StoreLocator::new(services.clone(), pods.clone(), DEFAULT_CLUSTER_DOMAIN);
        (services, pods, locator)
    }

    #[tokio::test]
    async fn resolves_first_addressable_service() {
        let (services, _, locator) = locator();
        services.create(service("a-headless", "topo", "None")).await.unwrap();
        services.create(service("b-topo", "topo", "10.0.0.7")).await.unwrap();
        services.create(service("c-other", "config", "10.0.0.8")).await.unwrap();

        let endpoints = locator
            .resolve("net", &RoleSelector::service("topo"))
            .await
            .unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].address, "b-topo.net.svc.cluster.local:5150");
        assert!(endpoints[0].reachable);

        let none = locator
            .resolve("elsewhere", &RoleSelector::service("topo"))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn resolves_capable_replicas_with_reachability() {
        let (_, pods, locator) = locator();
        pods.create(pod("config-0", Some("10.1.0.4"), true, true)).await.unwrap();
        pods.create(pod("config-1", None, false, true)).await.unwrap();
        pods.create(pod("web-0", Some("10.1.0.9"), true, false)).await.unwrap();

        let endpoints = locator
            .resolve("net", &RoleSelector::replicas(CAPABILITY, 5151))
            .await
            .unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].target.as_str(), "net/config-0");
        assert_eq!(endpoints[0].address, "10.1.0.4:5151");
        assert!(endpoints[0].reachable);
        assert!(!endpoints[1].reachable);
        assert!(endpoints[1].address.is_empty());
    }
}
