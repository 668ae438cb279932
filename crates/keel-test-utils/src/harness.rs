//! In-memory control plane for driving engines end to end.
//!
//! A [`Harness`] owns one store per record kind, an in-memory topology server,
//! any number of in-memory registry replicas and an artifact cache, wired
//! through a [`StoreLocator`] and an [`InMemoryConnector`] exactly as the
//! operator binary wires the real ones.

use std::sync::Arc;

use bytes::Bytes;

use keel_core::api::config::Model;
use keel_core::api::topo::{Entity, Kind, Relation};
use keel_core::api::workload::{Namespace, Pod, Service};
use keel_core::id::RecordKey;
use keel_core::locator::{StoreLocator, TargetLocator};
use keel_core::record::{HasConditions, Record, ResourceKind};
use keel_core::store::ResourceStore;
use keel_core::store::memory::InMemoryResourceStore;
use keel_reconcile::artifact::{ArtifactCache, ArtifactKey, InMemoryArtifactCache};
use keel_reconcile::config::Config;
use keel_reconcile::engine::model::ModelStrategy;
use keel_reconcile::engine::topo::{TopoMapping, TopoStrategy};
use keel_reconcile::engine::{Engine, Outcome, Strategy};
use keel_reconcile::remote::Connector;
use keel_reconcile::remote::memory::{
    InMemoryConnector, InMemoryRegistryServer, InMemoryTopoServer,
};

use crate::fixtures::{REGISTRY_CAPABILITY, TEST_NAMESPACE, registry_pod, service};

/// Upper bound on invocations [`drive`] performs before failing.
pub const MAX_INVOCATIONS: usize = 64;

/// Engine for topology record kind `K`.
pub type TopoEngine<K> = Engine<K, TopoStrategy<K>>;

/// Engine for models.
pub type ModelEngine = Engine<Model, ModelStrategy>;

/// Pre-wired in-memory control plane.
pub struct Harness {
    /// Engine and controller settings.
    pub config: Config,
    /// Namespace records.
    pub namespaces: Arc<InMemoryResourceStore<Namespace>>,
    /// Kind records.
    pub kinds: Arc<InMemoryResourceStore<Kind>>,
    /// Entity records.
    pub entities: Arc<InMemoryResourceStore<Entity>>,
    /// Relation records.
    pub relations: Arc<InMemoryResourceStore<Relation>>,
    /// Model records.
    pub models: Arc<InMemoryResourceStore<Model>>,
    /// Service records.
    pub services: Arc<InMemoryResourceStore<Service>>,
    /// Pod records.
    pub pods: Arc<InMemoryResourceStore<Pod>>,
    /// Topology server served at the topology service address.
    pub topo: Arc<InMemoryTopoServer>,
    /// Address-to-server routing.
    pub connector: Arc<InMemoryConnector>,
    /// Compiled plugin artifacts.
    pub artifacts: Arc<InMemoryArtifactCache>,
    /// Resolves services and replicas from the stores.
    pub locator: Arc<StoreLocator>,
}

impl Harness {
    /// Creates an empty harness with a small backoff and the test capability.
    pub fn new() -> Self {
        let config = Config {
            registry_capability: REGISTRY_CAPABILITY.to_string(),
            backoff_base: std::time::Duration::from_millis(5),
            backoff_max: std::time::Duration::from_millis(50),
            ..Config::default()
        };
        Self::with_config(config)
    }

    /// Creates an empty harness with explicit settings.
    pub fn with_config(config: Config) -> Self {
        let services = Arc::new(InMemoryResourceStore::new());
        let pods = Arc::new(InMemoryResourceStore::new());
        let locator = Arc::new(StoreLocator::new(
            Arc::clone(&services) as Arc<dyn ResourceStore<Service>>,
            Arc::clone(&pods) as Arc<dyn ResourceStore<Pod>>,
            config.cluster_domain.clone(),
        ));
        Self {
            config,
            namespaces: Arc::new(InMemoryResourceStore::new()),
            kinds: Arc::new(InMemoryResourceStore::new()),
            entities: Arc::new(InMemoryResourceStore::new()),
            relations: Arc::new(InMemoryResourceStore::new()),
            models: Arc::new(InMemoryResourceStore::new()),
            services,
            pods,
            topo: Arc::new(InMemoryTopoServer::new()),
            connector: Arc::new(InMemoryConnector::new()),
            artifacts: Arc::new(InMemoryArtifactCache::new()),
            locator,
        }
    }

    /// Creates a harness with [`TEST_NAMESPACE`] and a topology service in it.
    pub async fn with_topology() -> Self {
        let harness = Self::new();
        harness.add_namespace(TEST_NAMESPACE).await;
        harness.add_topo_service(TEST_NAMESPACE).await;
        harness
    }

    /// Creates a namespace record.
    pub async fn add_namespace(&self, name: &str) {
        self.namespaces
            .create(Namespace::record(name))
            .await
            .expect("create namespace");
    }

    /// Creates the topology service in `namespace` and serves [`Harness::topo`]
    /// at its address.
    pub async fn add_topo_service(&self, namespace: &str) {
        let svc = self
            .services
            .create(service(
                namespace,
                &self.config.topo_service,
                &self.config.topo_service,
                "10.96.0.10",
            ))
            .await
            .expect("create topology service");
        let port = svc.spec.ports.first().map_or(0, |p| p.port);
        let address = format!(
            "{}.{}.svc.{}:{port}",
            svc.meta.name, svc.meta.namespace, self.config.cluster_domain
        );
        self.connector.register_topo(address, Arc::clone(&self.topo));
    }

    /// Creates a registry replica pod and serves a fresh registry at its
    /// address.
    ///
    /// A replica created without an `ip` is eligible but unreachable.
    pub async fn add_replica(
        &self,
        namespace: &str,
        name: &str,
        ip: Option<&str>,
    ) -> InMemoryRegistryServer {
        let ready = ip.is_some();
        self.pods
            .create(registry_pod(namespace, name, ip, ready))
            .await
            .expect("create replica pod");
        let server = InMemoryRegistryServer::new();
        if let Some(ip) = ip {
            self.connector
                .register_registry(self.replica_address(ip), server.clone());
        }
        server
    }

    /// Gives a replica an address, marks it ready and serves `server` there.
    pub async fn make_reachable(
        &self,
        namespace: &str,
        name: &str,
        ip: &str,
        server: &InMemoryRegistryServer,
    ) {
        let mut pod = self
            .pods
            .get(&RecordKey::new(namespace, name))
            .await
            .expect("get pod")
            .expect("pod exists");
        pod.status.pod_ip = Some(ip.to_string());
        pod.status.ready = true;
        self.pods.update_status(&pod).await.expect("update pod status");
        self.connector
            .register_registry(self.replica_address(ip), server.clone());
    }

    /// Returns the address replicas with `ip` are dialed on.
    pub fn replica_address(&self, ip: &str) -> String {
        format!("{ip}:{}", self.config.registry_port)
    }

    /// Puts the compiled plugin for `plugin_type`/`version` into the cache.
    pub fn add_artifact(&self, plugin_type: &str, version: &str, content: impl Into<Bytes>) {
        self.artifacts.insert(
            ArtifactKey::new(plugin_type.to_lowercase(), version),
            content,
        );
    }

    /// Marks a namespace as terminating.
    pub async fn terminate_namespace(&self, name: &str) {
        let key = Namespace::key(name);
        let mut ns = self
            .namespaces
            .get(&key)
            .await
            .expect("get namespace")
            .expect("namespace exists");
        ns.meta.add_finalizer("kubernetes");
        self.namespaces.update(&ns).await.expect("hold namespace");
        self.namespaces.delete(&key).await.expect("delete namespace");
    }

    fn topo_engine<K: TopoMapping>(&self, store: Arc<dyn ResourceStore<K>>) -> TopoEngine<K> {
        let strategy = TopoStrategy::new(
            Arc::clone(&self.kinds) as Arc<dyn ResourceStore<Kind>>,
            Arc::clone(&self.locator) as Arc<dyn TargetLocator>,
            Arc::clone(&self.connector) as Arc<dyn Connector>,
            self.config.topo_role(),
            self.config.identity_field,
            self.config.request_timeout,
        );
        Engine::new(
            store,
            Arc::clone(&self.namespaces) as Arc<dyn ResourceStore<Namespace>>,
            strategy,
            self.config.finalizer.clone(),
        )
    }

    /// Engine for kinds.
    pub fn kind_engine(&self) -> TopoEngine<Kind> {
        self.topo_engine(Arc::clone(&self.kinds) as Arc<dyn ResourceStore<Kind>>)
    }

    /// Engine for entities.
    pub fn entity_engine(&self) -> TopoEngine<Entity> {
        self.topo_engine(Arc::clone(&self.entities) as Arc<dyn ResourceStore<Entity>>)
    }

    /// Engine for relations.
    pub fn relation_engine(&self) -> TopoEngine<Relation> {
        self.topo_engine(Arc::clone(&self.relations) as Arc<dyn ResourceStore<Relation>>)
    }

    /// Engine for models.
    pub fn model_engine(&self) -> ModelEngine {
        let strategy = ModelStrategy::new(
            Arc::clone(&self.locator) as Arc<dyn TargetLocator>,
            Arc::clone(&self.connector) as Arc<dyn Connector>,
            Arc::clone(&self.artifacts) as Arc<dyn ArtifactCache>,
            self.config.registry_role(),
            self.config.chunk_size,
            self.config.request_timeout,
        )
        .expect("valid chunk size");
        Engine::new(
            Arc::clone(&self.models) as Arc<dyn ResourceStore<Model>>,
            Arc::clone(&self.namespaces) as Arc<dyn ResourceStore<Namespace>>,
            strategy,
            self.config.finalizer.clone(),
        )
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconciles `key` until an invocation reports no further work.
///
/// Returns every outcome. Panics on an error or after [`MAX_INVOCATIONS`].
pub async fn drive<K, S>(engine: &Engine<K, S>, key: &RecordKey) -> Vec<Outcome>
where
    K: ResourceKind,
    K::Status: HasConditions,
    S: Strategy<K>,
{
    let mut outcomes = Vec::new();
    loop {
        let outcome = engine.reconcile(key).await.expect("reconcile");
        outcomes.push(outcome);
        if !outcome.requeue {
            return outcomes;
        }
        assert!(
            outcomes.len() < MAX_INVOCATIONS,
            "{key} did not settle within {MAX_INVOCATIONS} invocations"
        );
    }
}

/// Reads a record that must exist.
pub async fn fetch<K: ResourceKind>(store: &InMemoryResourceStore<K>, key: &RecordKey) -> Record<K> {
    store
        .get(key)
        .await
        .expect("get record")
        .unwrap_or_else(|| panic!("{} {key} does not exist", K::KIND))
}

/// Polls `check` every 10ms until it returns true, failing after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
