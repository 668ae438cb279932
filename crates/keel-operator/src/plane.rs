//! Local control plane.
//!
//! Wires in-memory stores, in-memory topology and registry backends, the
//! admission injector and one controller per reconciled kind. Backends are
//! served at the addresses the locator resolves, so controllers dial them
//! exactly as they would dial remote services.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::watch;
use tokio::task::JoinSet;

use keel_admission::config::InjectorConfig;
use keel_admission::registry::{AdmissionRequest, RegistryInjector, Response};
use keel_core::api::config::{Model, ModelRegistry};
use keel_core::api::topo::{Entity, KIND_NAME_FIELD, Kind, Relation};
use keel_core::api::workload::{Namespace, Pod, Service};
use keel_core::locator::{StoreLocator, TargetLocator};
use keel_core::record::Record;
use keel_core::store::memory::InMemoryResourceStore;
use keel_core::store::{ListOptions, ResourceStore};
use keel_reconcile::artifact::{ArtifactCache, ArtifactKey, FsArtifactCache, InMemoryArtifactCache};
use keel_reconcile::config::Config;
use keel_reconcile::controller::{Controller, FieldMapper, ScopeMapper};
use keel_reconcile::engine::Engine;
use keel_reconcile::engine::model::ModelStrategy;
use keel_reconcile::engine::topo::{TopoMapping, TopoStrategy};
use keel_reconcile::remote::Connector;
use keel_reconcile::remote::memory::{InMemoryConnector, InMemoryRegistryServer, InMemoryTopoServer};

use crate::seed::Seed;

/// Where compiled plugins come from.
enum Artifacts {
    Memory(Arc<InMemoryArtifactCache>),
    Directory(Arc<FsArtifactCache>),
}

impl Artifacts {
    fn cache(&self) -> Arc<dyn ArtifactCache> {
        match self {
            Self::Memory(cache) => Arc::clone(cache) as Arc<dyn ArtifactCache>,
            Self::Directory(cache) => Arc::clone(cache) as Arc<dyn ArtifactCache>,
        }
    }
}

/// In-process control plane.
pub struct LocalPlane {
    config: Config,
    namespaces: Arc<InMemoryResourceStore<Namespace>>,
    services: Arc<InMemoryResourceStore<Service>>,
    pods: Arc<InMemoryResourceStore<Pod>>,
    registries: Arc<InMemoryResourceStore<ModelRegistry>>,
    models: Arc<InMemoryResourceStore<Model>>,
    kinds: Arc<InMemoryResourceStore<Kind>>,
    entities: Arc<InMemoryResourceStore<Entity>>,
    relations: Arc<InMemoryResourceStore<Relation>>,
    locator: Arc<StoreLocator>,
    connector: Arc<InMemoryConnector>,
    artifacts: Artifacts,
    injector: RegistryInjector,
    topo_servers: Vec<(String, Arc<InMemoryTopoServer>)>,
    registry_servers: Vec<(String, InMemoryRegistryServer)>,
}

impl LocalPlane {
    /// Creates an empty plane. Plugins are read from `artifact_dir` when set.
    pub fn new(config: Config, injector: InjectorConfig, artifact_dir: Option<PathBuf>) -> Self {
        let services = Arc::new(InMemoryResourceStore::new());
        let pods = Arc::new(InMemoryResourceStore::new());
        let registries = Arc::new(InMemoryResourceStore::new());
        let models = Arc::new(InMemoryResourceStore::new());
        let locator = Arc::new(StoreLocator::new(
            Arc::clone(&services) as Arc<dyn ResourceStore<Service>>,
            Arc::clone(&pods) as Arc<dyn ResourceStore<Pod>>,
            config.cluster_domain.clone(),
        ));
        let injector = RegistryInjector::new(
            Arc::clone(&registries) as Arc<dyn ResourceStore<ModelRegistry>>,
            Arc::clone(&models) as Arc<dyn ResourceStore<Model>>,
            injector,
        );
        let artifacts = match artifact_dir {
            Some(dir) => Artifacts::Directory(Arc::new(FsArtifactCache::new(dir))),
            None => Artifacts::Memory(Arc::new(InMemoryArtifactCache::new())),
        };
        Self {
            config,
            namespaces: Arc::new(InMemoryResourceStore::new()),
            services,
            pods,
            registries,
            models,
            kinds: Arc::new(InMemoryResourceStore::new()),
            entities: Arc::new(InMemoryResourceStore::new()),
            relations: Arc::new(InMemoryResourceStore::new()),
            locator,
            connector: Arc::new(InMemoryConnector::new()),
            artifacts,
            injector,
            topo_servers: Vec::new(),
            registry_servers: Vec::new(),
        }
    }

    /// Returns the admission injector.
    pub fn injector(&self) -> &RegistryInjector {
        &self.injector
    }

    /// Creates every seeded record and serves a backend for each topology
    /// service and reachable registry replica.
    ///
    /// Pods pass through admission before they are stored, so models must be
    /// seeded before the replicas that compile them.
    pub async fn load(&mut self, seed: Seed) -> Result<()> {
        let scopes = seed.scopes();
        for scope in &scopes {
            self.namespaces.create(Namespace::record(scope)).await?;
        }
        for service in seed.services {
            self.services.create(service).await?;
        }
        for registry in seed.registries {
            self.registries.create(registry).await?;
        }
        for model in seed.models {
            self.models.create(model).await?;
        }
        for pod in seed.pods {
            if let Some(pod) = self.admit(pod).await? {
                self.pods.create(pod).await?;
            }
        }
        for kind in seed.kinds {
            self.kinds.create(kind).await?;
        }
        for entity in seed.entities {
            self.entities.create(entity).await?;
        }
        for relation in seed.relations {
            self.relations.create(relation).await?;
        }

        match &self.artifacts {
            Artifacts::Memory(cache) => {
                for artifact in seed.artifacts {
                    cache.insert(
                        ArtifactKey::new(artifact.plugin_type.to_lowercase(), artifact.version),
                        artifact.content.into_bytes(),
                    );
                }
            }
            Artifacts::Directory(_) if !seed.artifacts.is_empty() => {
                tracing::warn!(
                    count = seed.artifacts.len(),
                    "ignoring seeded artifacts, serving plugins from the artifact directory"
                );
            }
            Artifacts::Directory(_) => {}
        }

        for scope in &scopes {
            self.serve_backends(scope).await?;
        }
        tracing::info!(
            namespaces = scopes.len(),
            topo_servers = self.topo_servers.len(),
            registry_servers = self.registry_servers.len(),
            "local control plane loaded"
        );
        Ok(())
    }

    /// Runs `pod` through admission. Returns `None` for a denied workload.
    async fn admit(&self, pod: Record<Pod>) -> Result<Option<Record<Pod>>> {
        let key = pod.key();
        match self.injector.handle(&AdmissionRequest::for_pod(&pod)?).await {
            Response::Allowed { .. } => Ok(Some(pod)),
            Response::Patched { pod } => Ok(Some(*pod)),
            Response::Denied { reason } => {
                tracing::warn!(pod = %key, %reason, "pod rejected at admission");
                Ok(None)
            }
            Response::Errored { code, message } => {
                bail!("admission of pod {key} failed ({code}): {message}")
            }
        }
    }

    async fn serve_backends(&mut self, scope: &str) -> Result<()> {
        for endpoint in self.locator.resolve(scope, &self.config.topo_role()).await? {
            let server = Arc::new(InMemoryTopoServer::new());
            self.connector
                .register_topo(endpoint.address.clone(), Arc::clone(&server));
            tracing::info!(address = %endpoint.address, "serving topology service");
            self.topo_servers.push((endpoint.address, server));
        }
        for endpoint in self
            .locator
            .resolve(scope, &self.config.registry_role())
            .await?
        {
            if endpoint.address.is_empty() {
                tracing::info!(target = %endpoint.target, "registry replica has no address yet");
                continue;
            }
            let server = InMemoryRegistryServer::new();
            self.connector
                .register_registry(endpoint.address.clone(), server.clone());
            tracing::info!(target = %endpoint.target, address = %endpoint.address, "serving model registry");
            self.registry_servers.push((endpoint.address, server));
        }
        Ok(())
    }

    fn topo_engine<K: TopoMapping>(&self, store: Arc<dyn ResourceStore<K>>) -> Engine<K, TopoStrategy<K>> {
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

    /// Spawns one controller per reconciled kind onto `set`.
    pub fn spawn_controllers(
        &self,
        set: &mut JoinSet<()>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<()> {
        let kinds = Arc::clone(&self.kinds) as Arc<dyn ResourceStore<Kind>>;
        let entities = Arc::clone(&self.entities) as Arc<dyn ResourceStore<Entity>>;
        let relations = Arc::clone(&self.relations) as Arc<dyn ResourceStore<Relation>>;
        let models = Arc::clone(&self.models) as Arc<dyn ResourceStore<Model>>;

        let kind_controller = Controller::new(self.topo_engine(Arc::clone(&kinds)), &self.config)
            .watches(self.services.watch(), Arc::new(ScopeMapper::new(kinds)));
        set.spawn(kind_controller.run(shutdown.clone()));

        let entity_controller =
            Controller::new(self.topo_engine(Arc::clone(&entities)), &self.config)
                .watches(
                    self.kinds.watch(),
                    Arc::new(FieldMapper::new(Arc::clone(&entities), KIND_NAME_FIELD)),
                )
                .watches(self.services.watch(), Arc::new(ScopeMapper::new(entities)));
        set.spawn(entity_controller.run(shutdown.clone()));

        let relation_controller =
            Controller::new(self.topo_engine(Arc::clone(&relations)), &self.config)
                .watches(
                    self.kinds.watch(),
                    Arc::new(FieldMapper::new(Arc::clone(&relations), KIND_NAME_FIELD)),
                )
                .watches(self.services.watch(), Arc::new(ScopeMapper::new(relations)));
        set.spawn(relation_controller.run(shutdown.clone()));

        let strategy = ModelStrategy::new(
            Arc::clone(&self.locator) as Arc<dyn TargetLocator>,
            Arc::clone(&self.connector) as Arc<dyn Connector>,
            self.artifacts.cache(),
            self.config.registry_role(),
            self.config.chunk_size,
            self.config.request_timeout,
        )
        .context("invalid model controller settings")?;
        let model_engine = Engine::new(
            Arc::clone(&models),
            Arc::clone(&self.namespaces) as Arc<dyn ResourceStore<Namespace>>,
            strategy,
            self.config.finalizer.clone(),
        );
        let model_controller = Controller::new(model_engine, &self.config)
            .watches(self.pods.watch(), Arc::new(ScopeMapper::new(models)));
        set.spawn(model_controller.run(shutdown.clone()));
        Ok(())
    }

    /// Logs what the backends hold.
    pub async fn report(&self) -> Result<()> {
        for (address, server) in &self.topo_servers {
            let ids = server.ids()?;
            tracing::info!(%address, objects = ?ids, "topology service state");
        }
        for (address, server) in &self.registry_servers {
            let filenames = server.filenames()?;
            tracing::info!(%address, artifacts = ?filenames, "model registry state");
        }
        for model in self.models.list(&ListOptions::all()).await? {
            let phases: Vec<String> = model
                .status
                .registry_statuses
                .iter()
                .map(|s| format!("{}={}", s.target, s.phase.as_label()))
                .collect();
            tracing::info!(model = %model.key(), ?phases, "model install state");
        }
        Ok(())
    }
}
