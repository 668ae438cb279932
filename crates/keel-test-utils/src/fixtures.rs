//! Record factories with sensible defaults.

use keel_core::api::config::{Model, ModelRegistry, ModelRegistrySpec, ModelSpec, ModuleSpec, PluginSpec};
use keel_core::api::topo::{
    Entity, EntitySpec, Kind, KindSpec, ObjectRef, Relation, RelationSpec,
};
use keel_core::api::workload::{
    Container, Pod, PodSpec, PodStatus, Service, ServicePort, ServiceSpec, ServiceType, Volume,
    VolumeSource,
};
use keel_core::record::Record;

/// Namespace most tests run in.
pub const TEST_NAMESPACE: &str = "network";

/// Capability annotation the harness marks registry replicas with.
pub const REGISTRY_CAPABILITY: &str = "registry.config.keel.dev/inject";

/// Port the harness topology service listens on.
pub const TOPO_PORT: u16 = 5150;

/// Creates a kind with one aspect.
pub fn kind(namespace: &str, name: &str) -> Record<Kind> {
    let mut spec = KindSpec::default();
    spec.aspects.insert(
        "keel.topo.Configurable".to_string(),
        serde_json::json!({ "type": name }),
    );
    Record::new(namespace, name, spec)
}

/// Creates an entity of `kind`.
pub fn entity(namespace: &str, name: &str, kind: &str) -> Record<Entity> {
    Record::new(
        namespace,
        name,
        EntitySpec {
            uri: None,
            kind: ObjectRef::named(kind),
            aspects: Default::default(),
        },
    )
}

/// Creates a relation of `kind` between two entities.
pub fn relation(
    namespace: &str,
    name: &str,
    kind: &str,
    source: &str,
    target: &str,
) -> Record<Relation> {
    Record::new(
        namespace,
        name,
        RelationSpec {
            uri: None,
            kind: ObjectRef::named(kind),
            source: ObjectRef::named(source),
            target: ObjectRef::named(target),
            aspects: Default::default(),
        },
    )
}

/// Creates a model with one module and the given plugin coordinates.
pub fn model(namespace: &str, name: &str, plugin_type: &str, version: &str) -> Record<Model> {
    Record::new(
        namespace,
        name,
        ModelSpec {
            plugin: Some(PluginSpec {
                type_: plugin_type.to_string(),
                version: version.to_string(),
            }),
            modules: vec![ModuleSpec {
                name: format!("{name}-model"),
                organization: "keel".to_string(),
                revision: "2024-01-01".to_string(),
                data: format!("module {name}-model {{}}"),
            }],
            dependencies: Vec::new(),
        },
    )
}

/// Creates a cluster-addressable service labelled `app=<app>`.
pub fn service(namespace: &str, name: &str, app: &str, cluster_ip: &str) -> Record<Service> {
    Record::new(
        namespace,
        name,
        ServiceSpec {
            service_type: ServiceType::ClusterIP,
            cluster_ip: Some(cluster_ip.to_string()),
            ports: vec![ServicePort {
                name: "grpc".to_string(),
                port: TOPO_PORT,
            }],
        },
    )
    .with_label("app", app)
}

/// Creates a pod advertising the registry capability.
pub fn registry_pod(namespace: &str, name: &str, ip: Option<&str>, ready: bool) -> Record<Pod> {
    let mut pod = app_pod(namespace, name).with_annotation(REGISTRY_CAPABILITY, "true");
    pod.status = PodStatus {
        pod_ip: ip.map(str::to_string),
        ready,
    };
    pod
}

/// Creates a model registry whose plugins live on a persistent claim.
pub fn model_registry(namespace: &str, name: &str) -> Record<ModelRegistry> {
    Record::new(
        namespace,
        name,
        ModelRegistrySpec {
            volume: Volume {
                name: "model-registry".to_string(),
                source: VolumeSource::PersistentVolumeClaim {
                    claim_name: format!("{name}-plugins"),
                },
            },
        },
    )
}

/// Creates an unscheduled pod with one application container.
pub fn app_pod(namespace: &str, name: &str) -> Record<Pod> {
    Record::new(
        namespace,
        name,
        PodSpec {
            containers: vec![Container {
                name: "config".to_string(),
                image: "keel/config:latest".to_string(),
                ..Container::default()
            }],
            ..PodSpec::default()
        },
    )
}
