//! Registry injection against in-memory model and registry stores.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use keel_admission::config::InjectorConfig;
use keel_admission::registry::{
    AdmissionRequest, ENV_MODEL_REGISTRY, ENV_MODULE_TARGET, INJECT_STATUS_INJECTED,
    PLUGIN_API_VERSION_ANNOTATION, PLUGIN_GO_MOD_TARGET_ANNOTATION, REGISTRY_CONTAINER,
    REGISTRY_INJECT_ANNOTATION, REGISTRY_INJECT_STATUS_ANNOTATION, REGISTRY_NAME_ANNOTATION,
    REGISTRY_PATH_ANNOTATION, RegistryInjector, Response,
};
use keel_core::api::config::{Model, ModelRegistry};
use keel_core::api::topo::ObjectRef;
use keel_core::api::workload::{Pod, VolumeSource};
use keel_core::record::Record;
use keel_core::store::{ListOptions, ResourceStore};
use keel_core::store::memory::InMemoryResourceStore;
use keel_test_utils::{TEST_NAMESPACE, app_pod, model, model_registry};

struct Fixture {
    registries: Arc<InMemoryResourceStore<ModelRegistry>>,
    models: Arc<InMemoryResourceStore<Model>>,
    injector: RegistryInjector,
}

impl Fixture {
    async fn new() -> Self {
        let registries = Arc::new(InMemoryResourceStore::new());
        let models = Arc::new(InMemoryResourceStore::new());
        registries
            .create(model_registry(TEST_NAMESPACE, "registry"))
            .await
            .unwrap();
        let injector = RegistryInjector::new(
            Arc::clone(&registries) as Arc<dyn ResourceStore<ModelRegistry>>,
            Arc::clone(&models) as Arc<dyn ResourceStore<Model>>,
            InjectorConfig::default(),
        );
        Self {
            registries,
            models,
            injector,
        }
    }

    async fn admit(&self, pod: &Record<Pod>) -> Response {
        self.injector
            .handle(&AdmissionRequest::for_pod(pod).unwrap())
            .await
    }

    async fn patch(&self, pod: &Record<Pod>) -> Record<Pod> {
        match self.admit(pod).await {
            Response::Patched { pod } => *pod,
            other => panic!("expected a patched pod, got {other:?}"),
        }
    }
}

fn replica_pod() -> Record<Pod> {
    app_pod(TEST_NAMESPACE, "registry-0")
        .with_annotation(REGISTRY_INJECT_ANNOTATION, "true")
        .with_annotation(REGISTRY_NAME_ANNOTATION, "registry")
        .with_annotation(PLUGIN_API_VERSION_ANNOTATION, "v1.0.0")
}

#[tokio::test]
async fn pods_without_inject_annotation_are_allowed_unchanged() {
    let f = Fixture::new().await;
    let response = f.admit(&app_pod(TEST_NAMESPACE, "web-0")).await;
    assert!(matches!(response, Response::Allowed { .. }), "{response:?}");
}

#[tokio::test]
async fn injects_registry_volume_env_and_sidecar() {
    let f = Fixture::new().await;
    let pod = f
        .patch(
            &replica_pod()
                .with_annotation(REGISTRY_PATH_ANNOTATION, "/var/keel/plugins")
                .with_annotation(PLUGIN_GO_MOD_TARGET_ANNOTATION, "github.com/keel-dev/config@v1.2.0"),
        )
        .await;

    assert_eq!(
        pod.meta.annotation(REGISTRY_INJECT_STATUS_ANNOTATION),
        Some(INJECT_STATUS_INJECTED)
    );
    assert_eq!(pod.spec.volumes.len(), 1);
    assert_eq!(pod.spec.volumes[0].name, "model-registry");
    assert!(matches!(
        pod.spec.volumes[0].source,
        VolumeSource::PersistentVolumeClaim { .. }
    ));

    let app = &pod.spec.containers[0];
    assert_eq!(app.volume_mounts[0].mount_path, "/var/keel/plugins");
    let env = |name: &str| {
        app.env
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    };
    assert_eq!(env(ENV_MODEL_REGISTRY), Some("/var/keel/plugins"));
    assert_eq!(env(ENV_MODULE_TARGET), Some("github.com/keel-dev/config@v1.2.0"));

    let sidecar = pod.spec.containers.last().unwrap();
    assert_eq!(sidecar.name, REGISTRY_CONTAINER);
    assert_eq!(sidecar.image, "keel/config-model-registry:v1.0.0");
    assert!(sidecar.args.windows(2).any(|w| w == ["--target", "github.com/keel-dev/config@v1.2.0"]));
    assert!(pod.spec.init_containers.is_empty(), "no models, no compilers");
}

#[tokio::test]
async fn adds_one_compiler_per_model_with_plugin() {
    let f = Fixture::new().await;
    f.models
        .create(model(TEST_NAMESPACE, "devicesim", "Devicesim", "1.0.0"))
        .await
        .unwrap();
    f.models
        .create(model(TEST_NAMESPACE, "testdevice", "Testdevice", "2.0.1"))
        .await
        .unwrap();
    let mut schema_only = model(TEST_NAMESPACE, "schema", "Schema", "1.0.0");
    schema_only.spec.plugin = None;
    f.models.create(schema_only).await.unwrap();

    let pod = f.patch(&replica_pod()).await;
    let names: Vec<_> = pod.spec.init_containers.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["devicesim-1-0-0-compiler", "testdevice-2-0-1-compiler"]);

    let compiler = &pod.spec.init_containers[0];
    assert_eq!(compiler.image, "keel/config-model-compiler:v1.0.0");
    assert!(compiler.args.windows(2).any(|w| w
        == [
            "--module",
            "devicesim-model@2024-01-01=/etc/keel/models/devicesim/devicesim-model-2024-01-01.yang"
        ]));
    assert!(pod.spec.volumes.iter().any(|v| v.name == "model-devicesim"
        && v.source
            == VolumeSource::ConfigMap {
                name: "devicesim".into()
            }));
}

#[tokio::test]
async fn compiler_resolves_modules_through_dependencies() {
    let f = Fixture::new().await;
    let mut base = model(TEST_NAMESPACE, "base", "Base", "1.0.0");
    base.spec.plugin = None;
    base.spec.dependencies = vec![ObjectRef::named("types")];
    f.models.create(base).await.unwrap();
    let mut types = model(TEST_NAMESPACE, "types", "Types", "1.0.0");
    types.spec.plugin = None;
    // A cycle back to the root must not loop.
    types.spec.dependencies = vec![ObjectRef::named("devicesim")];
    f.models.create(types).await.unwrap();
    let mut devicesim = model(TEST_NAMESPACE, "devicesim", "Devicesim", "1.0.0");
    devicesim.spec.dependencies = vec![ObjectRef::named("base")];
    f.models.create(devicesim).await.unwrap();

    let pod = f.patch(&replica_pod()).await;
    assert_eq!(pod.spec.init_containers.len(), 1);
    let compiler = &pod.spec.init_containers[0];
    let modules: Vec<_> = compiler
        .args
        .windows(2)
        .filter(|w| w[0] == "--module")
        .map(|w| w[1].split('=').next().unwrap().to_string())
        .collect();
    assert_eq!(
        modules,
        [
            "base-model@2024-01-01",
            "devicesim-model@2024-01-01",
            "types-model@2024-01-01"
        ]
    );
    let mounts: Vec<_> = compiler
        .volume_mounts
        .iter()
        .map(|m| m.name.as_str())
        .collect();
    assert_eq!(
        mounts,
        ["model-devicesim", "model-base", "model-types", "model-registry"]
    );
}

#[tokio::test]
async fn missing_dependency_denies_the_workload() {
    let f = Fixture::new().await;
    let mut devicesim = model(TEST_NAMESPACE, "devicesim", "Devicesim", "1.0.0");
    devicesim.spec.dependencies = vec![ObjectRef::named("absent")];
    f.models.create(devicesim).await.unwrap();

    match f.admit(&replica_pod()).await {
        Response::Denied { reason } => assert!(reason.contains("absent"), "{reason}"),
        other => panic!("expected denial, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_registry_or_annotation_denies_the_workload() {
    let f = Fixture::new().await;
    let unknown = replica_pod().with_annotation(REGISTRY_NAME_ANNOTATION, "other");
    assert!(matches!(f.admit(&unknown).await, Response::Denied { .. }));

    let mut unversioned = replica_pod();
    unversioned.meta.annotations.remove(PLUGIN_API_VERSION_ANNOTATION);
    match f.admit(&unversioned).await {
        Response::Denied { reason } => assert!(reason.contains(PLUGIN_API_VERSION_ANNOTATION)),
        other => panic!("expected denial, got {other:?}"),
    }
    assert_eq!(f.registries.list(&ListOptions::all()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn already_injected_pods_pass_through() {
    let f = Fixture::new().await;
    f.models
        .create(model(TEST_NAMESPACE, "devicesim", "Devicesim", "1.0.0"))
        .await
        .unwrap();
    let injected = f.patch(&replica_pod()).await;

    let response = f.admit(&injected).await;
    assert!(matches!(response, Response::Allowed { .. }), "{response:?}");

    // Re-running on a pod stripped of its status annotation adds nothing twice.
    let mut stripped = injected.clone();
    stripped
        .meta
        .annotations
        .remove(REGISTRY_INJECT_STATUS_ANNOTATION);
    let again = f.patch(&stripped).await;
    assert_eq!(again.spec, injected.spec);
}

#[tokio::test]
async fn undecodable_objects_are_errored() {
    let f = Fixture::new().await;
    let request = AdmissionRequest {
        namespace: TEST_NAMESPACE.to_string(),
        object: serde_json::json!({ "kind": "Pod", "spec": 7 }),
    };
    match f.injector.handle(&request).await {
        Response::Errored { code, .. } => assert_eq!(code, 400),
        other => panic!("expected an error, got {other:?}"),
    }
}
