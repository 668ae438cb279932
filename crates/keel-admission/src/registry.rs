//! Registry and plugin compiler injection.
//!
//! A pod annotated with `registry.config.keel.dev/inject: "true"` becomes a
//! model registry replica. Before it is stored the injector:
//!
//! 1. adds the volume of the named [`ModelRegistry`] to the pod,
//! 2. mounts it into every application container and exports the registry
//!    path and module coordinates through `CONFIG_*` variables,
//! 3. adds one compiler init container per [`Model`] with a plugin in the
//!    pod's namespace, with module files resolved through the model's
//!    dependencies,
//! 4. adds the `model-registry` sidecar,
//! 5. marks the pod `inject-status: injected`.
//!
//! Pods already marked injected pass through unchanged.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use keel_core::api::config::{Model, ModelRegistry, PluginSpec};
use keel_core::api::workload::{Container, EnvVar, Pod, Volume, VolumeMount, VolumeSource};
use keel_core::id::RecordKey;
use keel_core::record::{Record, ResourceKind};
use keel_core::store::{ListOptions, ResourceStore};

use crate::config::InjectorConfig;
use crate::error::{Error, Result};
use crate::metrics::record_admission;

/// Enables registry injection when set to `"true"`.
pub const REGISTRY_INJECT_ANNOTATION: &str = "registry.config.keel.dev/inject";
/// Name of the [`ModelRegistry`] to inject.
pub const REGISTRY_NAME_ANNOTATION: &str = "registry.config.keel.dev/name";
/// Namespace of the [`ModelRegistry`]; defaults to the pod's.
pub const REGISTRY_NAMESPACE_ANNOTATION: &str = "registry.config.keel.dev/namespace";
/// Mount path of the registry volume; defaults to [`DEFAULT_REGISTRY_PATH`].
pub const REGISTRY_PATH_ANNOTATION: &str = "registry.config.keel.dev/path";
/// Set by the injector once the pod has been mutated.
pub const REGISTRY_INJECT_STATUS_ANNOTATION: &str = "registry.config.keel.dev/inject-status";
/// Value of [`REGISTRY_INJECT_STATUS_ANNOTATION`] after injection.
pub const INJECT_STATUS_INJECTED: &str = "injected";

/// Plugin API version; selects the compiler and registry image tags.
pub const PLUGIN_API_VERSION_ANNOTATION: &str = "plugin.config.keel.dev/api-version";
/// Build toolchain version appended to image tags.
pub const PLUGIN_GOLANG_BUILD_VERSION_ANNOTATION: &str =
    "plugin.config.keel.dev/golang-build-version";
/// Module the plugins are compiled against.
pub const PLUGIN_GO_MOD_TARGET_ANNOTATION: &str = "plugin.config.keel.dev/go-mod-target";
/// Replacement for the target module.
pub const PLUGIN_GO_MOD_REPLACE_ANNOTATION: &str = "plugin.config.keel.dev/go-mod-replace";

/// Default mount path of the registry volume.
pub const DEFAULT_REGISTRY_PATH: &str = "/etc/keel/plugins";
/// Root under which model module sources are mounted.
pub const MODEL_PATH: &str = "/etc/keel/models";
/// Scratch path compilers build in.
pub const BUILD_PATH: &str = "/build";
/// Name of the registry sidecar.
pub const REGISTRY_CONTAINER: &str = "model-registry";

/// Environment variable carrying the registry path.
pub const ENV_MODEL_REGISTRY: &str = "CONFIG_MODEL_REGISTRY";
/// Environment variable carrying the target module.
pub const ENV_MODULE_TARGET: &str = "CONFIG_MODULE_TARGET";
/// Environment variable carrying the module replacement.
pub const ENV_MODULE_REPLACE: &str = "CONFIG_MODULE_REPLACE";

/// A workload submitted for admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Namespace the workload is created in.
    pub namespace: String,
    /// The workload as submitted.
    pub object: serde_json::Value,
}

impl AdmissionRequest {
    /// Wraps a pod record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the pod cannot be serialized.
    pub fn for_pod(pod: &Record<Pod>) -> Result<Self> {
        Ok(Self {
            namespace: pod.meta.namespace.clone(),
            object: serde_json::to_value(pod)?,
        })
    }
}

/// Answer to an [`AdmissionRequest`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum Response {
    /// Admitted unchanged.
    Allowed {
        /// Why nothing was changed.
        reason: String,
    },
    /// Admitted with changes.
    Patched {
        /// The mutated pod.
        pod: Box<Record<Pod>>,
    },
    /// Rejected.
    Denied {
        /// Why the workload was rejected.
        reason: String,
    },
    /// The mutation itself failed.
    Errored {
        /// HTTP-style status code.
        code: u16,
        /// Failure detail.
        message: String,
    },
}

impl Response {
    fn allowed(reason: impl Into<String>) -> Self {
        Self::Allowed {
            reason: reason.into(),
        }
    }

    fn from_error(err: &Error) -> Self {
        if err.is_denial() {
            Self::Denied {
                reason: err.to_string(),
            }
        } else {
            Self::Errored {
                code: err.status_code(),
                message: err.to_string(),
            }
        }
    }

    /// Returns the metric label for this response.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Allowed { .. } => "allowed",
            Self::Patched { .. } => "patched",
            Self::Denied { .. } => "denied",
            Self::Errored { .. } => "errored",
        }
    }

    /// Returns the mutated pod of a patched response.
    #[must_use]
    pub fn into_patched(self) -> Option<Record<Pod>> {
        match self {
            Self::Patched { pod } => Some(*pod),
            _ => None,
        }
    }
}

/// Plugin settings read from a pod's annotations.
#[derive(Debug)]
struct PluginSettings {
    registry: RecordKey,
    registry_path: String,
    image_tag: String,
    mod_target: String,
    mod_replace: String,
}

impl PluginSettings {
    fn from_pod(namespace: &str, pod: &Record<Pod>) -> Result<Self> {
        let meta = &pod.meta;
        let name = meta
            .annotation(REGISTRY_NAME_ANNOTATION)
            .filter(|v| !v.is_empty())
            .ok_or(Error::MissingAnnotation(REGISTRY_NAME_ANNOTATION))?;
        let api_version = meta
            .annotation(PLUGIN_API_VERSION_ANNOTATION)
            .filter(|v| !v.is_empty())
            .ok_or(Error::MissingAnnotation(PLUGIN_API_VERSION_ANNOTATION))?;
        let registry_namespace = meta
            .annotation(REGISTRY_NAMESPACE_ANNOTATION)
            .filter(|v| !v.is_empty())
            .unwrap_or(namespace);

        let mut image_tag = api_version.to_string();
        if let Some(build) = meta
            .annotation(PLUGIN_GOLANG_BUILD_VERSION_ANNOTATION)
            .filter(|v| !v.is_empty())
        {
            image_tag = format!("{image_tag}-build-{build}");
        }

        Ok(Self {
            registry: RecordKey::new(registry_namespace, name),
            registry_path: meta
                .annotation(REGISTRY_PATH_ANNOTATION)
                .filter(|v| !v.is_empty())
                .unwrap_or(DEFAULT_REGISTRY_PATH)
                .to_string(),
            image_tag,
            mod_target: meta
                .annotation(PLUGIN_GO_MOD_TARGET_ANNOTATION)
                .unwrap_or_default()
                .to_string(),
            mod_replace: meta
                .annotation(PLUGIN_GO_MOD_REPLACE_ANNOTATION)
                .unwrap_or_default()
                .to_string(),
        })
    }

    fn module_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if !self.mod_target.is_empty() {
            args.extend(["--target".to_string(), self.mod_target.clone()]);
        }
        if !self.mod_replace.is_empty() {
            args.extend(["--replace".to_string(), self.mod_replace.clone()]);
        }
        args
    }
}

/// Mutates registry replica pods at admission time.
///
/// Reads [`ModelRegistry`] and [`Model`] records through the same store the
/// controllers use. Model status may lag behind; the injector only depends on
/// model specs.
pub struct RegistryInjector {
    registries: Arc<dyn ResourceStore<ModelRegistry>>,
    models: Arc<dyn ResourceStore<Model>>,
    config: InjectorConfig,
}

impl RegistryInjector {
    /// Creates an injector.
    pub fn new(
        registries: Arc<dyn ResourceStore<ModelRegistry>>,
        models: Arc<dyn ResourceStore<Model>>,
        config: InjectorConfig,
    ) -> Self {
        Self {
            registries,
            models,
            config,
        }
    }

    /// Decodes and mutates a submitted workload.
    pub async fn handle(&self, request: &AdmissionRequest) -> Response {
        let start = Instant::now();
        let response = match serde_json::from_value::<Record<Pod>>(request.object.clone()) {
            Ok(pod) => self
                .mutate(&request.namespace, pod)
                .await
                .unwrap_or_else(|err| Response::from_error(&err)),
            Err(err) => Response::from_error(&Error::from(err)),
        };

        match &response {
            Response::Denied { reason } => {
                tracing::warn!(namespace = %request.namespace, %reason, "workload denied");
            }
            Response::Errored { code, message } => {
                tracing::error!(namespace = %request.namespace, code, %message, "admission failed");
            }
            _ => {}
        }
        record_admission(response.as_label(), start.elapsed());
        response
    }

    /// Mutates a decoded pod.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingAnnotation`] or [`Error::NotFound`] for a
    /// workload that must be denied, and [`Error::Store`] when records cannot
    /// be read.
    pub async fn mutate(&self, namespace: &str, mut pod: Record<Pod>) -> Result<Response> {
        let enabled = pod
            .meta
            .annotation(REGISTRY_INJECT_ANNOTATION)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        if !enabled {
            return Ok(Response::allowed(format!(
                "'{REGISTRY_INJECT_ANNOTATION}' annotation not set"
            )));
        }
        if pod.meta.annotation(REGISTRY_INJECT_STATUS_ANNOTATION) == Some(INJECT_STATUS_INJECTED) {
            tracing::debug!(pod = %pod.meta.name, %namespace, "registry already injected");
            return Ok(Response::allowed("registry already injected"));
        }

        let settings = PluginSettings::from_pod(namespace, &pod)?;
        let registry = self
            .registries
            .get(&settings.registry)
            .await?
            .ok_or_else(|| Error::not_found(ModelRegistry::KIND, &settings.registry))?;
        tracing::info!(
            pod = %pod.meta.name,
            %namespace,
            registry = %settings.registry,
            "injecting model registry"
        );

        let volume = registry.spec.volume;
        add_volume(&mut pod, volume.clone());
        for container in &mut pod.spec.containers {
            if container.volume_mounts.iter().any(|m| m.name == volume.name) {
                continue;
            }
            container.env.extend([
                EnvVar::new(ENV_MODEL_REGISTRY, &settings.registry_path),
                EnvVar::new(ENV_MODULE_TARGET, &settings.mod_target),
                EnvVar::new(ENV_MODULE_REPLACE, &settings.mod_replace),
            ]);
            container
                .volume_mounts
                .push(mount(&volume.name, &settings.registry_path));
        }

        let models = self
            .models
            .list(&ListOptions::in_namespace(namespace))
            .await?;
        for model in &models {
            let Some(plugin) = &model.spec.plugin else {
                continue;
            };
            if model.meta.is_deleting() {
                continue;
            }
            let closure = self.dependency_closure(namespace, model).await?;
            for dep in &closure {
                add_volume(
                    &mut pod,
                    Volume {
                        name: model_volume(&dep.meta.name),
                        source: VolumeSource::ConfigMap {
                            name: dep.meta.name.clone(),
                        },
                    },
                );
            }
            let container = self.compiler_container(plugin, &closure, &volume, &settings);
            if !pod.spec.init_containers.iter().any(|c| c.name == container.name) {
                tracing::debug!(model = %model.meta.name, container = %container.name, "adding compiler");
                pod.spec.init_containers.push(container);
            }
        }

        if !pod.spec.containers.iter().any(|c| c.name == REGISTRY_CONTAINER) {
            let sidecar = self.registry_container(&volume, &settings);
            pod.spec.containers.push(sidecar);
        }

        pod.meta.annotations.insert(
            REGISTRY_INJECT_STATUS_ANNOTATION.to_string(),
            INJECT_STATUS_INJECTED.to_string(),
        );
        Ok(Response::Patched { pod: Box::new(pod) })
    }

    /// Returns `root` followed by every model it transitively depends on,
    /// each once.
    async fn dependency_closure(
        &self,
        namespace: &str,
        root: &Record<Model>,
    ) -> Result<Vec<Record<Model>>> {
        let mut seen = BTreeSet::from([root.meta.name.clone()]);
        let mut closure = vec![root.clone()];
        let mut next = 0;
        while next < closure.len() {
            let dependencies = closure[next].spec.dependencies.clone();
            next += 1;
            for dependency in dependencies {
                if !seen.insert(dependency.name.clone()) {
                    continue;
                }
                let key = RecordKey::new(namespace, &dependency.name);
                let record = self
                    .models
                    .get(&key)
                    .await?
                    .ok_or_else(|| Error::not_found(Model::KIND, &key))?;
                closure.push(record);
            }
        }
        Ok(closure)
    }

    fn compiler_container(
        &self,
        plugin: &PluginSpec,
        closure: &[Record<Model>],
        registry: &Volume,
        settings: &PluginSettings,
    ) -> Container {
        // First definition of a module wins, so a model overrides its dependencies.
        let mut modules = BTreeMap::new();
        for model in closure {
            for module in &model.spec.modules {
                let id = if module.revision.is_empty() {
                    module.name.clone()
                } else {
                    format!("{}@{}", module.name, module.revision)
                };
                modules.entry(id).or_insert_with(|| {
                    format!("{MODEL_PATH}/{}/{}", model.meta.name, module.file_name())
                });
            }
        }

        let mut args = vec![
            "--name".to_string(),
            plugin.type_.clone(),
            "--version".to_string(),
            plugin.version.clone(),
            "--build-path".to_string(),
            BUILD_PATH.to_string(),
            "--output-path".to_string(),
            settings.registry_path.clone(),
        ];
        args.extend(settings.module_args());
        for (id, path) in modules {
            args.extend(["--module".to_string(), format!("{id}={path}")]);
        }

        let mut volume_mounts: Vec<VolumeMount> = closure
            .iter()
            .map(|m| {
                mount(
                    &model_volume(&m.meta.name),
                    &format!("{MODEL_PATH}/{}", m.meta.name),
                )
            })
            .collect();
        volume_mounts.push(mount(&registry.name, &settings.registry_path));

        Container {
            name: format!(
                "{}-{}-compiler",
                plugin.type_.to_lowercase(),
                plugin.version.replace('.', "-")
            ),
            image: format!("{}:{}", self.config.compiler_image, settings.image_tag),
            args,
            env: Vec::new(),
            volume_mounts,
        }
    }

    fn registry_container(&self, registry: &Volume, settings: &PluginSettings) -> Container {
        let mut args = vec![
            "--registry-path".to_string(),
            settings.registry_path.clone(),
            "--build-path".to_string(),
            BUILD_PATH.to_string(),
        ];
        args.extend(settings.module_args());
        Container {
            name: REGISTRY_CONTAINER.to_string(),
            image: format!("{}:{}", self.config.registry_image, settings.image_tag),
            args,
            env: Vec::new(),
            volume_mounts: vec![mount(&registry.name, &settings.registry_path)],
        }
    }
}

fn add_volume(pod: &mut Record<Pod>, volume: Volume) {
    if !pod.spec.volumes.iter().any(|v| v.name == volume.name) {
        pod.spec.volumes.push(volume);
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        sub_path: None,
    }
}

fn model_volume(model: &str) -> String {
    format!("model-{model}")
}
