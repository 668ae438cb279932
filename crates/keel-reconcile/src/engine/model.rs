//! Model strategy: one record, many registry replicas.
//!
//! A model's compiled plugin is pushed to every eligible registry replica in
//! the model's namespace. Progress per replica lives in
//! `status.registry_statuses` and is planned by [`FanoutTracker`]. Each entry
//! names the plugin file the replica holds, so a version change first deletes
//! the outdated file and then pushes the new one, and teardown deletes exactly
//! what each replica holds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use keel_core::api::config::{InstallPhase, Model, ModelStatus};
use keel_core::id::TargetId;
use keel_core::locator::{Endpoint, RoleSelector, TargetLocator};
use keel_core::record::Record;

use super::{Applied, Mode, Strategy};
use crate::artifact::{ArtifactCache, ArtifactKey};
use crate::error::{Error, Result};
use crate::fanout::{FanoutStep, FanoutTracker};
use crate::metrics::ControllerMetrics;
use crate::remote::Connector;
use crate::transfer;

/// Next move for a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelAction {
    /// Persist a recomputed replica list.
    Sync(FanoutTracker),
    /// Push the plugin to one replica.
    Push(TargetId),
    /// Delete an outdated plugin from a replica being upgraded.
    Retire(TargetId, String),
    /// Delete the plugin a replica holds and drop its entry.
    Remove(TargetId, String),
}

/// Strategy for configuration models.
pub struct ModelStrategy {
    locator: Arc<dyn TargetLocator>,
    connector: Arc<dyn Connector>,
    artifacts: Arc<dyn ArtifactCache>,
    role: RoleSelector,
    chunk_size: usize,
    timeout: Duration,
    metrics: ControllerMetrics,
}

impl std::fmt::Debug for ModelStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelStrategy")
            .field("role", &self.role)
            .field("chunk_size", &self.chunk_size)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

const CONTROLLER: &str = "model";

impl ModelStrategy {
    /// Creates a strategy pushing to the replicas selected by `role`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an out-of-range chunk size.
    pub fn new(
        locator: Arc<dyn TargetLocator>,
        connector: Arc<dyn Connector>,
        artifacts: Arc<dyn ArtifactCache>,
        role: RoleSelector,
        chunk_size: usize,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            locator,
            connector,
            artifacts,
            role,
            chunk_size: transfer::validate_chunk_size(chunk_size)?,
            timeout,
            metrics: ControllerMetrics::new(CONTROLLER),
        })
    }

    fn endpoint<'a>(targets: &'a [Endpoint], target: &TargetId) -> Result<&'a Endpoint> {
        targets
            .iter()
            .find(|e| &e.target == target && e.reachable)
            .ok_or_else(|| Error::unavailable(format!("replica {target} is not reachable")))
    }

    fn status_with(&self, record: &Record<Model>, tracker: &FanoutTracker) -> ModelStatus {
        let key = record.key();
        for phase in [
            InstallPhase::Pending,
            InstallPhase::Installing,
            InstallPhase::Installed,
        ] {
            self.metrics
                .set_fanout_entries(&key, phase.as_label(), tracker.count(phase));
        }
        ModelStatus {
            registry_statuses: tracker.to_statuses(),
            conditions: record.status.conditions.clone(),
        }
    }

    async fn delete_from(
        &self,
        targets: &[Endpoint],
        target: &TargetId,
        filename: &str,
    ) -> Result<()> {
        let endpoint = Self::endpoint(targets, target)?;
        let client = self.connector.registry(&endpoint.address).await?;
        transfer::delete(client.as_ref(), filename, self.timeout).await
    }
}

fn desired_filename(record: &Record<Model>) -> Option<String> {
    record
        .spec
        .plugin
        .as_ref()
        .map(|plugin| ArtifactKey::for_plugin(plugin).filename())
}

#[async_trait]
impl Strategy<Model> for ModelStrategy {
    type Observed = Vec<Endpoint>;
    type Action = ModelAction;

    fn name(&self) -> &'static str {
        CONTROLLER
    }

    async fn observe(&self, record: &Record<Model>, _mode: Mode) -> Result<Vec<Endpoint>> {
        Ok(self
            .locator
            .resolve(&record.meta.namespace, &self.role)
            .await?)
    }

    fn diff(
        &self,
        record: &Record<Model>,
        targets: &Vec<Endpoint>,
        mode: Mode,
    ) -> Result<Option<ModelAction>> {
        let tracker = FanoutTracker::from_statuses(&record.status.registry_statuses);
        let desired = desired_filename(record);
        let step = match mode {
            Mode::Converge => {
                let Some(desired) = desired else {
                    return Err(Error::invalid(
                        "MissingPlugin",
                        "spec.plugin is required to install a model",
                    ));
                };
                tracker.plan_install(targets, &desired)
            }
            Mode::Teardown => tracker.plan_teardown(targets, desired.as_deref()),
        };
        Ok(match step {
            FanoutStep::Sync(next) => Some(ModelAction::Sync(next)),
            FanoutStep::Push(target) => Some(ModelAction::Push(target)),
            FanoutStep::Retire { target, artifact } => Some(ModelAction::Retire(target, artifact)),
            FanoutStep::Remove { target, artifact } => Some(ModelAction::Remove(target, artifact)),
            FanoutStep::Idle => None,
        })
    }

    async fn apply(
        &self,
        record: &Record<Model>,
        targets: &Vec<Endpoint>,
        action: ModelAction,
    ) -> Result<Applied<ModelStatus>> {
        let mut tracker = FanoutTracker::from_statuses(&record.status.registry_statuses);
        match action {
            ModelAction::Sync(next) => {
                let more =
                    next.has_pending_push() || (record.meta.is_deleting() && !next.is_empty());
                Ok(Applied {
                    status: Some(self.status_with(record, &next)),
                    more,
                    effect: "status_sync",
                })
            }
            ModelAction::Push(target) => {
                let plugin = record.spec.plugin.as_ref().ok_or_else(|| {
                    Error::invalid("MissingPlugin", "spec.plugin is required to install a model")
                })?;
                let key = ArtifactKey::for_plugin(plugin);
                let content = self
                    .artifacts
                    .get(&key)
                    .await?
                    .ok_or_else(|| Error::ArtifactUnavailable {
                        filename: key.filename(),
                    })?;
                let endpoint = Self::endpoint(targets, &target)?;
                let client = self.connector.registry(&endpoint.address).await?;
                transfer::push(client.as_ref(), &key, &content, self.chunk_size, self.timeout)
                    .await?;
                tracing::info!(%target, artifact = %key, "installed model plugin");
                tracker.mark_installed(&target, &key.filename());
                Ok(Applied {
                    status: Some(self.status_with(record, &tracker)),
                    more: tracker.has_pending_push(),
                    effect: "artifact_push",
                })
            }
            ModelAction::Retire(target, filename) => {
                self.delete_from(targets, &target, &filename).await?;
                tracing::info!(%target, artifact = %filename, "retired outdated model plugin");
                tracker.mark_retired(&target);
                Ok(Applied {
                    status: Some(self.status_with(record, &tracker)),
                    more: true,
                    effect: "artifact_retire",
                })
            }
            ModelAction::Remove(target, filename) => {
                self.delete_from(targets, &target, &filename).await?;
                tracing::info!(%target, artifact = %filename, "removed model plugin");
                tracker.remove(&target);
                Ok(Applied {
                    status: Some(self.status_with(record, &tracker)),
                    more: !tracker.is_empty(),
                    effect: "artifact_delete",
                })
            }
        }
    }
}
