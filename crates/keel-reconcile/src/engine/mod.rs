//! The convergence engine.
//!
//! [`Engine::reconcile`] is the single entrypoint every controller runs. It is
//! level-triggered: the input is a record key, and the current record, scope
//! and remote state are re-read on every invocation. Each invocation makes at
//! most one state-advancing move and reports whether more remain.
//!
//! ## State Machine
//!
//! ```text
//! Creating    -> add finalizer                                   (requeue)
//! Reconciling -> prepare metadata (owner references)             (requeue)
//! Reconciling -> observe, diff, apply one action                 (requeue while more)
//! Reconciling -> converged                                       (done)
//! Deleting    -> scope gone: remove finalizer                    (done)
//! Deleting    -> observe, diff, apply one teardown action        (requeue while more)
//! Deleting    -> nothing left remotely: remove finalizer         (done)
//! Deleting    -> cleanup rejected: record Invalid, remove finalizer (done)
//! ```
//!
//! What "observe", "diff" and "apply" mean for a kind is supplied by a
//! [`Strategy`]. Desired state that can never be mapped onto the remote model
//! is recorded as an `Invalid` status condition and not retried.

pub mod model;
pub mod topo;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::Instrument;

use keel_core::api::workload::Namespace;
use keel_core::id::RecordKey;
use keel_core::observability::reconcile_span;
use keel_core::record::{HasConditions, ObjectMeta, Record, ResourceKind};
use keel_core::store::ResourceStore;

use crate::error::{Error, Result};
use crate::metrics::ControllerMetrics;

/// Condition type written for desired state that cannot converge.
pub const INVALID_CONDITION: &str = "Invalid";

/// Direction of a reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Drive remote state toward the spec.
    Converge,
    /// Reverse the record's remote effect.
    Teardown,
}

/// Result of one reconcile invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Run again immediately; progress was made and more remains.
    pub requeue: bool,
}

impl Outcome {
    /// Terminal success.
    pub const DONE: Self = Self { requeue: false };
    /// Progress with more remaining.
    pub const REQUEUE: Self = Self { requeue: true };
}

/// What an applied action produced.
#[derive(Debug)]
pub struct Applied<S> {
    /// New status to persist, if the action changed it.
    pub status: Option<S>,
    /// More actions remain.
    pub more: bool,
    /// Side effect label for metrics.
    pub effect: &'static str,
}

/// Per-kind behavior plugged into the [`Engine`].
#[async_trait]
pub trait Strategy<K: ResourceKind>: Send + Sync {
    /// Remote state read before diffing.
    type Observed: Send + Sync;
    /// One state-advancing move.
    type Action: Send + fmt::Debug;

    /// Controller name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Returns metadata to persist before convergence starts, if any.
    async fn prepare(&self, _record: &Record<K>) -> Result<Option<ObjectMeta>> {
        Ok(None)
    }

    /// Reads whatever remote state `diff` needs. Never mutates.
    async fn observe(&self, record: &Record<K>, mode: Mode) -> Result<Self::Observed>;

    /// Picks the next action, or `None` once converged (or fully torn down).
    fn diff(
        &self,
        record: &Record<K>,
        observed: &Self::Observed,
        mode: Mode,
    ) -> Result<Option<Self::Action>>;

    /// Performs the action's single remote side effect.
    async fn apply(
        &self,
        record: &Record<K>,
        observed: &Self::Observed,
        action: Self::Action,
    ) -> Result<Applied<K::Status>>;
}

/// Generic reconcile loop body for one kind.
pub struct Engine<K: ResourceKind, S> {
    store: Arc<dyn ResourceStore<K>>,
    namespaces: Arc<dyn ResourceStore<Namespace>>,
    strategy: S,
    finalizer: String,
    metrics: ControllerMetrics,
}

impl<K: ResourceKind, S> fmt::Debug for Engine<K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("kind", &K::KIND)
            .field("finalizer", &self.finalizer)
            .finish_non_exhaustive()
    }
}

impl<K, S> Engine<K, S>
where
    K: ResourceKind,
    K::Status: HasConditions,
    S: Strategy<K>,
{
    /// Creates an engine.
    pub fn new(
        store: Arc<dyn ResourceStore<K>>,
        namespaces: Arc<dyn ResourceStore<Namespace>>,
        strategy: S,
        finalizer: impl Into<String>,
    ) -> Self {
        let metrics = ControllerMetrics::new(strategy.name());
        Self {
            store,
            namespaces,
            strategy,
            finalizer: finalizer.into(),
            metrics,
        }
    }

    /// Returns the controller name.
    pub fn name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Returns the store of the reconciled kind.
    pub fn store(&self) -> &Arc<dyn ResourceStore<K>> {
        &self.store
    }

    /// Returns the metrics recorder.
    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    /// Reconciles one record.
    ///
    /// # Errors
    ///
    /// Returns retryable failures (`Conflict`, `Unavailable`, unexpected
    /// `NotFound`). `Invalid` desired state is reported through status and
    /// yields `Ok`.
    pub async fn reconcile(&self, key: &RecordKey) -> Result<Outcome> {
        let span = reconcile_span(self.name(), &key.namespace, &key.name);
        let started = Instant::now();
        let result = self.reconcile_inner(key).instrument(span).await;
        let label = match &result {
            Ok(outcome) if outcome.requeue => "requeue",
            Ok(_) => "done",
            Err(_) => "error",
        };
        self.metrics.record_reconcile(label, started);
        result
    }

    async fn reconcile_inner(&self, key: &RecordKey) -> Result<Outcome> {
        let Some(record) = self.store.get(key).await? else {
            tracing::debug!("record no longer exists");
            return Ok(Outcome::DONE);
        };

        if record.meta.is_deleting() {
            return self.teardown(record).await;
        }

        if !record.meta.has_finalizer(&self.finalizer) {
            let mut next = record.clone();
            next.meta.add_finalizer(&self.finalizer);
            self.store.update(&next).await?;
            self.metrics.record_effect("finalizer_add");
            tracing::info!(finalizer = %self.finalizer, "added finalizer");
            return Ok(Outcome::REQUEUE);
        }

        if let Some(meta) = self.strategy.prepare(&record).await? {
            let mut next = record.clone();
            next.meta = meta;
            self.store.update(&next).await?;
            self.metrics.record_effect("metadata");
            tracing::info!("updated metadata");
            return Ok(Outcome::REQUEUE);
        }

        let planned = match self.plan(&record, Mode::Converge).await {
            Err(err) if err.is_invalid() => return self.record_invalid(&record, &err).await,
            other => other?,
        };
        let Some((observed, action)) = planned else {
            let mut status = record.status.clone();
            if status.clear_condition(INVALID_CONDITION) {
                self.write_status(&record, status).await?;
            }
            tracing::debug!("converged");
            return Ok(Outcome::DONE);
        };

        tracing::debug!(?action, "applying");
        let applied = match self.strategy.apply(&record, &observed, action).await {
            Err(err) if err.is_invalid() => return self.record_invalid(&record, &err).await,
            other => other?,
        };
        self.metrics.record_effect(applied.effect);

        let mut status = applied.status.unwrap_or_else(|| record.status.clone());
        status.clear_condition(INVALID_CONDITION);
        if status != record.status {
            self.write_status(&record, status).await?;
        }
        Ok(Outcome {
            requeue: applied.more,
        })
    }

    async fn teardown(&self, record: Record<K>) -> Result<Outcome> {
        if !record.meta.has_finalizer(&self.finalizer) {
            tracing::debug!("deleting without our finalizer");
            return Ok(Outcome::DONE);
        }

        if self.scope_terminating(&record.meta.namespace).await? {
            tracing::info!(
                namespace = %record.meta.namespace,
                "scope is gone or terminating; skipping remote cleanup"
            );
            return self.remove_finalizer(record).await;
        }

        let planned = match self.plan(&record, Mode::Teardown).await {
            Err(err) if err.is_invalid() => {
                tracing::info!(error = %err, "desired state never mapped remotely");
                None
            }
            other => other?,
        };

        if let Some((observed, action)) = planned {
            tracing::debug!(?action, "applying teardown");
            let applied = match self.strategy.apply(&record, &observed, action).await {
                Err(err) if err.is_invalid() => return self.abandon_cleanup(record, &err).await,
                other => other?,
            };
            self.metrics.record_effect(applied.effect);
            if let Some(status) = applied.status.filter(|s| *s != record.status) {
                self.write_status(&record, status).await?;
                return Ok(Outcome::REQUEUE);
            }
            if applied.more {
                return Ok(Outcome::REQUEUE);
            }
        }

        self.remove_finalizer(record).await
    }

    async fn plan(
        &self,
        record: &Record<K>,
        mode: Mode,
    ) -> Result<Option<(S::Observed, S::Action)>> {
        let observed = self.strategy.observe(record, mode).await?;
        let action = self.strategy.diff(record, &observed, mode)?;
        Ok(action.map(|action| (observed, action)))
    }

    async fn scope_terminating(&self, namespace: &str) -> Result<bool> {
        let scope = self
            .namespaces
            .get(&Namespace::key(namespace))
            .await?;
        Ok(scope.is_none_or(|ns| ns.meta.is_deleting()))
    }

    async fn remove_finalizer(&self, mut record: Record<K>) -> Result<Outcome> {
        record.meta.remove_finalizer(&self.finalizer);
        self.store.update(&record).await?;
        self.metrics.record_effect("finalizer_remove");
        tracing::info!(finalizer = %self.finalizer, "removed finalizer");
        Ok(Outcome::DONE)
    }

    async fn write_status(&self, record: &Record<K>, status: K::Status) -> Result<Record<K>> {
        let mut next = record.clone();
        next.status = status;
        Ok(self.store.update_status(&next).await?)
    }

    /// The remote rejected a cleanup call outright. Retrying cannot succeed,
    /// so the rejection is recorded and the record is released.
    async fn abandon_cleanup(&self, record: Record<K>, err: &Error) -> Result<Outcome> {
        let (reason, message) = invalid_parts(err);
        tracing::warn!(reason, %message, "remote rejected cleanup; releasing record");
        self.metrics.record_retry("invalid");
        let mut status = record.status.clone();
        let record = if status.set_condition(
            INVALID_CONDITION,
            reason,
            &message,
            record.meta.generation,
        ) {
            self.write_status(&record, status).await?
        } else {
            record
        };
        self.remove_finalizer(record).await
    }

    async fn record_invalid(&self, record: &Record<K>, err: &Error) -> Result<Outcome> {
        let (reason, message) = invalid_parts(err);
        tracing::warn!(reason, %message, "desired state is invalid");
        let mut status = record.status.clone();
        if status.set_condition(INVALID_CONDITION, reason, &message, record.meta.generation) {
            self.write_status(record, status).await?;
        }
        self.metrics.record_retry("invalid");
        Ok(Outcome::DONE)
    }
}

fn invalid_parts(err: &Error) -> (&'static str, String) {
    match err {
        Error::Invalid { reason, message } => (*reason, message.clone()),
        other => ("Rejected", other.to_string()),
    }
}
