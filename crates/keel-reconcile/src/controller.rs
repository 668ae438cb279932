//! Controller runtime.
//!
//! A [`Controller`] feeds record keys into a [`WorkQueue`] and runs a bounded
//! pool of workers that call [`Engine::reconcile`]. Keys come from:
//!
//! - the primary watch on the reconciled kind
//! - related watches, mapped to dependent keys by a [`KeyMapper`]
//! - an initial list and periodic resync of every record
//! - a full relist whenever a watch subscriber falls behind
//!
//! ## Retry Policy
//!
//! | Result | Action |
//! |--------|--------|
//! | `Ok(requeue)` | forget failures, enqueue now |
//! | `Ok(done)` | forget failures |
//! | `Err(Conflict)` | enqueue now, re-read state |
//! | `Err(Invalid)` | log, forget |
//! | `Err(_)` | enqueue after backoff |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;

use keel_core::id::RecordKey;
use keel_core::record::{HasConditions, ResourceKind};
use keel_core::store::{ListOptions, ResourceStore, WatchEvent};

use crate::config::Config;
use crate::engine::{Engine, Strategy};
use crate::error::Result;
use crate::queue::{Backoff, WorkQueue};

/// Maps a change of a related record to keys of reconciled records.
#[async_trait]
pub trait KeyMapper: Send + Sync {
    /// Returns the keys to enqueue for `event`.
    async fn map(&self, event: &WatchEvent) -> Result<Vec<RecordKey>>;
}

/// Enqueues records whose indexed `field` equals the changed record's name.
///
/// Used to re-trigger entities and relations when their kind changes.
pub struct FieldMapper<K: ResourceKind> {
    store: Arc<dyn ResourceStore<K>>,
    field: &'static str,
}

impl<K: ResourceKind> FieldMapper<K> {
    /// Creates a mapper over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore<K>>, field: &'static str) -> Self {
        Self { store, field }
    }
}

#[async_trait]
impl<K: ResourceKind> KeyMapper for FieldMapper<K> {
    async fn map(&self, event: &WatchEvent) -> Result<Vec<RecordKey>> {
        let options = ListOptions::in_namespace(&event.key.namespace)
            .with_field(self.field, &event.key.name);
        Ok(self
            .store
            .list(&options)
            .await?
            .iter()
            .map(|r| r.key())
            .collect())
    }
}

/// Enqueues every record in the changed record's namespace.
///
/// Used to re-trigger models when registry replicas come and go.
pub struct ScopeMapper<K: ResourceKind> {
    store: Arc<dyn ResourceStore<K>>,
}

impl<K: ResourceKind> ScopeMapper<K> {
    /// Creates a mapper over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore<K>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<K: ResourceKind> KeyMapper for ScopeMapper<K> {
    async fn map(&self, event: &WatchEvent) -> Result<Vec<RecordKey>> {
        Ok(self
            .store
            .list(&ListOptions::in_namespace(&event.key.namespace))
            .await?
            .iter()
            .map(|r| r.key())
            .collect())
    }
}

struct RelatedWatch {
    events: broadcast::Receiver<WatchEvent>,
    mapper: Arc<dyn KeyMapper>,
}

/// Runs an [`Engine`] against a stream of keys.
pub struct Controller<K: ResourceKind, S> {
    engine: Arc<Engine<K, S>>,
    queue: Arc<WorkQueue>,
    events: broadcast::Receiver<WatchEvent>,
    related: Vec<RelatedWatch>,
    workers: usize,
    resync_interval: Duration,
    namespace: Option<String>,
}

impl<K, S> Controller<K, S>
where
    K: ResourceKind,
    K::Status: HasConditions,
    S: Strategy<K> + 'static,
{
    /// Creates a controller for `engine` using the runtime settings in `config`.
    ///
    /// The primary watch is subscribed here, so changes made after this call
    /// are not missed.
    pub fn new(engine: Engine<K, S>, config: &Config) -> Self {
        let events = engine.store().watch();
        Self {
            engine: Arc::new(engine),
            queue: Arc::new(WorkQueue::new(Backoff {
                base: config.backoff_base,
                max: config.backoff_max,
            })),
            events,
            related: Vec::new(),
            workers: config.workers.max(1),
            resync_interval: config.resync_interval,
            namespace: config.watch_namespace.clone(),
        }
    }

    /// Adds a related watch whose events are mapped to keys by `mapper`.
    #[must_use]
    pub fn watches(
        mut self,
        events: broadcast::Receiver<WatchEvent>,
        mapper: Arc<dyn KeyMapper>,
    ) -> Self {
        self.related.push(RelatedWatch { events, mapper });
        self
    }

    /// Returns the work queue.
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Runs until `shutdown` becomes true.
    ///
    /// In-flight reconciles finish before this returns; keys still queued are
    /// dropped and picked up by the next resync after restart.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let name = self.engine.name();
        tracing::info!(controller = name, workers = self.workers, "starting controller");

        let mut feeders = JoinSet::new();
        feeders.spawn(pump_primary(
            self.events,
            Arc::clone(self.engine.store()),
            Arc::clone(&self.queue),
            self.namespace.clone(),
        ));
        for related in self.related {
            feeders.spawn(pump_related(
                related.events,
                related.mapper,
                Arc::clone(self.engine.store()),
                Arc::clone(&self.queue),
                self.namespace.clone(),
            ));
        }
        feeders.spawn(resync(
            Arc::clone(self.engine.store()),
            Arc::clone(&self.queue),
            self.resync_interval,
            self.namespace.clone(),
        ));

        let mut workers = JoinSet::new();
        for _ in 0..self.workers {
            workers.spawn(work(Arc::clone(&self.engine), Arc::clone(&self.queue)));
        }

        // A dropped sender counts as shutdown.
        let _ = shutdown.wait_for(|stop| *stop).await;

        tracing::info!(controller = name, "stopping controller");
        self.queue.shut_down();
        feeders.abort_all();
        while workers.join_next().await.is_some() {}
        tracing::info!(controller = name, "controller stopped");
    }
}

fn in_scope(namespace: Option<&str>, key: &RecordKey) -> bool {
    namespace.is_none_or(|ns| ns == key.namespace)
}

async fn relist<K: ResourceKind>(
    store: &Arc<dyn ResourceStore<K>>,
    queue: &WorkQueue,
    namespace: Option<&str>,
) {
    let options = namespace.map_or_else(ListOptions::all, ListOptions::in_namespace);
    match store.list(&options).await {
        Ok(records) => {
            for record in records {
                queue.add(record.key());
            }
        }
        Err(err) => tracing::warn!(kind = K::KIND, error = %err, "relist failed"),
    }
}

async fn pump_primary<K: ResourceKind>(
    mut events: broadcast::Receiver<WatchEvent>,
    store: Arc<dyn ResourceStore<K>>,
    queue: Arc<WorkQueue>,
    namespace: Option<String>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if in_scope(namespace.as_deref(), &event.key) {
                    queue.add(event.key);
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(kind = K::KIND, missed, "watch lagged; relisting");
                relist(&store, &queue, namespace.as_deref()).await;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn pump_related<K: ResourceKind>(
    mut events: broadcast::Receiver<WatchEvent>,
    mapper: Arc<dyn KeyMapper>,
    store: Arc<dyn ResourceStore<K>>,
    queue: Arc<WorkQueue>,
    namespace: Option<String>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if !in_scope(namespace.as_deref(), &event.key) {
                    continue;
                }
                match mapper.map(&event).await {
                    Ok(keys) => {
                        for key in keys {
                            queue.add(key);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(kind = event.kind, key = %event.key, error = %err, "mapping related change failed; relisting");
                        relist(&store, &queue, namespace.as_deref()).await;
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(kind = K::KIND, missed, "related watch lagged; relisting");
                relist(&store, &queue, namespace.as_deref()).await;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn resync<K: ResourceKind>(
    store: Arc<dyn ResourceStore<K>>,
    queue: Arc<WorkQueue>,
    interval: Duration,
    namespace: Option<String>,
) {
    if interval.is_zero() {
        relist(&store, &queue, namespace.as_deref()).await;
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        relist(&store, &queue, namespace.as_deref()).await;
    }
}

async fn work<K, S>(engine: Arc<Engine<K, S>>, queue: Arc<WorkQueue>)
where
    K: ResourceKind,
    K::Status: HasConditions,
    S: Strategy<K>,
{
    while let Some(key) = queue.get().await {
        match engine.reconcile(&key).await {
            Ok(outcome) => {
                queue.forget(&key);
                if outcome.requeue {
                    queue.add(key.clone());
                }
            }
            Err(err) if err.is_conflict() => {
                engine.metrics().record_retry(err.class().as_label());
                tracing::debug!(%key, error = %err, "stale read; retrying now");
                queue.add(key.clone());
            }
            Err(err) if err.is_invalid() => {
                engine.metrics().record_retry(err.class().as_label());
                tracing::error!(%key, error = %err, "reconcile rejected; not retrying");
                queue.forget(&key);
            }
            Err(err) => {
                engine.metrics().record_retry(err.class().as_label());
                let delay = queue.add_rate_limited(key.clone());
                tracing::warn!(%key, error = %err, ?delay, "reconcile failed; retrying");
            }
        }
        queue.done(&key);
        engine.metrics().set_queue_depth(queue.len());
    }
}
