//! # keel-reconcile
//!
//! Level-triggered reconciliation of declarative records against remote
//! control-plane services.
//!
//! This crate drives two shapes of remote state:
//!
//! - **Topology**: each `Kind`, `Entity` and `Relation` record maps to exactly
//!   one object in the topology service
//! - **Models**: each `Model` record fans its compiled plugin out to every
//!   eligible registry replica in its namespace
//!
//! ## Core Concepts
//!
//! - **Engine**: One reconcile invocation per key. Reads current state, makes
//!   at most one state-advancing move, reports whether more remain
//! - **Strategy**: Per-kind observe, diff and apply
//! - **Finalizer**: Cleanup token that keeps a record visible until its remote
//!   effect is reversed
//! - **Controller**: Watches, work queue, workers and retry policy
//!
//! ## Guarantees
//!
//! - **Idempotent**: Re-running a converged record performs no remote mutation
//! - **Finalizer safety**: A record whose remote state is not torn down keeps
//!   its finalizer
//! - **Per-key serialization**: Two workers never reconcile the same key at once
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use keel_core::api::topo::{Entity, Kind};
//! use keel_core::api::workload::{Namespace, Pod, Service};
//! use keel_core::prelude::*;
//! use keel_reconcile::config::Config;
//! use keel_reconcile::engine::Engine;
//! use keel_reconcile::engine::topo::TopoStrategy;
//! use keel_reconcile::remote::memory::InMemoryConnector;
//!
//! # async fn run() -> keel_reconcile::error::Result<()> {
//! let config = Config::default();
//! let namespaces = Arc::new(InMemoryResourceStore::<Namespace>::new());
//! let kinds = Arc::new(InMemoryResourceStore::<Kind>::new());
//! let entities = Arc::new(InMemoryResourceStore::<Entity>::new());
//! let services = Arc::new(InMemoryResourceStore::<Service>::new());
//! let pods = Arc::new(InMemoryResourceStore::<Pod>::new());
//!
//! let locator = Arc::new(StoreLocator::new(services, pods, &config.cluster_domain));
//! let strategy = TopoStrategy::<Entity>::new(
//!     kinds,
//!     locator,
//!     Arc::new(InMemoryConnector::new()),
//!     config.topo_role(),
//!     config.identity_field,
//!     config.request_timeout,
//! );
//! let engine = Engine::new(entities, namespaces, strategy, &config.finalizer);
//! let outcome = engine.reconcile(&RecordKey::new("network", "leaf-1")).await?;
//! assert!(!outcome.requeue);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod artifact;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod metrics;
pub mod queue;
pub mod remote;
pub mod transfer;

pub use error::{Error, Result};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::artifact::{ArtifactCache, ArtifactKey, FsArtifactCache, InMemoryArtifactCache};
    pub use crate::config::{Config, IdentityField};
    pub use crate::controller::{Controller, FieldMapper, KeyMapper, ScopeMapper};
    pub use crate::engine::model::ModelStrategy;
    pub use crate::engine::topo::{TopoMapping, TopoStrategy};
    pub use crate::engine::{Engine, Mode, Outcome, Strategy};
    pub use crate::error::{Error, Result};
    pub use crate::fanout::{FanoutStep, FanoutTracker};
    pub use crate::queue::{Backoff, WorkQueue};
    pub use crate::remote::{Connector, RegistryClient, TopoClient};
}
