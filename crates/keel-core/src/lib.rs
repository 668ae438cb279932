//! # keel-core
//!
//! Shared primitives for keel controllers.
//!
//! This crate provides the types every other keel crate builds on:
//!
//! - **Records**: Typed `spec`/`status` records with store-managed metadata
//! - **Kinds**: Topology, configuration model and workload record kinds
//! - **Store**: Optimistic-concurrency record storage with watches
//! - **Locator**: Discovery of remote endpoints implementing a backend role
//! - **Error Types**: Shared error definitions and the error classification
//!
//! ## Example
//!
//! ```rust
//! use keel_core::prelude::*;
//! use keel_core::api::topo::{Entity, EntitySpec, ObjectRef};
//!
//! let record = Record::<Entity>::new(
//!     "network",
//!     "leaf-1",
//!     EntitySpec { kind: ObjectRef::named("switch"), ..EntitySpec::default() },
//! );
//! assert_eq!(record.key(), RecordKey::new("network", "leaf-1"));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod api;
pub mod error;
pub mod id;
pub mod locator;
pub mod observability;
pub mod record;
pub mod store;

pub use error::{Error, ErrorClass, Result};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, ErrorClass, Result};
    pub use crate::id::{RecordKey, RecordUid, TargetId};
    pub use crate::locator::{Endpoint, RoleKind, RoleSelector, StoreLocator, TargetLocator};
    pub use crate::record::{Condition, HasConditions, ObjectMeta, OwnerReference, Record, ResourceKind};
    pub use crate::store::memory::InMemoryResourceStore;
    pub use crate::store::{EventType, ListOptions, ResourceStore, WatchEvent};
}
