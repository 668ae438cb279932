//! # keel-admission
//!
//! Admission-time mutation of registry replica workloads.
//!
//! Admission is a pure input-to-output transformation: the
//! [`RegistryInjector`](registry::RegistryInjector) reads the named model
//! registry and the models in the workload's namespace, then answers with a
//! patched pod, an unchanged admission, or a denial. It never writes records
//! and runs no convergence loop.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use keel_admission::config::InjectorConfig;
//! use keel_admission::registry::{AdmissionRequest, RegistryInjector, Response};
//! use keel_core::prelude::*;
//!
//! # async fn example(pod: Record<keel_core::api::workload::Pod>) -> keel_admission::Result<()> {
//! let injector = RegistryInjector::new(
//!     Arc::new(InMemoryResourceStore::new()),
//!     Arc::new(InMemoryResourceStore::new()),
//!     InjectorConfig::default(),
//! );
//! if let Response::Patched { pod } = injector.handle(&AdmissionRequest::for_pod(&pod)?).await {
//!     println!("{} containers", pod.spec.containers.len());
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod registry;

pub use error::{Error, Result};
