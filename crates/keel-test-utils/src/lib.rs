//! Shared test utilities for keel integration tests.
//!
//! This crate provides:
//! - [`Harness`]: In-memory stores, remote servers and engines wired together
//! - Factory functions for creating records
//! - Custom assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_test_utils::{Harness, TEST_NAMESPACE, drive, entity, kind};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let h = Harness::with_topology().await;
//!     h.kinds.create(kind(TEST_NAMESPACE, "switch")).await.unwrap();
//!     let key = h.entities.create(entity(TEST_NAMESPACE, "leaf-1", "switch")).await.unwrap().key();
//!     let outcomes = drive(&h.entity_engine(), &key).await;
//!     // ... assert ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod harness;

pub use assertions::*;
pub use fixtures::*;
pub use harness::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("keel=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
