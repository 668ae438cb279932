//! Record kinds understood by keel controllers.
//!
//! - [`topo`]: topology objects mirrored one-to-one into the topology service
//! - [`config`]: configuration models fanned out to registry replicas
//! - [`workload`]: scopes, services and pods used for discovery

pub mod config;
pub mod topo;
pub mod workload;
