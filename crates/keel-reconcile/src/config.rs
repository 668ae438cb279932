//! Engine and controller configuration.
//!
//! Configuration is a plain value passed to constructors; nothing reads the
//! environment after startup. [`Config::from_env`] layers `KEEL_*` variables
//! over the defaults:
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `KEEL_FINALIZER` | `keel.dev/remote-state` | Cleanup token owned by the engine |
//! | `KEEL_IDENTITY_FIELD` | `name` | Remote identity of topology records (`name` or `uri`) |
//! | `KEEL_WORKERS` | `4` | Concurrent reconciles per controller |
//! | `KEEL_REQUEST_TIMEOUT_SECS` | `30` | Bound on every remote call |
//! | `KEEL_RESYNC_SECS` | `300` | Full relist interval, `0` disables |
//! | `KEEL_BACKOFF_BASE_MS` | `100` | First retry delay |
//! | `KEEL_BACKOFF_MAX_SECS` | `60` | Retry delay cap |
//! | `KEEL_CHUNK_SIZE` | `4096` | Artifact frame payload |
//! | `KEEL_CLUSTER_DOMAIN` | `cluster.local` | DNS suffix of services |
//! | `KEEL_TOPO_SERVICE` | `topo` | `app` label of the topology service |
//! | `KEEL_REGISTRY_CAPABILITY` | `registry.config.keel.dev/inject` | Annotation marking registry replicas |
//! | `KEEL_REGISTRY_PORT` | `5151` | Port registry replicas listen on |
//! | `KEEL_WATCH_NAMESPACE` | unset | Restrict controllers to one namespace |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use keel_core::locator::{DEFAULT_CLUSTER_DOMAIN, RoleSelector};

use crate::error::{Error, Result};
use crate::transfer::{MAX_FRAME_PAYLOAD, validate_chunk_size};

/// Which spec field becomes the remote identity of a topology record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityField {
    /// The record name.
    #[default]
    Name,
    /// The record's `spec.uri`.
    Uri,
}

impl FromStr for IdentityField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "name" => Ok(Self::Name),
            "uri" => Ok(Self::Uri),
            other => Err(Error::Config(format!(
                "identity field must be 'name' or 'uri', got '{other}'"
            ))),
        }
    }
}

/// Engine and controller settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Cleanup token the engine adds to records it manages.
    pub finalizer: String,
    /// Remote identity of topology records.
    pub identity_field: IdentityField,
    /// Concurrent reconciles per controller.
    pub workers: usize,
    /// Bound on every remote call.
    pub request_timeout: Duration,
    /// Full relist interval. Zero disables periodic resync.
    pub resync_interval: Duration,
    /// First retry delay.
    pub backoff_base: Duration,
    /// Retry delay cap.
    pub backoff_max: Duration,
    /// Artifact frame payload size.
    pub chunk_size: usize,
    /// DNS suffix of cluster services.
    pub cluster_domain: String,
    /// `app` label of the topology service.
    pub topo_service: String,
    /// Annotation that marks a pod as a registry replica.
    pub registry_capability: String,
    /// Port registry replicas listen on.
    pub registry_port: u16,
    /// Restrict controllers to one namespace.
    pub watch_namespace: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            finalizer: "keel.dev/remote-state".to_string(),
            identity_field: IdentityField::Name,
            workers: 4,
            request_timeout: Duration::from_secs(30),
            resync_interval: Duration::from_secs(300),
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(60),
            chunk_size: MAX_FRAME_PAYLOAD,
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            topo_service: "topo".to_string(),
            registry_capability: "registry.config.keel.dev/inject".to_string(),
            registry_port: 5151,
            watch_namespace: None,
        }
    }
}

impl Config {
    /// Loads configuration from `KEEL_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a variable cannot be parsed or the
    /// result fails [`Config::validate`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`Config::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env(&lookup);
        let mut config = Self::default();

        if let Some(finalizer) = env.string("KEEL_FINALIZER") {
            config.finalizer = finalizer;
        }
        if let Some(field) = env.string("KEEL_IDENTITY_FIELD") {
            config.identity_field = field.parse()?;
        }
        if let Some(workers) = env.usize("KEEL_WORKERS")? {
            config.workers = workers;
        }
        if let Some(secs) = env.u64("KEEL_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env.u64("KEEL_RESYNC_SECS")? {
            config.resync_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = env.u64("KEEL_BACKOFF_BASE_MS")? {
            config.backoff_base = Duration::from_millis(ms);
        }
        if let Some(secs) = env.u64("KEEL_BACKOFF_MAX_SECS")? {
            config.backoff_max = Duration::from_secs(secs);
        }
        if let Some(chunk) = env.usize("KEEL_CHUNK_SIZE")? {
            config.chunk_size = chunk;
        }
        if let Some(domain) = env.string("KEEL_CLUSTER_DOMAIN") {
            config.cluster_domain = domain;
        }
        if let Some(app) = env.string("KEEL_TOPO_SERVICE") {
            config.topo_service = app;
        }
        if let Some(annotation) = env.string("KEEL_REGISTRY_CAPABILITY") {
            config.registry_capability = annotation;
        }
        if let Some(port) = env.u16("KEEL_REGISTRY_PORT")? {
            config.registry_port = port;
        }
        config.watch_namespace = env.string("KEEL_WATCH_NAMESPACE");

        config.validate()?;
        Ok(config)
    }

    /// Selector for the topology service.
    #[must_use]
    pub fn topo_role(&self) -> RoleSelector {
        RoleSelector::service(&self.topo_service)
    }

    /// Selector for model registry replicas.
    #[must_use]
    pub fn registry_role(&self) -> RoleSelector {
        RoleSelector::replicas(&self.registry_capability, self.registry_port)
    }

    /// Checks invariants between settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.finalizer.trim().is_empty() {
            return Err(Error::Config("KEEL_FINALIZER must not be empty".into()));
        }
        if self.workers == 0 {
            return Err(Error::Config("KEEL_WORKERS must be at least 1".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config(
                "KEEL_REQUEST_TIMEOUT_SECS must be at least 1".into(),
            ));
        }
        if self.backoff_base.is_zero() || self.backoff_base > self.backoff_max {
            return Err(Error::Config(
                "KEEL_BACKOFF_BASE_MS must be positive and not exceed KEEL_BACKOFF_MAX_SECS"
                    .into(),
            ));
        }
        validate_chunk_size(self.chunk_size)?;
        Ok(())
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u16(&self, name: &str) -> Result<Option<u16>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u16>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name} must be a u16: {e}")))
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name} must be a u64: {e}")))
    }

    fn usize(&self, name: &str) -> Result<Option<usize>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<usize>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name} must be a usize: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_are_valid() {
        let config = load(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.identity_field, IdentityField::Name);
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("KEEL_IDENTITY_FIELD", "URI"),
            ("KEEL_WORKERS", "8"),
            ("KEEL_REQUEST_TIMEOUT_SECS", "5"),
            ("KEEL_CHUNK_SIZE", "1024"),
            ("KEEL_WATCH_NAMESPACE", " network "),
            ("KEEL_FINALIZER", ""),
        ])
        .unwrap();
        assert_eq!(config.identity_field, IdentityField::Uri);
        assert_eq!(config.workers, 8);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.watch_namespace.as_deref(), Some("network"));
        assert_eq!(config.finalizer, "keel.dev/remote-state");
    }

    #[test]
    fn rejects_bad_values() {
        assert!(load(&[("KEEL_WORKERS", "0")]).is_err());
        assert!(load(&[("KEEL_WORKERS", "many")]).is_err());
        assert!(load(&[("KEEL_CHUNK_SIZE", "8192")]).is_err());
        assert!(load(&[("KEEL_IDENTITY_FIELD", "uid")]).is_err());
        assert!(load(&[("KEEL_BACKOFF_BASE_MS", "0")]).is_err());
    }
}
