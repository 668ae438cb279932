//! Injector configuration.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `KEEL_COMPILER_IMAGE` | `keel/config-model-compiler` | Repository of the plugin compiler image |
//! | `KEEL_REGISTRY_IMAGE` | `keel/config-model-registry` | Repository of the registry sidecar image |

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Images the injector adds to workloads.
///
/// The tag is derived per workload from its plugin annotations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectorConfig {
    /// Repository of the plugin compiler init container.
    pub compiler_image: String,
    /// Repository of the registry sidecar.
    pub registry_image: String,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            compiler_image: "keel/config-model-compiler".to_string(),
            registry_image: "keel/config-model-registry".to_string(),
        }
    }
}

impl InjectorConfig {
    /// Loads configuration from `KEEL_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when an image reference already carries a tag.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`InjectorConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let read = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        if let Some(image) = read("KEEL_COMPILER_IMAGE") {
            config.compiler_image = image;
        }
        if let Some(image) = read("KEEL_REGISTRY_IMAGE") {
            config.registry_image = image;
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks that both images are untagged repositories.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        for (name, image) in [
            ("KEEL_COMPILER_IMAGE", &self.compiler_image),
            ("KEEL_REGISTRY_IMAGE", &self.registry_image),
        ] {
            let last = image.rsplit('/').next().unwrap_or_default();
            if last.is_empty() || last.contains(':') || last.contains('@') {
                return Err(Error::Config(format!(
                    "{name} must be an untagged repository, got '{image}'"
                )));
            }
        }
        Ok(())
    }
}
