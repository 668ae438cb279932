//! Compiled plugin artifacts.
//!
//! Artifacts are produced outside the engine and are immutable once produced:
//! different content means a different [`ArtifactKey`]. The engine only reads
//! them through an [`ArtifactCache`].

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use keel_core::api::config::PluginSpec;

use crate::error::{Error, Result};

/// Identity of a compiled artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    /// Plugin name, lowercase.
    pub name: String,
    /// Plugin version.
    pub version: String,
}

impl ArtifactKey {
    /// Creates a key.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Derives the key of a model's plugin.
    #[must_use]
    pub fn for_plugin(plugin: &PluginSpec) -> Self {
        Self::new(plugin.type_.to_ascii_lowercase(), &plugin.version)
    }

    /// Destination filename on a registry replica.
    #[must_use]
    pub fn filename(&self) -> String {
        format!("{}-{}.so", self.name, self.version)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Read access to compiled artifacts.
#[async_trait]
pub trait ArtifactCache: Send + Sync {
    /// Returns the artifact bytes, or `None` if it has not been produced yet.
    async fn get(&self, key: &ArtifactKey) -> Result<Option<Bytes>>;
}

/// Artifact cache held in memory.
#[derive(Debug, Default)]
pub struct InMemoryArtifactCache {
    artifacts: RwLock<HashMap<ArtifactKey, Bytes>>,
}

impl InMemoryArtifactCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an artifact.
    pub fn insert(&self, key: ArtifactKey, content: impl Into<Bytes>) {
        self.artifacts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, content.into());
    }
}

#[async_trait]
impl ArtifactCache for InMemoryArtifactCache {
    async fn get(&self, key: &ArtifactKey) -> Result<Option<Bytes>> {
        let artifacts = self
            .artifacts
            .read()
            .map_err(|_| Error::unavailable("artifact cache lock poisoned"))?;
        Ok(artifacts.get(key).cloned())
    }
}

/// Artifact cache backed by a directory of `<name>-<version>.so` files.
#[derive(Debug, Clone)]
pub struct FsArtifactCache {
    root: PathBuf,
}

impl FsArtifactCache {
    /// Creates a cache rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the path an artifact is read from.
    #[must_use]
    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.root.join(key.filename())
    }
}

#[async_trait]
impl ArtifactCache for FsArtifactCache {
    async fn get(&self, key: &ArtifactKey) -> Result<Option<Bytes>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(content) => Ok(Some(Bytes::from(content))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(Error::Io {
                message: format!("failed to read {}", path.display()),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_key_is_lowercase_with_so_suffix() {
        let key = ArtifactKey::for_plugin(&PluginSpec {
            type_: "DeviceSim".into(),
            version: "1.0.0".into(),
        });
        assert_eq!(key.filename(), "devicesim-1.0.0.so");
        assert_eq!(key.to_string(), "devicesim@1.0.0");
    }

    #[tokio::test]
    async fn fs_cache_reads_files_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsArtifactCache::new(dir.path());
        let key = ArtifactKey::new("stratum", "2.0.1");
        assert!(cache.get(&key).await.unwrap().is_none());

        std::fs::write(cache.path_for(&key), b"plugin").unwrap();
        assert_eq!(
            cache.get(&key).await.unwrap().unwrap(),
            Bytes::from_static(b"plugin")
        );
    }

    #[tokio::test]
    async fn memory_cache_round_trip() {
        let cache = InMemoryArtifactCache::new();
        let key = ArtifactKey::new("devicesim", "1.0.0");
        cache.insert(key.clone(), vec![1, 2, 3]);
        assert_eq!(cache.get(&key).await.unwrap().unwrap().len(), 3);
    }
}
