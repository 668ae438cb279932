//! Remote backend contracts.
//!
//! The engine talks to two kinds of backend:
//!
//! - the **topology service**, a keyed object store reached through
//!   [`TopoClient`] (get, create, update, delete by object id)
//! - **registry replicas**, reached through [`RegistryClient`], which accept
//!   plugin artifacts over a client-streaming upload ([`FrameSink`])
//!
//! Clients come from a [`Connector`]. Handles are reusable and safe to share
//! across concurrent reconciles; [`PooledConnector`] caches one per address.
//! Every call goes through [`call`], which bounds it with the configured
//! request timeout and classifies failures.

pub mod memory;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use keel_core::ErrorClass;

use crate::error::{Error, Result};

/// Status code returned by a remote backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    /// The object does not exist.
    NotFound,
    /// The object already exists.
    AlreadyExists,
    /// A concurrent change won.
    Aborted,
    /// The backend state does not allow the operation.
    FailedPrecondition,
    /// The request is malformed.
    InvalidArgument,
    /// The backend is not serving.
    Unavailable,
    /// The backend did not answer in time.
    DeadlineExceeded,
    /// The backend failed internally.
    Internal,
}

impl Code {
    /// Classifies this code.
    #[must_use]
    pub const fn class(self) -> ErrorClass {
        match self {
            Self::NotFound => ErrorClass::NotFound,
            Self::AlreadyExists => ErrorClass::AlreadyExists,
            Self::Aborted | Self::FailedPrecondition => ErrorClass::Conflict,
            Self::InvalidArgument => ErrorClass::Invalid,
            Self::Unavailable | Self::DeadlineExceeded | Self::Internal => ErrorClass::Unavailable,
        }
    }
}

/// Error returned by a remote backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct RemoteError {
    /// Status code.
    pub code: Code,
    /// Backend-provided detail.
    pub message: String,
}

impl RemoteError {
    /// Creates a remote error.
    #[must_use]
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Result of a remote call.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Kind of object held by the topology service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopoObjectType {
    /// A kind definition.
    Kind,
    /// An entity.
    Entity,
    /// A relation between two entities.
    Relation,
}

/// An object as held by the topology service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopoObject {
    /// Remote identity.
    pub id: String,
    /// Object type.
    pub object_type: TopoObjectType,
    /// Remote id of the object's kind (entities and relations).
    pub kind_id: Option<String>,
    /// Remote id of the source entity (relations).
    pub source_id: Option<String>,
    /// Remote id of the target entity (relations).
    pub target_id: Option<String>,
    /// Typed properties.
    pub aspects: BTreeMap<String, serde_json::Value>,
}

/// Client of the topology service.
#[async_trait]
pub trait TopoClient: Send + Sync {
    /// Reads an object; `None` when it does not exist.
    async fn get(&self, id: &str) -> RemoteResult<Option<TopoObject>>;

    /// Creates an object. Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, object: &TopoObject) -> RemoteResult<()>;

    /// Replaces an object. Fails with `NotFound` if it does not exist.
    async fn update(&self, object: &TopoObject) -> RemoteResult<()>;

    /// Deletes an object. Fails with `NotFound` if it does not exist.
    async fn delete(&self, id: &str) -> RemoteResult<()>;
}

/// One bounded piece of an artifact upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Destination filename on the replica.
    pub target_filename: String,
    /// Payload, at most the negotiated chunk size.
    pub content: Bytes,
}

/// Acknowledgement returned when an upload is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Committed filename.
    pub filename: String,
    /// Committed size in bytes.
    pub size: u64,
}

/// Metadata of an artifact held by a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    /// Filename.
    pub filename: String,
    /// Size in bytes.
    pub size: u64,
}

/// Sending half of one client-streaming upload.
///
/// Nothing is committed until [`FrameSink::close_and_recv`] succeeds.
/// Dropping the sink abandons the upload.
#[async_trait]
pub trait FrameSink: Send {
    /// Sends one frame.
    async fn send(&mut self, frame: Frame) -> RemoteResult<()>;

    /// Closes the stream and waits for the commit acknowledgement.
    async fn close_and_recv(self: Box<Self>) -> RemoteResult<Ack>;
}

/// Client of a registry replica.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Opens an upload stream.
    async fn upload(&self) -> RemoteResult<Box<dyn FrameSink>>;

    /// Removes an artifact. Fails with `NotFound` if absent.
    async fn delete_artifact(&self, filename: &str) -> RemoteResult<()>;

    /// Reads artifact metadata; `None` when absent.
    async fn query(&self, filename: &str) -> RemoteResult<Option<ArtifactInfo>>;
}

/// Produces client handles for endpoint addresses.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Returns a topology client for `address`.
    async fn topo(&self, address: &str) -> Result<Arc<dyn TopoClient>>;

    /// Returns a registry client for `address`.
    async fn registry(&self, address: &str) -> Result<Arc<dyn RegistryClient>>;
}

/// Converts a lock poison error to an engine error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::unavailable("connection pool lock poisoned")
}

/// Connector that caches one handle per address.
///
/// Handles are never evicted; a backend that moves shows up under a new
/// address.
pub struct PooledConnector<C> {
    inner: C,
    topo: RwLock<HashMap<String, Arc<dyn TopoClient>>>,
    registry: RwLock<HashMap<String, Arc<dyn RegistryClient>>>,
}

impl<C> fmt::Debug for PooledConnector<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnector").finish_non_exhaustive()
    }
}

impl<C: Connector> PooledConnector<C> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            topo: RwLock::new(HashMap::new()),
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the number of cached handles.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn cached(&self) -> Result<usize> {
        Ok(self.topo.read().map_err(poison_err)?.len()
            + self.registry.read().map_err(poison_err)?.len())
    }
}

#[async_trait]
impl<C: Connector> Connector for PooledConnector<C> {
    async fn topo(&self, address: &str) -> Result<Arc<dyn TopoClient>> {
        if let Some(client) = self.topo.read().map_err(poison_err)?.get(address) {
            return Ok(Arc::clone(client));
        }
        let client = self.inner.topo(address).await?;
        let mut cache = self.topo.write().map_err(poison_err)?;
        Ok(Arc::clone(cache.entry(address.to_string()).or_insert(client)))
    }

    async fn registry(&self, address: &str) -> Result<Arc<dyn RegistryClient>> {
        if let Some(client) = self.registry.read().map_err(poison_err)?.get(address) {
            return Ok(Arc::clone(client));
        }
        let client = self.inner.registry(address).await?;
        let mut cache = self.registry.write().map_err(poison_err)?;
        Ok(Arc::clone(cache.entry(address.to_string()).or_insert(client)))
    }
}

/// Runs one remote call under `timeout`.
///
/// # Errors
///
/// Returns [`Error::Timeout`] when the deadline passes and [`Error::Remote`]
/// when the backend answers with an error.
pub async fn call<T, F>(operation: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = RemoteResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(Error::Remote { operation, source }),
        Err(_) => Err(Error::Timeout {
            operation,
            after: timeout,
        }),
    }
}
