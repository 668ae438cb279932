//! In-memory remote backends.
//!
//! [`InMemoryTopoServer`] and [`InMemoryRegistryServer`] implement the client
//! traits directly, and [`InMemoryConnector`] hands them out by address. They
//! back tests and the operator's local simulation mode.
//!
//! ## Limitations
//!
//! - **NOT a network transport**: calls never leave the process
//! - **Failure injection is FIFO**: queued failures fire on the next matching
//!   call, in order

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    Ack, ArtifactInfo, Code, Connector, Frame, FrameSink, RegistryClient, RemoteError,
    RemoteResult, TopoClient, TopoObject,
};
use crate::error::{Error, Result};
use crate::transfer::{MAX_FRAME_PAYLOAD, Reassembler};

fn poison_remote<T>(_: PoisonError<T>) -> RemoteError {
    RemoteError::new(Code::Internal, "lock poisoned")
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::unavailable("lock poisoned")
}

/// Queued failures keyed by operation name.
#[derive(Debug, Default)]
struct FailureQueue {
    pending: HashMap<&'static str, VecDeque<Code>>,
}

impl FailureQueue {
    fn push(&mut self, operation: &'static str, code: Code) {
        self.pending.entry(operation).or_default().push_back(code);
    }

    fn take(&mut self, operation: &'static str) -> Option<RemoteError> {
        let code = self.pending.get_mut(operation)?.pop_front()?;
        Some(RemoteError::new(code, format!("injected failure on {operation}")))
    }
}

#[derive(Debug, Default)]
struct TopoState {
    objects: BTreeMap<String, TopoObject>,
    calls: HashMap<&'static str, usize>,
    failures: FailureQueue,
}

impl TopoState {
    fn enter(&mut self, operation: &'static str) -> RemoteResult<()> {
        *self.calls.entry(operation).or_default() += 1;
        self.failures.take(operation).map_or(Ok(()), Err)
    }
}

/// In-memory topology service.
///
/// Operation names for call counting and failure injection are `get`,
/// `create`, `update` and `delete`.
#[derive(Debug, Default)]
pub struct InMemoryTopoServer {
    state: RwLock<TopoState>,
}

impl InMemoryTopoServer {
    /// Creates an empty server.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call to `operation` fail with `code`.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn fail_next(&self, operation: &'static str, code: Code) -> Result<()> {
        self.state
            .write()
            .map_err(poison_err)?
            .failures
            .push(operation, code);
        Ok(())
    }

    /// Returns how many times `operation` was called.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn calls(&self, operation: &str) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.calls.get(operation).copied().unwrap_or_default())
    }

    /// Returns the number of mutating calls (create, update, delete).
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn mutations(&self) -> Result<usize> {
        Ok(self.calls("create")? + self.calls("update")? + self.calls("delete")?)
    }

    /// Returns a stored object.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn object(&self, id: &str) -> Result<Option<TopoObject>> {
        Ok(self.state.read().map_err(poison_err)?.objects.get(id).cloned())
    }

    /// Returns every stored object id.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn ids(&self) -> Result<Vec<String>> {
        Ok(self
            .state
            .read()
            .map_err(poison_err)?
            .objects
            .keys()
            .cloned()
            .collect())
    }

    /// Removes an object out of band, as an operator would by hand.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn remove_out_of_band(&self, id: &str) -> Result<Option<TopoObject>> {
        Ok(self.state.write().map_err(poison_err)?.objects.remove(id))
    }
}

#[async_trait]
impl TopoClient for InMemoryTopoServer {
    async fn get(&self, id: &str) -> RemoteResult<Option<TopoObject>> {
        let mut state = self.state.write().map_err(poison_remote)?;
        state.enter("get")?;
        Ok(state.objects.get(id).cloned())
    }

    async fn create(&self, object: &TopoObject) -> RemoteResult<()> {
        let mut state = self.state.write().map_err(poison_remote)?;
        state.enter("create")?;
        if state.objects.contains_key(&object.id) {
            return Err(RemoteError::new(
                Code::AlreadyExists,
                format!("object {} already exists", object.id),
            ));
        }
        state.objects.insert(object.id.clone(), object.clone());
        Ok(())
    }

    async fn update(&self, object: &TopoObject) -> RemoteResult<()> {
        let mut state = self.state.write().map_err(poison_remote)?;
        state.enter("update")?;
        match state.objects.get_mut(&object.id) {
            Some(existing) => {
                *existing = object.clone();
                Ok(())
            }
            None => Err(RemoteError::new(
                Code::NotFound,
                format!("object {} not found", object.id),
            )),
        }
    }

    async fn delete(&self, id: &str) -> RemoteResult<()> {
        let mut state = self.state.write().map_err(poison_remote)?;
        state.enter("delete")?;
        state
            .objects
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::new(Code::NotFound, format!("object {id} not found")))
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    artifacts: BTreeMap<String, Bytes>,
    calls: HashMap<&'static str, usize>,
    failures: FailureQueue,
    frames_received: usize,
    fail_at_frame: Option<(usize, Code)>,
}

impl RegistryState {
    fn enter(&mut self, operation: &'static str) -> RemoteResult<()> {
        *self.calls.entry(operation).or_default() += 1;
        self.failures.take(operation).map_or(Ok(()), Err)
    }
}

/// In-memory registry replica.
///
/// Operation names are `upload`, `commit`, `delete_artifact` and `query`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistryServer {
    state: Arc<RwLock<RegistryState>>,
}

impl InMemoryRegistryServer {
    /// Creates an empty replica.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call to `operation` fail with `code`.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn fail_next(&self, operation: &'static str, code: Code) -> Result<()> {
        self.state
            .write()
            .map_err(poison_err)?
            .failures
            .push(operation, code);
        Ok(())
    }

    /// Makes the `index`th frame (zero-based) of the next upload fail.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn fail_at_frame(&self, index: usize, code: Code) -> Result<()> {
        self.state.write().map_err(poison_err)?.fail_at_frame = Some((index, code));
        Ok(())
    }

    /// Returns how many times `operation` was called.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn calls(&self, operation: &str) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.calls.get(operation).copied().unwrap_or_default())
    }

    /// Returns the total number of frames received across uploads.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn frames_received(&self) -> Result<usize> {
        Ok(self.state.read().map_err(poison_err)?.frames_received)
    }

    /// Returns a committed artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn artifact(&self, filename: &str) -> Result<Option<Bytes>> {
        Ok(self
            .state
            .read()
            .map_err(poison_err)?
            .artifacts
            .get(filename)
            .cloned())
    }

    /// Returns every committed filename.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn filenames(&self) -> Result<Vec<String>> {
        Ok(self
            .state
            .read()
            .map_err(poison_err)?
            .artifacts
            .keys()
            .cloned()
            .collect())
    }
}

/// Receiving end of one in-memory upload.
struct MemorySink {
    state: Arc<RwLock<RegistryState>>,
    reassembler: Reassembler,
    sent: usize,
    fail_at_frame: Option<(usize, Code)>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> RemoteResult<()> {
        let index = self.sent;
        self.sent += 1;
        self.state.write().map_err(poison_remote)?.frames_received += 1;
        if let Some((fail_index, code)) = self.fail_at_frame {
            if fail_index == index {
                return Err(RemoteError::new(code, format!("injected failure at frame {index}")));
            }
        }
        self.reassembler.push(frame)
    }

    async fn close_and_recv(self: Box<Self>) -> RemoteResult<Ack> {
        let (filename, content) = self.reassembler.finish()?;
        let mut state = self.state.write().map_err(poison_remote)?;
        state.enter("commit")?;
        let size = content.len() as u64;
        state.artifacts.insert(filename.clone(), content);
        Ok(Ack { filename, size })
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistryServer {
    async fn upload(&self) -> RemoteResult<Box<dyn FrameSink>> {
        let fail_at_frame = {
            let mut state = self.state.write().map_err(poison_remote)?;
            state.enter("upload")?;
            state.fail_at_frame.take()
        };
        Ok(Box::new(MemorySink {
            state: Arc::clone(&self.state),
            reassembler: Reassembler::new(MAX_FRAME_PAYLOAD),
            sent: 0,
            fail_at_frame,
        }))
    }

    async fn delete_artifact(&self, filename: &str) -> RemoteResult<()> {
        let mut state = self.state.write().map_err(poison_remote)?;
        state.enter("delete_artifact")?;
        state
            .artifacts
            .remove(filename)
            .map(|_| ())
            .ok_or_else(|| RemoteError::new(Code::NotFound, format!("{filename} not installed")))
    }

    async fn query(&self, filename: &str) -> RemoteResult<Option<ArtifactInfo>> {
        let mut state = self.state.write().map_err(poison_remote)?;
        state.enter("query")?;
        Ok(state.artifacts.get(filename).map(|content| ArtifactInfo {
            filename: filename.to_string(),
            size: content.len() as u64,
        }))
    }
}

/// Connector that resolves addresses to in-memory servers.
#[derive(Debug, Default)]
pub struct InMemoryConnector {
    topo: RwLock<HashMap<String, Arc<InMemoryTopoServer>>>,
    registry: RwLock<HashMap<String, InMemoryRegistryServer>>,
}

impl InMemoryConnector {
    /// Creates a connector with no registered servers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `server` at `address`.
    pub fn register_topo(&self, address: impl Into<String>, server: Arc<InMemoryTopoServer>) {
        self.topo
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.into(), server);
    }

    /// Serves `server` at `address`.
    pub fn register_registry(&self, address: impl Into<String>, server: InMemoryRegistryServer) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.into(), server);
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn topo(&self, address: &str) -> Result<Arc<dyn TopoClient>> {
        let servers = self.topo.read().map_err(poison_err)?;
        let server = servers
            .get(address)
            .ok_or_else(|| Error::unavailable(format!("connection refused: {address}")))?;
        Ok(Arc::clone(server) as Arc<dyn TopoClient>)
    }

    async fn registry(&self, address: &str) -> Result<Arc<dyn RegistryClient>> {
        let servers = self.registry.read().map_err(poison_err)?;
        let server = servers
            .get(address)
            .ok_or_else(|| Error::unavailable(format!("connection refused: {address}")))?;
        Ok(Arc::new(server.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::TopoObjectType;

    fn object(id: &str) -> TopoObject {
        TopoObject {
            id: id.into(),
            object_type: TopoObjectType::Kind,
            kind_id: None,
            source_id: None,
            target_id: None,
            aspects: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn topo_server_enforces_existence_rules() {
        let server = InMemoryTopoServer::new();
        server.create(&object("switch")).await.unwrap();
        let err = server.create(&object("switch")).await.unwrap_err();
        assert_eq!(err.code, Code::AlreadyExists);
        let err = server.update(&object("router")).await.unwrap_err();
        assert_eq!(err.code, Code::NotFound);
        server.delete("switch").await.unwrap();
        let err = server.delete("switch").await.unwrap_err();
        assert_eq!(err.code, Code::NotFound);
        assert_eq!(server.mutations().unwrap(), 4);
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let server = InMemoryTopoServer::new();
        server.fail_next("get", Code::Unavailable).unwrap();
        assert!(server.get("switch").await.is_err());
        assert!(server.get("switch").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn registry_commits_only_on_close() {
        let server = InMemoryRegistryServer::new();
        let mut sink = server.upload().await.unwrap();
        sink.send(Frame {
            target_filename: "devicesim-1.0.0.so".into(),
            content: Bytes::from_static(b"abc"),
        })
        .await
        .unwrap();
        assert!(server.artifact("devicesim-1.0.0.so").unwrap().is_none());
        let ack = sink.close_and_recv().await.unwrap();
        assert_eq!(ack.size, 3);
        assert_eq!(
            server.artifact("devicesim-1.0.0.so").unwrap().unwrap(),
            Bytes::from_static(b"abc")
        );
    }
}
