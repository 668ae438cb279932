//! Topology strategy: one record, one remote object.
//!
//! `Kind`, `Entity` and `Relation` records share [`TopoStrategy`]; what differs
//! per kind is captured by [`TopoMapping`]. The topology service is found
//! through the locator as the single service role in the record's namespace.
//!
//! Remote identity is the record name or its `spec.uri`, per
//! [`IdentityField`]. Kinds have no URI and are always identified by name.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use keel_core::api::topo::{Entity, Kind, ObjectRef, Relation, TopoStatus};
use keel_core::id::RecordKey;
use keel_core::locator::{RoleSelector, TargetLocator};
use keel_core::record::{ObjectMeta, OwnerReference, Record, ResourceKind};
use keel_core::store::ResourceStore;

use super::{Applied, Mode, Strategy};
use crate::config::IdentityField;
use crate::error::{Error, Result};
use crate::remote::{Connector, TopoClient, TopoObject, TopoObjectType, call};

/// Maps a topology record kind onto a remote object.
pub trait TopoMapping: ResourceKind<Status = TopoStatus> + Sized {
    /// Remote object type.
    const OBJECT_TYPE: TopoObjectType;
    /// Controller name.
    const CONTROLLER: &'static str;

    /// Remote identity of a record.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` when the identity field is empty.
    fn remote_id(record: &Record<Self>, identity: IdentityField) -> Result<String>;

    /// Full desired remote object.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` when any referenced identity is empty.
    fn to_object(record: &Record<Self>, identity: IdentityField) -> Result<TopoObject>;

    /// Name of the kind record owning this record, if the kind has one.
    fn kind_name(spec: &Self::Spec) -> Option<&str>;
}

fn uri_identity(uri: Option<&str>, what: &str) -> Result<String> {
    match uri.map(str::trim) {
        Some(uri) if !uri.is_empty() => Ok(uri.to_string()),
        _ => Err(Error::invalid(
            "EmptyUri",
            format!("{what} has no uri and the remote identity field is uri"),
        )),
    }
}

fn record_identity(name: &str, uri: Option<&str>, identity: IdentityField) -> Result<String> {
    match identity {
        IdentityField::Name => Ok(name.to_string()),
        IdentityField::Uri => uri_identity(uri, name),
    }
}

fn reference_identity(reference: &ObjectRef, identity: IdentityField) -> Result<String> {
    if reference.name.trim().is_empty() && identity == IdentityField::Name {
        return Err(Error::invalid("EmptyReference", "reference has no name"));
    }
    record_identity(&reference.name, reference.uri.as_deref(), identity)
}

fn kind_identity(reference: &ObjectRef) -> Result<String> {
    let name = reference.name.trim();
    if name.is_empty() {
        return Err(Error::invalid("EmptyKind", "spec.kind.name is empty"));
    }
    Ok(name.to_string())
}

impl TopoMapping for Kind {
    const OBJECT_TYPE: TopoObjectType = TopoObjectType::Kind;
    const CONTROLLER: &'static str = "kind";

    fn remote_id(record: &Record<Self>, _identity: IdentityField) -> Result<String> {
        Ok(record.meta.name.clone())
    }

    fn to_object(record: &Record<Self>, identity: IdentityField) -> Result<TopoObject> {
        Ok(TopoObject {
            id: Self::remote_id(record, identity)?,
            object_type: Self::OBJECT_TYPE,
            kind_id: None,
            source_id: None,
            target_id: None,
            aspects: record.spec.aspects.clone(),
        })
    }

    fn kind_name(_spec: &Self::Spec) -> Option<&str> {
        None
    }
}

impl TopoMapping for Entity {
    const OBJECT_TYPE: TopoObjectType = TopoObjectType::Entity;
    const CONTROLLER: &'static str = "entity";

    fn remote_id(record: &Record<Self>, identity: IdentityField) -> Result<String> {
        record_identity(&record.meta.name, record.spec.uri.as_deref(), identity)
    }

    fn to_object(record: &Record<Self>, identity: IdentityField) -> Result<TopoObject> {
        Ok(TopoObject {
            id: Self::remote_id(record, identity)?,
            object_type: Self::OBJECT_TYPE,
            kind_id: Some(kind_identity(&record.spec.kind)?),
            source_id: None,
            target_id: None,
            aspects: record.spec.aspects.clone(),
        })
    }

    fn kind_name(spec: &Self::Spec) -> Option<&str> {
        Some(spec.kind.name.as_str())
    }
}

impl TopoMapping for Relation {
    const OBJECT_TYPE: TopoObjectType = TopoObjectType::Relation;
    const CONTROLLER: &'static str = "relation";

    fn remote_id(record: &Record<Self>, identity: IdentityField) -> Result<String> {
        record_identity(&record.meta.name, record.spec.uri.as_deref(), identity)
    }

    fn to_object(record: &Record<Self>, identity: IdentityField) -> Result<TopoObject> {
        Ok(TopoObject {
            id: Self::remote_id(record, identity)?,
            object_type: Self::OBJECT_TYPE,
            kind_id: Some(kind_identity(&record.spec.kind)?),
            source_id: Some(reference_identity(&record.spec.source, identity)?),
            target_id: Some(reference_identity(&record.spec.target, identity)?),
            aspects: record.spec.aspects.clone(),
        })
    }

    fn kind_name(spec: &Self::Spec) -> Option<&str> {
        Some(spec.kind.name.as_str())
    }
}

/// Next move for a topology record.
#[derive(Debug, Clone, PartialEq)]
pub enum TopoAction {
    /// Create the remote object.
    Create(TopoObject),
    /// Replace the remote object.
    Update(TopoObject),
    /// Delete the remote object by id.
    Delete(String),
}

/// Remote state read for a topology record.
pub struct TopoObserved {
    client: Arc<dyn TopoClient>,
    current: Option<TopoObject>,
}

/// Strategy for topology records.
pub struct TopoStrategy<K> {
    kinds: Arc<dyn ResourceStore<Kind>>,
    locator: Arc<dyn TargetLocator>,
    connector: Arc<dyn Connector>,
    role: RoleSelector,
    identity: IdentityField,
    timeout: Duration,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K> std::fmt::Debug for TopoStrategy<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopoStrategy")
            .field("role", &self.role)
            .field("identity", &self.identity)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<K: TopoMapping> TopoStrategy<K> {
    /// Creates a strategy that talks to the service selected by `role`.
    #[must_use]
    pub fn new(
        kinds: Arc<dyn ResourceStore<Kind>>,
        locator: Arc<dyn TargetLocator>,
        connector: Arc<dyn Connector>,
        role: RoleSelector,
        identity: IdentityField,
        timeout: Duration,
    ) -> Self {
        Self {
            kinds,
            locator,
            connector,
            role,
            identity,
            timeout,
            _kind: std::marker::PhantomData,
        }
    }

    async fn client(&self, scope: &str) -> Result<Arc<dyn TopoClient>> {
        let endpoints = self.locator.resolve(scope, &self.role).await?;
        let endpoint = endpoints
            .into_iter()
            .find(|e| e.reachable)
            .ok_or_else(|| Error::unavailable(format!("no topology service in {scope}")))?;
        self.connector.topo(&endpoint.address).await
    }
}

#[async_trait]
impl<K: TopoMapping> Strategy<K> for TopoStrategy<K> {
    type Observed = TopoObserved;
    type Action = TopoAction;

    fn name(&self) -> &'static str {
        K::CONTROLLER
    }

    async fn prepare(&self, record: &Record<K>) -> Result<Option<ObjectMeta>> {
        let Some(kind_name) = K::kind_name(&record.spec) else {
            return Ok(None);
        };
        if kind_name.is_empty() {
            return Ok(None);
        }
        let key = RecordKey::new(&record.meta.namespace, kind_name);
        let Some(kind) = self.kinds.get(&key).await? else {
            return Ok(None);
        };
        let Some(uid) = kind.meta.uid else {
            return Ok(None);
        };
        if record.meta.is_owned_by(uid) {
            return Ok(None);
        }
        let mut meta = record.meta.clone();
        meta.owner_references.push(OwnerReference {
            kind: Kind::KIND.to_string(),
            name: kind.meta.name.clone(),
            uid,
        });
        Ok(Some(meta))
    }

    async fn observe(&self, record: &Record<K>, mode: Mode) -> Result<TopoObserved> {
        let id = K::remote_id(record, self.identity)?;
        let client = self.client(&record.meta.namespace).await?;
        let current = match mode {
            Mode::Converge => call("topo.get", self.timeout, client.get(&id)).await?,
            Mode::Teardown => None,
        };
        Ok(TopoObserved { client, current })
    }

    fn diff(
        &self,
        record: &Record<K>,
        observed: &TopoObserved,
        mode: Mode,
    ) -> Result<Option<TopoAction>> {
        if mode == Mode::Teardown {
            return Ok(Some(TopoAction::Delete(K::remote_id(record, self.identity)?)));
        }
        let desired = K::to_object(record, self.identity)?;
        Ok(match &observed.current {
            None => Some(TopoAction::Create(desired)),
            Some(current) if *current != desired => Some(TopoAction::Update(desired)),
            Some(_) => None,
        })
    }

    async fn apply(
        &self,
        _record: &Record<K>,
        observed: &TopoObserved,
        action: TopoAction,
    ) -> Result<Applied<TopoStatus>> {
        let client = &observed.client;
        let effect = match action {
            TopoAction::Create(object) => {
                match call("topo.create", self.timeout, client.create(&object)).await {
                    Ok(()) => tracing::info!(id = %object.id, "created remote object"),
                    Err(err) if err.is_already_exists() => {
                        tracing::debug!(id = %object.id, "remote object already exists");
                    }
                    Err(err) => return Err(err),
                }
                "remote_create"
            }
            TopoAction::Update(object) => {
                call("topo.update", self.timeout, client.update(&object)).await?;
                tracing::info!(id = %object.id, "updated remote object");
                "remote_update"
            }
            TopoAction::Delete(id) => {
                match call("topo.delete", self.timeout, client.delete(&id)).await {
                    Ok(()) => tracing::info!(%id, "deleted remote object"),
                    Err(err) if err.is_not_found() => {
                        tracing::debug!(%id, "remote object already gone");
                    }
                    Err(err) => return Err(err),
                }
                "remote_delete"
            }
        };
        Ok(Applied {
            status: None,
            more: false,
            effect,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::api::topo::{EntitySpec, RelationSpec};

    fn relation(uri: Option<&str>, target_uri: Option<&str>) -> Record<Relation> {
        Record::new(
            "net",
            "leaf-1-spine-1",
            RelationSpec {
                uri: uri.map(str::to_string),
                kind: ObjectRef::named("link"),
                source: ObjectRef {
                    name: "leaf-1".into(),
                    uri: Some("leaf:1".into()),
                },
                target: ObjectRef {
                    name: "spine-1".into(),
                    uri: target_uri.map(str::to_string),
                },
                aspects: Default::default(),
            },
        )
    }

    #[test]
    fn name_identity_uses_record_and_reference_names() {
        let object = Relation::to_object(&relation(None, None), IdentityField::Name).unwrap();
        assert_eq!(object.id, "leaf-1-spine-1");
        assert_eq!(object.kind_id.as_deref(), Some("link"));
        assert_eq!(object.source_id.as_deref(), Some("leaf-1"));
        assert_eq!(object.target_id.as_deref(), Some("spine-1"));
    }

    #[test]
    fn uri_identity_requires_every_uri() {
        let ok = Relation::to_object(&relation(Some("link:1"), Some("spine:1")), IdentityField::Uri)
            .unwrap();
        assert_eq!(ok.id, "link:1");
        assert_eq!(ok.source_id.as_deref(), Some("leaf:1"));

        let err = Relation::to_object(&relation(Some("link:1"), None), IdentityField::Uri)
            .unwrap_err();
        assert!(err.is_invalid());
        let err = Relation::to_object(&relation(Some("  "), Some("spine:1")), IdentityField::Uri)
            .unwrap_err();
        assert!(err.is_invalid());
    }

    #[test]
    fn entity_without_kind_is_invalid() {
        let record = Record::<Entity>::new("net", "leaf-1", EntitySpec::default());
        assert!(Entity::to_object(&record, IdentityField::Name).unwrap_err().is_invalid());
        assert_eq!(Entity::remote_id(&record, IdentityField::Name).unwrap(), "leaf-1");
    }

    #[test]
    fn kinds_are_identified_by_name_in_every_mode() {
        let record = Record::<Kind>::new("net", "switch", Default::default());
        assert_eq!(Kind::remote_id(&record, IdentityField::Uri).unwrap(), "switch");
    }
}
