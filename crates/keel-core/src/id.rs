//! Identifiers for records and remote targets.
//!
//! - [`RecordKey`] is the `(namespace, name)` identity of a record. It is what
//!   the work queue carries and what every reconcile starts from.
//! - [`RecordUid`] is a ULID assigned by the store on create, so a record that
//!   is deleted and recreated under the same key is distinguishable.
//! - [`TargetId`] names one remote target (a replica) in fan-out status.
//!
//! # Example
//!
//! ```rust
//! use keel_core::id::RecordKey;
//!
//! let key: RecordKey = "network/leaf-1".parse().unwrap();
//! assert_eq!(key.namespace, "network");
//! assert_eq!(key.name, "leaf-1");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// The `(namespace, name)` identity of a record.
///
/// Ordering is namespace first, then name, which keeps list results stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    /// Scope the record lives in.
    pub namespace: String,
    /// Name, unique within the namespace.
    pub name: String,
}

impl RecordKey {
    /// Creates a key from its parts.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for RecordKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(Error::Invalid(format!(
                "record key '{s}' must have the form <namespace>/<name>"
            ))),
        }
    }
}

/// A store-assigned unique identifier for one incarnation of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordUid(Ulid);

impl RecordUid {
    /// Generates a new uid.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for RecordUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a remote target in fan-out status.
///
/// Rendered as `<namespace>/<name>` of the workload replica backing it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    /// Creates a target id from a raw string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&RecordKey> for TargetId {
    fn from(key: &RecordKey) -> Self {
        Self(key.to_string())
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
