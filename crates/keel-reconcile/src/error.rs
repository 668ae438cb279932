//! Error types for the convergence engine.
//!
//! Every variant maps onto an [`ErrorClass`] through [`Error::class`]. The
//! controller uses the class alone to pick a retry policy:
//!
//! | Class | Policy |
//! |-------|--------|
//! | `Conflict` | requeue immediately, re-read state |
//! | `Unavailable` | requeue with backoff |
//! | `Invalid` | write a status condition, do not retry |
//! | `NotFound` / `AlreadyExists` | handled at the call site, otherwise backoff |

use std::time::Duration;

use keel_core::ErrorClass;

use crate::remote::RemoteError;

/// The result type used throughout keel-reconcile.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reconciling.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A remote backend answered with an error.
    #[error("{operation} failed: {source}")]
    Remote {
        /// Remote operation that failed.
        operation: &'static str,
        /// Backend error.
        #[source]
        source: RemoteError,
    },

    /// A remote call did not complete in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Remote operation that timed out.
        operation: &'static str,
        /// Deadline that passed.
        after: Duration,
    },

    /// No endpoint could be reached.
    #[error("unavailable: {message}")]
    Unavailable {
        /// What could not be reached.
        message: String,
    },

    /// The desired state cannot be mapped onto the remote model.
    #[error("invalid desired state ({reason}): {message}")]
    Invalid {
        /// Short machine-readable reason, used as the condition reason.
        reason: &'static str,
        /// Human-readable detail.
        message: String,
    },

    /// A compiled artifact is not in the cache yet.
    #[error("artifact {filename} is not available")]
    ArtifactUnavailable {
        /// Expected artifact filename.
        filename: String,
    },

    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Reading a local artifact failed.
    #[error("artifact I/O error: {message}")]
    Io {
        /// Description of the failure.
        message: String,
        /// The underlying cause.
        #[source]
        source: std::io::Error,
    },

    /// An error from the record store.
    #[error("store error: {0}")]
    Store(#[from] keel_core::Error),
}

impl Error {
    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates an invalid-desired-state error.
    #[must_use]
    pub fn invalid(reason: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            reason,
            message: message.into(),
        }
    }

    /// Classifies this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Remote { source, .. } => source.code.class(),
            Self::Timeout { .. }
            | Self::Unavailable { .. }
            | Self::ArtifactUnavailable { .. }
            | Self::Io { .. } => ErrorClass::Unavailable,
            Self::Invalid { .. } | Self::Config(_) => ErrorClass::Invalid,
            Self::Store(inner) => inner.class(),
        }
    }

    /// Returns true if the addressed object does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.class(), ErrorClass::NotFound)
    }

    /// Returns true if the object being created already exists.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self.class(), ErrorClass::AlreadyExists)
    }

    /// Returns true for a stale-read conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self.class(), ErrorClass::Conflict)
    }

    /// Returns true for desired state that will never converge as written.
    #[must_use]
    pub const fn is_invalid(&self) -> bool {
        matches!(self.class(), ErrorClass::Invalid)
    }
}
