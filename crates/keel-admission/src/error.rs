//! Error types for workload admission.
//!
//! Admission failures split into two groups. Problems with the workload or
//! the records it names are answered with a denial; everything else is an
//! errored response carrying an HTTP-style status code.

use keel_core::ErrorClass;

/// The result type used throughout keel-admission.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while mutating a workload.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The admitted object is not a pod.
    #[error("failed to decode pod: {0}")]
    Decode(#[from] serde_json::Error),

    /// A required annotation is absent.
    #[error("'{0}' annotation not found")]
    MissingAnnotation(&'static str),

    /// A record the workload refers to does not exist.
    #[error("{kind} '{key}' not found")]
    NotFound {
        /// Kind of the missing record.
        kind: &'static str,
        /// Key of the missing record.
        key: String,
    },

    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An error from the record store.
    #[error("store error: {0}")]
    Store(#[from] keel_core::Error),
}

impl Error {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(kind: &'static str, key: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    /// Classifies this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::Decode(_) | Self::MissingAnnotation(_) | Self::Config(_) => ErrorClass::Invalid,
            Self::Store(inner) => inner.class(),
        }
    }

    /// Returns true when the workload should be rejected rather than errored.
    #[must_use]
    pub const fn is_denial(&self) -> bool {
        matches!(self, Self::MissingAnnotation(_)) || matches!(self.class(), ErrorClass::NotFound)
    }

    /// HTTP-style status code of an errored response.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Decode(_) => 400,
            _ => 500,
        }
    }
}
