//! Error types and result aliases for keel.
//!
//! Store and locator failures are structured so callers can classify them
//! (see [`Error::class`]) and decide between retrying, requeueing from a fresh
//! read, or surfacing the problem in a record's status.

use std::fmt;

/// The result type used throughout keel-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification shared by every keel error type.
///
/// Remote status codes, store failures and local validation all map onto
/// this set so the controller can pick a retry policy without inspecting
/// individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The addressed object does not exist.
    NotFound,
    /// The object being created already exists.
    AlreadyExists,
    /// An optimistic-concurrency check failed.
    Conflict,
    /// The peer could not be reached or did not answer in time.
    Unavailable,
    /// The request can never succeed as written.
    Invalid,
}

impl ErrorClass {
    /// Returns the metric label for this class.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::Conflict => "conflict",
            Self::Unavailable => "unavailable",
            Self::Invalid => "invalid",
        }
    }

    /// Returns true when retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Conflict | Self::Unavailable)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Errors that can occur in keel-core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested record was not found.
    #[error("not found: {kind} {key}")]
    NotFound {
        /// Kind of the record that was looked up.
        kind: &'static str,
        /// Key that was looked up.
        key: String,
    },

    /// A record with the same key already exists.
    #[error("already exists: {kind} {key}")]
    AlreadyExists {
        /// Kind of the record.
        kind: &'static str,
        /// Conflicting key.
        key: String,
    },

    /// The caller's view of the record is stale.
    #[error("conflict on {kind} {key}: expected version {expected}, found {actual}")]
    Conflict {
        /// Kind of the record.
        kind: &'static str,
        /// Key of the record.
        key: String,
        /// Version the caller read.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// The write was rejected because it can never succeed.
    #[error("invalid: {0}")]
    Invalid(String),

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a not-found error for a record key.
    #[must_use]
    pub fn not_found(kind: &'static str, key: impl fmt::Display) -> Self {
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
            Self::AlreadyExists { .. } => ErrorClass::AlreadyExists,
            Self::Conflict { .. } => ErrorClass::Conflict,
            Self::Invalid(_) | Self::Serialization { .. } => ErrorClass::Invalid,
            Self::Storage { .. } => ErrorClass::Unavailable,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_store_errors() {
        assert_eq!(Error::not_found("Entity", "default/a").class(), ErrorClass::NotFound);
        assert_eq!(Error::storage("down").class(), ErrorClass::Unavailable);
        assert_eq!(Error::Invalid("frozen".into()).class(), ErrorClass::Invalid);
        assert!(ErrorClass::Conflict.is_retryable());
        assert!(!ErrorClass::NotFound.is_retryable());
    }

    #[test]
    fn conflict_message_names_versions() {
        let err = Error::Conflict {
            kind: "Model",
            key: "ns/m".into(),
            expected: 3,
            actual: 4,
        };
        assert_eq!(
            err.to_string(),
            "conflict on Model ns/m: expected version 3, found 4"
        );
    }
}
