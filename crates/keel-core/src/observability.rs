//! Observability infrastructure for keel.
//!
//! Structured logging with consistent spans. Every reconcile runs inside a
//! [`reconcile_span`] so its log lines carry the controller and record key.

use std::str::FromStr;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Error;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(Error::Invalid(format!(
                "log format must be 'json' or 'pretty', got '{other}'"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `keel_reconcile=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates the span a single reconcile runs in.
///
/// # Example
///
/// ```rust
/// use keel_core::observability::reconcile_span;
///
/// let span = reconcile_span("entity", "network", "leaf-1");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn reconcile_span(controller: &str, namespace: &str, name: &str) -> Span {
    tracing::info_span!(
        "reconcile",
        controller = controller,
        namespace = namespace,
        name = name,
    )
}

/// Creates a span for one remote call.
#[must_use]
pub fn remote_span(operation: &str, address: &str) -> Span {
    tracing::debug_span!("remote", op = operation, address = address)
}
