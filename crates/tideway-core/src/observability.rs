//! Observability infrastructure for Tideway.
//!
//! Structured logging with consistent spans. This module provides the
//! subscriber initialization helper and span constructors shared by the
//! controller loops and the periodic sweeps.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name; anything other than `json` selects pretty output.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
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
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `tideway_controller=debug`)
///
/// # Example
///
/// ```rust
/// use tideway_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
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

/// Creates a span for one reconciliation of a queued key.
///
/// # Example
///
/// ```rust
/// use tideway_core::observability::controller_span;
///
/// let span = controller_span("workflow-run", "ci/build-1", "update");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn controller_span(controller: &str, key: &str, event_type: &str) -> Span {
    tracing::info_span!(
        "reconcile",
        controller = controller,
        key = key,
        event = event_type,
    )
}

/// Creates a span for one pass of a periodic sweep (timeout, gc).
#[must_use]
pub fn sweep_span(processor: &str) -> Span {
    tracing::info_span!("sweep", processor = processor)
}
