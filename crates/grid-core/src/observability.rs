//! Observability infrastructure for GridCompute.
//!
//! Structured logging with consistent spans across every node role
//! (submitter, processor, receiver). Lifecycle transitions log under the
//! `case` span so a case's history can be grepped across machines.

use std::fmt;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt as subscriber_fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at node startup. Safe to call multiple times; subsequent calls
/// are no-ops. `RUST_LOG` controls log levels.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(subscriber_fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(subscriber_fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for case lifecycle operations with standard fields.
#[must_use]
pub fn case_span(operation: &str, case_id: &str, user_group: &str, instance: &str) -> Span {
    tracing::info_span!(
        "case",
        op = operation,
        case_id = case_id,
        user_group = user_group,
        instance = instance,
    )
}

/// A secret value whose `Debug`/`Display` output is masked.
///
/// Used for the database credential so config structs can derive `Debug`
/// without leaking it into logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Redacted(String);

impl Redacted {
    /// Wraps a secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret value. Keep the result out of logs.
    #[must_use]
    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Redacted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl fmt::Display for Redacted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}
