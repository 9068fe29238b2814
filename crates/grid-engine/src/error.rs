//! Error types for the lifecycle engine.
//!
//! The grid protocol prefers silence over escalation: transient failures
//! are absorbed by the loops, adapter failures are local diagnostics, and
//! only startup-phase errors and explicit user commands propagate.

use grid_core::CaseId;

/// The result type used throughout grid-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A case was not found in the registry.
    #[error("case not found: {case_id}")]
    CaseNotFound {
        /// The case ID that was not found.
        case_id: CaseId,
    },

    /// An invalid status transition was attempted.
    #[error("invalid status transition: {from} -> {to} ({reason})")]
    InvalidStatusTransition {
        /// The current status.
        from: String,
        /// The attempted target status.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// Malformed settings, missing shared folder, or missing adapter.
    /// Fatal at startup.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// The registry refused this program version. Fatal at startup.
    #[error("version refused by registry: {message}")]
    VersionRefused {
        /// The operator-supplied refusal message.
        message: String,
    },

    /// An adapter invocation failed. Local diagnostic only; the case is
    /// left `PROCESSING` for reclamation to retry.
    #[error("adapter '{application}' failed: {message}")]
    AdapterFailed {
        /// The application whose adapter failed.
        application: String,
        /// Captured diagnostics (exit status, stderr tail).
        message: String,
    },

    /// A retryable registry failure (connection drop, contention).
    #[error("transient registry error: {message}")]
    TransientRegistry {
        /// Description of the failure.
        message: String,
    },

    /// A non-retryable registry failure.
    #[error("registry error: {message}")]
    PermanentRegistry {
        /// Description of the failure.
        message: String,
    },

    /// The worker pool rejected a job.
    #[error("worker pool error: {message}")]
    WorkerPool {
        /// Description of the rejection.
        message: String,
    },

    /// An error from grid-core.
    #[error("core error: {0}")]
    Core(#[from] grid_core::Error),
}

impl Error {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an adapter failure with captured diagnostics.
    #[must_use]
    pub fn adapter_failed(application: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AdapterFailed {
            application: application.into(),
            message: message.into(),
        }
    }

    /// Creates a transient registry error.
    #[must_use]
    pub fn transient_registry(message: impl Into<String>) -> Self {
        Self::TransientRegistry {
            message: message.into(),
        }
    }

    /// Creates a worker pool error.
    #[must_use]
    pub fn worker_pool(message: impl Into<String>) -> Self {
        Self::WorkerPool {
            message: message.into(),
        }
    }

    /// Returns true if retrying the failed operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientRegistry { .. } => true,
            Self::Core(core) => core.is_transient(),
            _ => false,
        }
    }
}
