//! Error types and result aliases for GridCompute.
//!
//! The grid protocol distinguishes transient failures (retried by the
//! lifecycle loops, never surfaced into case state) from permanent ones.
//! IO errors are classified at construction so callers only need
//! [`Error::is_transient`].

use std::io;

/// The result type used throughout grid-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in grid-core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// A user-group/instance scope was malformed.
    #[error("invalid scope: {message}")]
    InvalidScope {
        /// Description of the violation.
        message: String,
    },

    /// An archive entry was not found at the given path.
    #[error("not found: {0}")]
    NotFound(String),

    /// A retryable filesystem failure (network share hiccup, contention).
    #[error("transient io error: {message}")]
    TransientIo {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<io::Error>,
    },

    /// A non-retryable filesystem failure.
    #[error("io error: {message}")]
    PermanentIo {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<io::Error>,
    },

    /// A case bundle could not be packed or unpacked.
    #[error("bundle error: {message}")]
    Bundle {
        /// Description of the failure.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a transient IO error with the given message.
    #[must_use]
    pub fn transient_io(message: impl Into<String>) -> Self {
        Self::TransientIo {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a permanent IO error with the given message.
    #[must_use]
    pub fn permanent_io(message: impl Into<String>) -> Self {
        Self::PermanentIo {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a bundle error with the given message.
    #[must_use]
    pub fn bundle(message: impl Into<String>) -> Self {
        Self::Bundle {
            message: message.into(),
        }
    }

    /// Creates an internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classifies an `io::Error` into the transient/permanent taxonomy.
    ///
    /// Interruptions, timeouts, and connection drops are worth retrying on a
    /// networked share; missing files and permission problems are not.
    #[must_use]
    pub fn from_io(context: &str, source: io::Error) -> Self {
        let message = format!("{context}: {source}");
        match source.kind() {
            io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => Self::TransientIo {
                message,
                source: Some(source),
            },
            _ => Self::PermanentIo {
                message,
                source: Some(source),
            },
        }
    }

    /// Returns true if retrying the failed operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(source: zip::result::ZipError) -> Self {
        Self::Bundle {
            message: source.to_string(),
        }
    }
}
