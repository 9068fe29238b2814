//! # grid-core
//!
//! Core abstractions for GridCompute, a cooperative computing grid for
//! small trusted networks sharing a filesystem and a document store.
//!
//! This crate provides the foundational types used across all components:
//!
//! - **Identifiers**: time-ordered case IDs ([`CaseId`])
//! - **Scope**: user-group/instance visibility labels and machine identity
//! - **Case Archive**: atomic-rename bundle storage over the shared
//!   filesystem, with an in-memory backend for simulation
//! - **Bundles**: the position-prefixed zip codec for inputs and results
//! - **Errors**: transient/permanent failure taxonomy
//! - **Observability**: logging initialization and secret redaction
//!
//! ## Crate Boundary
//!
//! `grid-core` is the only crate allowed to define shared primitives; the
//! engine crate builds the lifecycle protocol on top of these contracts.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod archive;
pub mod bundle;
pub mod error;
pub mod id;
pub mod observability;
pub mod paths;
pub mod scope;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::archive::{CaseArchive, FsArchive, MemoryArchive};
    pub use crate::error::{Error, Result};
    pub use crate::id::CaseId;
    pub use crate::observability::{LogFormat, Redacted, init_logging};
    pub use crate::paths::ArchivePath;
    pub use crate::scope::{GridScope, Identity};
}

// Re-export key types at crate root for ergonomics
pub use archive::{CaseArchive, FsArchive, MemoryArchive};
pub use error::{Error, Result};
pub use id::CaseId;
pub use observability::{LogFormat, Redacted, init_logging};
pub use paths::ArchivePath;
pub use scope::{GridScope, Identity};
