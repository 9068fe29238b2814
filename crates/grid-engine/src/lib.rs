//! # grid-engine
//!
//! The distributed case-lifecycle engine for GridCompute.
//!
//! Every participating machine runs one engine and may act as submitter,
//! processor, and receiver at once. Coordination happens through two shared
//! resources only: the case archive (a filesystem with an atomic-rename
//! contract) and the case registry (a document store with single-record
//! compare-and-set). The engine implements:
//!
//! - **Case model**: the four-state lifecycle with its reclamation edge
//! - **Registry**: the CAS protocol (`claim`, `heartbeat`, `complete`,
//!   `reclaim`) plus scoped scans
//! - **Capabilities**: the machine/application matrix and the
//!   send/process/receive adapter contract, with subprocess adapters
//! - **Worker pool**: bounded, pausable, cancellable local execution in
//!   per-job scratch directories
//! - **Scheduler**: the poll/claim, heartbeat, reclamation, retrieval and
//!   submission duties
//! - **Facade**: the per-process loops, version handshake, status
//!   projections, and clean shutdown
//!
//! ## Guarantees
//!
//! - A case is processed by at most one machine at a time; crashes return
//!   it to the queue after the reclamation grace
//! - Data-bearing archive writes always precede the registry transition
//!   that advertises them, so readers never observe a status without its
//!   bundle
//! - Retries are driven entirely by reclamation; the protocol is uniform
//!   for crashes, adapter failures, and network loss

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod adapter;
pub mod capability;
pub mod case;
pub mod config;
pub mod error;
pub mod facade;
pub mod registry;
pub mod scheduler;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::adapter::ScriptAdapter;
    pub use crate::capability::{AdapterOperation, ApplicationAdapter, CapabilityIndex};
    pub use crate::case::{CaseOrigin, CaseRecord, CaseStatus};
    pub use crate::config::GridConfig;
    pub use crate::error::{Error, Result};
    pub use crate::facade::{CaseSummary, GridNode};
    pub use crate::registry::memory::InMemoryRegistry;
    pub use crate::registry::{CasOutcome, CaseRegistry, VersionGate};
    pub use crate::scheduler::{LifecycleEngine, TimingConfig};
    pub use crate::worker::{JobOutcome, JobSpec, WorkerPool};
}

// Re-export key types at crate root for ergonomics
pub use capability::{ApplicationAdapter, CapabilityIndex};
pub use case::{CaseRecord, CaseStatus};
pub use error::{Error, Result};
pub use facade::GridNode;
pub use registry::{CasOutcome, CaseRegistry};
pub use scheduler::{LifecycleEngine, TimingConfig};
pub use worker::WorkerPool;
