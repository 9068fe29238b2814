//! Pluggable case registry: the shared document store.
//!
//! All cross-machine coordination collapses into four single-record
//! compare-and-set primitives (`claim`, `heartbeat`, `complete`,
//! `reclaim`); the filesystem never participates in consensus.
//!
//! ## Design Principles
//!
//! - **CAS semantics**: conditional operations observe-and-mutate one
//!   record atomically, so no external lock is needed per case
//! - **Scoped queries**: every scan is filtered by user group and instance
//! - **Testability**: the in-memory backend doubles as the multi-machine
//!   simulation substrate; a production document store plugs in behind the
//!   same trait

pub mod memory;

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use grid_core::{CaseId, GridScope, Identity};

use crate::case::{CaseRecord, CaseStatus};
use crate::error::Result;

/// Result of a conditional registry operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The operation was applied.
    Applied,
    /// The record does not exist.
    NotFound,
    /// The record's state did not satisfy the precondition.
    Rejected {
        /// The status that was actually observed.
        actual: CaseStatus,
    },
}

impl CasOutcome {
    /// Returns true if the operation was applied.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Status of a version-gate record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    /// The version may run silently.
    Allowed,
    /// The version may run; the message is surfaced to the operator.
    Warning,
    /// The version must not run.
    Refused,
}

/// One record in the registry's `versions` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    /// The program version string this record gates.
    pub id: String,
    /// Gate decision for that version.
    pub status: VersionStatus,
    /// Operator message shown on warning or refusal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Outcome of the startup version handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionGate {
    /// Run silently.
    Allowed,
    /// Run, surfacing the message.
    Warning(String),
    /// Refuse to start.
    Refused(String),
    /// The version collection (or this version's record) is absent;
    /// the grid is not version-controlled. Run silently.
    Uncontrolled,
}

/// Durable case records with single-record atomic conditional updates.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from the
/// engine's loops.
#[async_trait]
pub trait CaseRegistry: Send + Sync {
    /// Inserts a freshly submitted record.
    ///
    /// # Errors
    ///
    /// Rejects duplicate IDs with a permanent registry error.
    async fn insert(&self, record: CaseRecord) -> Result<()>;

    /// Gets a record by ID. Returns `None` if it does not exist.
    async fn get(&self, id: CaseId) -> Result<Option<CaseRecord>>;

    /// Returns `TO_PROCESS` records in scope whose application is in the
    /// supported set, in ID (submission) order.
    async fn find_claimable(
        &self,
        scope: &GridScope,
        applications: &BTreeSet<String>,
    ) -> Result<Vec<CaseRecord>>;

    /// Atomically claims a record: `TO_PROCESS -> PROCESSING`, appends
    /// `claimer` to attempts, installs it as current, seeds the heartbeat.
    async fn claim(&self, id: CaseId, claimer: &Identity, now: DateTime<Utc>)
        -> Result<CasOutcome>;

    /// Refreshes the heartbeat; applied only while `claimer` holds the claim.
    async fn heartbeat(
        &self,
        id: CaseId,
        claimer: &Identity,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome>;

    /// Atomically completes a record: `PROCESSING -> PROCESSED`; applied
    /// only while `claimer` holds the claim.
    async fn complete(
        &self,
        id: CaseId,
        claimer: &Identity,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome>;

    /// Atomically reclaims a record whose heartbeat is older than `grace`:
    /// `PROCESSING -> TO_PROCESS`, attempts preserved, current cleared.
    async fn reclaim(&self, id: CaseId, now: DateTime<Utc>, grace: Duration)
        -> Result<CasOutcome>;

    /// Marks a `PROCESSED` record received by its originator.
    async fn mark_received(&self, id: CaseId, now: DateTime<Utc>) -> Result<CasOutcome>;

    /// Deletes a record. Originator-driven, typically after `mark_received`.
    async fn delete(&self, id: CaseId) -> Result<()>;

    /// Returns IDs of `PROCESSING` records in scope whose heartbeat is
    /// older than `grace` at `now` (reclamation candidates).
    async fn find_stale_processing(
        &self,
        scope: &GridScope,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Vec<CaseId>>;

    /// Returns `PROCESSED` records in scope originated by `origin`, in ID
    /// order (result-retrieval candidates).
    async fn find_receivable(&self, scope: &GridScope, origin: &Identity)
        -> Result<Vec<CaseRecord>>;

    /// Returns every record in scope, in ID order (projections and reports).
    async fn cases_in_scope(&self, scope: &GridScope) -> Result<Vec<CaseRecord>>;

    /// Queries the version gate for a program version.
    async fn query_version(&self, version: &str) -> Result<VersionGate>;
}
