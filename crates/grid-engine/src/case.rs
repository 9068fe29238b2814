//! Case records and the lifecycle state machine.
//!
//! This module provides:
//! - `CaseStatus`: the four-state lifecycle with its single backward edge
//! - `CaseRecord`: the document stored in the registry, one per case
//! - heartbeat staleness and processor-identity checks used by the
//!   claim/heartbeat/complete/reclaim primitives

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use grid_core::paths::{self, ArchivePath};
use grid_core::{CaseId, GridScope, Identity};

use crate::error::{Error, Result};

/// Case lifecycle status.
///
/// Statuses follow a directed graph with exactly one backward edge
/// (reclamation of stalled work):
///
/// ```text
/// TO_PROCESS --claim--> PROCESSING --complete--> PROCESSED --receive--> RECEIVED
///      ^                    |
///      +------reclaim-------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseStatus {
    /// Submitted and waiting for a capable machine to claim it.
    ToProcess,
    /// Claimed by exactly one processor, kept alive by heartbeats.
    Processing,
    /// Result bundle uploaded; waiting for the originator to pull it.
    Processed,
    /// Originator pulled and applied the results. Terminal.
    Received,
}

impl CaseStatus {
    /// Returns true if this is the terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Received)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::ToProcess, Self::Processing)
                | (Self::Processing, Self::Processed)
                // Reclamation: the only backward edge.
                | (Self::Processing, Self::ToProcess)
                | (Self::Processed, Self::Received)
        )
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::ToProcess => "to_process",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Received => "received",
        }
    }
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToProcess => write!(f, "TO_PROCESS"),
            Self::Processing => write!(f, "PROCESSING"),
            Self::Processed => write!(f, "PROCESSED"),
            Self::Received => write!(f, "RECEIVED"),
        }
    }
}

/// Submission provenance of a case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseOrigin {
    /// Machine the case was submitted from.
    pub machine: String,
    /// User who submitted the case.
    pub user: String,
    /// When the case was submitted.
    pub submitted_at: DateTime<Utc>,
    /// When the originator marked the case received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

impl CaseOrigin {
    /// Creates an origin stamp for a submission happening now.
    #[must_use]
    pub fn new(identity: &Identity, submitted_at: DateTime<Utc>) -> Self {
        Self {
            machine: identity.machine.clone(),
            user: identity.user.clone(),
            submitted_at,
            received_at: None,
        }
    }

    /// Returns the originator identity.
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity::new(self.machine.clone(), self.user.clone())
    }
}

/// The processor currently holding a `PROCESSING` claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentProcessor {
    /// Machine holding the claim.
    pub machine: String,
    /// User the processing daemon runs as.
    pub user: String,
    /// When this attempt claimed the case.
    pub started_at: DateTime<Utc>,
    /// When this attempt completed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl CurrentProcessor {
    /// Returns the processor identity.
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity::new(self.machine.clone(), self.user.clone())
    }

    fn matches(&self, identity: &Identity) -> bool {
        self.machine == identity.machine && self.user == identity.user
    }
}

/// Processing history of a case.
///
/// `attempts` is append-only; its tail is the most recent attempt and, while
/// the case is `PROCESSING`, matches `current`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Processors {
    /// Every processor that ever claimed this case, in claim order.
    #[serde(default)]
    pub attempts: Vec<Identity>,
    /// The processor holding the live claim, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<CurrentProcessor>,
}

/// One case record, as stored in the registry's `cases` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseRecord {
    /// Unique, time-ordered identifier.
    pub id: CaseId,
    /// Tenant tag; cases are visible only within their group.
    pub user_group: String,
    /// Partition tag; isolates debug grids from production grids.
    pub instance: String,
    /// Adapter required to process this case.
    pub application: String,
    /// Lifecycle status.
    pub status: CaseStatus,
    /// Canonical input bundle location in the archive.
    pub path: ArchivePath,
    /// Submission provenance.
    pub origin: CaseOrigin,
    /// Processing history.
    #[serde(default)]
    pub processors: Processors,
    /// Liveness timestamp; only meaningful while `PROCESSING`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl CaseRecord {
    /// Creates a freshly submitted record in `TO_PROCESS`.
    #[must_use]
    pub fn new(
        id: CaseId,
        scope: &GridScope,
        application: impl Into<String>,
        path: ArchivePath,
        origin: CaseOrigin,
    ) -> Self {
        Self {
            id,
            user_group: scope.user_group.clone(),
            instance: scope.instance.clone(),
            application: application.into(),
            status: CaseStatus::ToProcess,
            path,
            origin,
            processors: Processors::default(),
            last_heartbeat: None,
        }
    }

    /// Returns true if the record belongs to the given scope.
    #[must_use]
    pub fn in_scope(&self, scope: &GridScope) -> bool {
        self.user_group == scope.user_group && self.instance == scope.instance
    }

    /// Returns the canonical result bundle path for this case.
    ///
    /// Derived from the origin and the case ID, so the result location is
    /// known to every machine without a second record field.
    #[must_use]
    pub fn result_path(&self) -> ArchivePath {
        paths::result_path(&self.origin.user, &self.origin.machine, self.id)
    }

    /// Returns true if the given identity holds the live claim.
    #[must_use]
    pub fn held_by(&self, identity: &Identity) -> bool {
        self.status == CaseStatus::Processing
            && self
                .processors
                .current
                .as_ref()
                .is_some_and(|current| current.matches(identity))
    }

    /// Returns true if the heartbeat is stale at `now`.
    ///
    /// Only `PROCESSING` cases can be stale; a missing heartbeat on a
    /// `PROCESSING` record counts as stale (the claimer never wrote one).
    #[must_use]
    pub fn heartbeat_stale_at(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        if self.status != CaseStatus::Processing {
            return false;
        }
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
        self.last_heartbeat
            .is_none_or(|last| now.signed_duration_since(last) > grace)
    }

    fn transition_to(&mut self, target: CaseStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStatusTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: "edge not in the case lifecycle".to_string(),
            });
        }
        self.status = target;
        Ok(())
    }

    /// Applies a successful claim by `claimer` at `now`.
    ///
    /// Appends the claimer to `attempts`, installs it as `current`, and
    /// seeds the heartbeat so the claim is live from the first instant.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is not `TO_PROCESS`.
    pub fn apply_claim(&mut self, claimer: &Identity, now: DateTime<Utc>) -> Result<()> {
        self.transition_to(CaseStatus::Processing)?;
        self.processors.attempts.push(claimer.clone());
        self.processors.current = Some(CurrentProcessor {
            machine: claimer.machine.clone(),
            user: claimer.user.clone(),
            started_at: now,
            ended_at: None,
        });
        self.last_heartbeat = Some(now);
        Ok(())
    }

    /// Refreshes the heartbeat for the holding processor.
    ///
    /// # Errors
    ///
    /// Returns an error if `claimer` does not hold the live claim.
    pub fn apply_heartbeat(&mut self, claimer: &Identity, now: DateTime<Utc>) -> Result<()> {
        if !self.held_by(claimer) {
            return Err(Error::InvalidStatusTransition {
                from: self.status.to_string(),
                to: self.status.to_string(),
                reason: format!("{claimer} does not hold the claim"),
            });
        }
        self.last_heartbeat = Some(now);
        Ok(())
    }

    /// Applies completion by the holding processor at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if `claimer` does not hold the live claim.
    pub fn apply_complete(&mut self, claimer: &Identity, now: DateTime<Utc>) -> Result<()> {
        if !self.held_by(claimer) {
            return Err(Error::InvalidStatusTransition {
                from: self.status.to_string(),
                to: CaseStatus::Processed.to_string(),
                reason: format!("{claimer} does not hold the claim"),
            });
        }
        self.transition_to(CaseStatus::Processed)?;
        if let Some(current) = self.processors.current.as_mut() {
            current.ended_at = Some(now);
        }
        Ok(())
    }

    /// Applies reclamation at `now`: back to `TO_PROCESS`, attempts
    /// preserved, current claim cleared.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is not `PROCESSING`.
    pub fn apply_reclaim(&mut self) -> Result<()> {
        self.transition_to(CaseStatus::ToProcess)?;
        self.processors.current = None;
        self.last_heartbeat = None;
        Ok(())
    }

    /// Applies result retrieval by the originator at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is not `PROCESSED`.
    pub fn apply_received(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition_to(CaseStatus::Received)?;
        self.origin.received_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CaseRecord {
        let scope = GridScope::new("acme", "prod").unwrap();
        let origin = CaseOrigin::new(&Identity::new("origin-m", "origin-u"), Utc::now());
        let id = CaseId::generate();
        CaseRecord::new(
            id,
            &scope,
            "solver",
            paths::input_path("origin-u", "origin-m", id),
            origin,
        )
    }

    #[test]
    fn status_edges() {
        assert!(CaseStatus::ToProcess.can_transition_to(CaseStatus::Processing));
        assert!(CaseStatus::Processing.can_transition_to(CaseStatus::Processed));
        assert!(CaseStatus::Processing.can_transition_to(CaseStatus::ToProcess));
        assert!(CaseStatus::Processed.can_transition_to(CaseStatus::Received));

        // No backward edges other than reclamation, no skips.
        assert!(!CaseStatus::ToProcess.can_transition_to(CaseStatus::Processed));
        assert!(!CaseStatus::Processed.can_transition_to(CaseStatus::Processing));
        assert!(!CaseStatus::Received.can_transition_to(CaseStatus::ToProcess));
        assert!(!CaseStatus::Processing.can_transition_to(CaseStatus::Received));
    }

    #[test]
    fn full_lifecycle() -> Result<()> {
        let mut record = record();
        let worker = Identity::new("worker-m", "worker-u");
        let now = Utc::now();

        record.apply_claim(&worker, now)?;
        assert_eq!(record.status, CaseStatus::Processing);
        assert_eq!(record.processors.attempts.len(), 1);
        assert!(record.held_by(&worker));
        assert_eq!(record.last_heartbeat, Some(now));

        record.apply_heartbeat(&worker, now + chrono::Duration::seconds(5))?;
        record.apply_complete(&worker, now + chrono::Duration::seconds(10))?;
        assert_eq!(record.status, CaseStatus::Processed);
        assert!(record.processors.current.as_ref().unwrap().ended_at.is_some());

        record.apply_received(now + chrono::Duration::seconds(20))?;
        assert_eq!(record.status, CaseStatus::Received);
        assert!(record.origin.received_at.is_some());
        assert!(record.status.is_terminal());
        Ok(())
    }

    #[test]
    fn reclaim_preserves_attempts_and_clears_current() -> Result<()> {
        let mut record = record();
        let worker = Identity::new("worker-m", "worker-u");
        record.apply_claim(&worker, Utc::now())?;

        record.apply_reclaim()?;
        assert_eq!(record.status, CaseStatus::ToProcess);
        assert_eq!(record.processors.attempts.len(), 1);
        assert!(record.processors.current.is_none());
        assert!(record.last_heartbeat.is_none());

        // The same machine may reclaim its own prior attempt and re-claim.
        record.apply_claim(&worker, Utc::now())?;
        assert_eq!(record.processors.attempts.len(), 2);
        Ok(())
    }

    #[test]
    fn heartbeat_rejected_for_non_holder() -> Result<()> {
        let mut record = record();
        let holder = Identity::new("a", "u");
        let intruder = Identity::new("b", "u");
        record.apply_claim(&holder, Utc::now())?;

        assert!(record.apply_heartbeat(&intruder, Utc::now()).is_err());
        assert!(record.apply_complete(&intruder, Utc::now()).is_err());
        Ok(())
    }

    #[test]
    fn heartbeat_staleness() -> Result<()> {
        let mut record = record();
        let worker = Identity::new("a", "u");
        let start = Utc::now();
        record.apply_claim(&worker, start)?;

        let grace = Duration::from_secs(120);
        assert!(!record.heartbeat_stale_at(start + chrono::Duration::seconds(60), grace));
        assert!(record.heartbeat_stale_at(start + chrono::Duration::seconds(121), grace));

        // Non-processing records are never stale.
        record.apply_complete(&worker, start)?;
        assert!(!record.heartbeat_stale_at(start + chrono::Duration::seconds(600), grace));
        Ok(())
    }

    #[test]
    fn invalid_transition_fails() {
        let mut record = record();
        let err = record.apply_received(Utc::now()).unwrap_err();
        assert!(matches!(err, Error::InvalidStatusTransition { .. }));
        assert_eq!(record.status, CaseStatus::ToProcess);
    }

    #[test]
    fn result_path_derived_from_origin() {
        let record = record();
        assert_eq!(
            record.result_path().as_str(),
            format!("Results/ORIGIN-U/ORIGIN-M/{}.zip", record.id)
        );
    }

    #[test]
    fn record_serde_shape() {
        let record = record();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "TO_PROCESS");
        assert!(json["origin"]["machine"].is_string());
        assert!(json.get("last_heartbeat").is_none());
        let parsed: CaseRecord = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.id, record.id);
    }
}
