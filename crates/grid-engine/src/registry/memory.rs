//! In-memory registry implementation.
//!
//! [`InMemoryRegistry`] keeps every record behind one `RwLock`, which makes
//! each conditional operation trivially atomic. It backs tests, the
//! multi-machine simulation (several engines sharing one registry), and the
//! single-machine node mode.
//!
//! ## Limitations
//!
//! - **Single-process only**: state is not shared across process boundaries
//! - **No durability**: all state is lost when the process exits
//!
//! The `set_offline` switch makes every operation fail with a transient
//! registry error, for driving outage scenarios in tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use grid_core::{CaseId, GridScope, Identity};

use super::{CasOutcome, CaseRegistry, VersionGate, VersionRecord, VersionStatus};
use crate::case::{CaseRecord, CaseStatus};
use crate::error::{Error, Result};

/// In-memory registry for tests, simulation, and single-machine grids.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    cases: RwLock<HashMap<CaseId, CaseRecord>>,
    /// `None` models an absent `versions` collection.
    versions: RwLock<Option<HashMap<String, VersionRecord>>>,
    offline: AtomicBool,
}

/// Converts a lock poison error to a registry error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::PermanentRegistry {
        message: "registry lock poisoned".to_string(),
    }
}

impl InMemoryRegistry {
    /// Creates a new empty registry with no version collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the `versions` collection with the given records.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_versions(&self, records: Vec<VersionRecord>) -> Result<()> {
        let map = records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        *self.versions.write().map_err(poison_err)? = Some(map);
        Ok(())
    }

    /// Removes the `versions` collection entirely.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn clear_versions(&self) -> Result<()> {
        *self.versions.write().map_err(poison_err)? = None;
        Ok(())
    }

    /// Simulates a registry outage: while offline, every operation fails
    /// with a transient registry error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Returns the number of stored records.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn case_count(&self) -> Result<usize> {
        Ok(self.cases.read().map_err(poison_err)?.len())
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::transient_registry("registry offline"));
        }
        Ok(())
    }

    fn sorted_by_id(mut records: Vec<CaseRecord>) -> Vec<CaseRecord> {
        records.sort_by_key(|record| record.id);
        records
    }
}

#[async_trait]
impl CaseRegistry for InMemoryRegistry {
    async fn insert(&self, record: CaseRecord) -> Result<()> {
        self.check_online()?;
        let mut cases = self.cases.write().map_err(poison_err)?;
        if cases.contains_key(&record.id) {
            return Err(Error::PermanentRegistry {
                message: format!("duplicate case id: {}", record.id),
            });
        }
        cases.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: CaseId) -> Result<Option<CaseRecord>> {
        self.check_online()?;
        Ok(self.cases.read().map_err(poison_err)?.get(&id).cloned())
    }

    async fn find_claimable(
        &self,
        scope: &GridScope,
        applications: &BTreeSet<String>,
    ) -> Result<Vec<CaseRecord>> {
        self.check_online()?;
        let records = {
            let cases = self.cases.read().map_err(poison_err)?;
            cases
                .values()
                .filter(|record| {
                    record.in_scope(scope)
                        && record.status == CaseStatus::ToProcess
                        && applications.contains(&record.application)
                })
                .cloned()
                .collect()
        };
        Ok(Self::sorted_by_id(records))
    }

    async fn claim(
        &self,
        id: CaseId,
        claimer: &Identity,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome> {
        self.check_online()?;
        let mut cases = self.cases.write().map_err(poison_err)?;
        let Some(record) = cases.get_mut(&id) else {
            return Ok(CasOutcome::NotFound);
        };
        if record.status != CaseStatus::ToProcess {
            return Ok(CasOutcome::Rejected {
                actual: record.status,
            });
        }
        record.apply_claim(claimer, now)?;
        Ok(CasOutcome::Applied)
    }

    async fn heartbeat(
        &self,
        id: CaseId,
        claimer: &Identity,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome> {
        self.check_online()?;
        let mut cases = self.cases.write().map_err(poison_err)?;
        let Some(record) = cases.get_mut(&id) else {
            return Ok(CasOutcome::NotFound);
        };
        if !record.held_by(claimer) {
            return Ok(CasOutcome::Rejected {
                actual: record.status,
            });
        }
        record.apply_heartbeat(claimer, now)?;
        Ok(CasOutcome::Applied)
    }

    async fn complete(
        &self,
        id: CaseId,
        claimer: &Identity,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome> {
        self.check_online()?;
        let mut cases = self.cases.write().map_err(poison_err)?;
        let Some(record) = cases.get_mut(&id) else {
            return Ok(CasOutcome::NotFound);
        };
        if !record.held_by(claimer) {
            return Ok(CasOutcome::Rejected {
                actual: record.status,
            });
        }
        record.apply_complete(claimer, now)?;
        Ok(CasOutcome::Applied)
    }

    async fn reclaim(
        &self,
        id: CaseId,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<CasOutcome> {
        self.check_online()?;
        let mut cases = self.cases.write().map_err(poison_err)?;
        let Some(record) = cases.get_mut(&id) else {
            return Ok(CasOutcome::NotFound);
        };
        if !record.heartbeat_stale_at(now, grace) {
            return Ok(CasOutcome::Rejected {
                actual: record.status,
            });
        }
        record.apply_reclaim()?;
        Ok(CasOutcome::Applied)
    }

    async fn mark_received(&self, id: CaseId, now: DateTime<Utc>) -> Result<CasOutcome> {
        self.check_online()?;
        let mut cases = self.cases.write().map_err(poison_err)?;
        let Some(record) = cases.get_mut(&id) else {
            return Ok(CasOutcome::NotFound);
        };
        if record.status != CaseStatus::Processed {
            return Ok(CasOutcome::Rejected {
                actual: record.status,
            });
        }
        record.apply_received(now)?;
        Ok(CasOutcome::Applied)
    }

    async fn delete(&self, id: CaseId) -> Result<()> {
        self.check_online()?;
        self.cases.write().map_err(poison_err)?.remove(&id);
        Ok(())
    }

    async fn find_stale_processing(
        &self,
        scope: &GridScope,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Vec<CaseId>> {
        self.check_online()?;
        let mut stale: Vec<CaseId> = {
            let cases = self.cases.read().map_err(poison_err)?;
            cases
                .values()
                .filter(|record| record.in_scope(scope) && record.heartbeat_stale_at(now, grace))
                .map(|record| record.id)
                .collect()
        };
        stale.sort_unstable();
        Ok(stale)
    }

    async fn find_receivable(
        &self,
        scope: &GridScope,
        origin: &Identity,
    ) -> Result<Vec<CaseRecord>> {
        self.check_online()?;
        let records = {
            let cases = self.cases.read().map_err(poison_err)?;
            cases
                .values()
                .filter(|record| {
                    record.in_scope(scope)
                        && record.status == CaseStatus::Processed
                        && record.origin.machine == origin.machine
                        && record.origin.user == origin.user
                })
                .cloned()
                .collect()
        };
        Ok(Self::sorted_by_id(records))
    }

    async fn cases_in_scope(&self, scope: &GridScope) -> Result<Vec<CaseRecord>> {
        self.check_online()?;
        let records = {
            let cases = self.cases.read().map_err(poison_err)?;
            cases
                .values()
                .filter(|record| record.in_scope(scope))
                .cloned()
                .collect()
        };
        Ok(Self::sorted_by_id(records))
    }

    async fn query_version(&self, version: &str) -> Result<VersionGate> {
        self.check_online()?;
        let versions = self.versions.read().map_err(poison_err)?;
        let Some(collection) = versions.as_ref() else {
            return Ok(VersionGate::Uncontrolled);
        };
        let Some(record) = collection.get(version) else {
            return Ok(VersionGate::Uncontrolled);
        };
        let message = record.message.clone().unwrap_or_default();
        Ok(match record.status {
            VersionStatus::Allowed => VersionGate::Allowed,
            VersionStatus::Warning => VersionGate::Warning(message),
            VersionStatus::Refused => VersionGate::Refused(message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::CaseOrigin;
    use grid_core::paths;

    fn scope() -> GridScope {
        GridScope::new("acme", "prod").unwrap()
    }

    async fn submit(registry: &InMemoryRegistry, application: &str) -> CaseId {
        let id = CaseId::generate();
        let origin = CaseOrigin::new(&Identity::new("origin-m", "origin-u"), Utc::now());
        let record = CaseRecord::new(
            id,
            &scope(),
            application,
            paths::input_path("origin-u", "origin-m", id),
            origin,
        );
        registry.insert(record).await.unwrap();
        id
    }

    fn apps(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let registry = InMemoryRegistry::new();
        let id = CaseId::generate();
        let origin = CaseOrigin::new(&Identity::new("m", "u"), Utc::now());
        let record = CaseRecord::new(
            id,
            &scope(),
            "solver",
            paths::input_path("u", "m", id),
            origin,
        );
        registry.insert(record.clone()).await.unwrap();
        assert!(registry.insert(record).await.is_err());
    }

    #[tokio::test]
    async fn find_claimable_filters_and_orders() {
        let registry = InMemoryRegistry::new();
        let first = submit(&registry, "solver").await;
        let second = submit(&registry, "solver").await;
        let _other_app = submit(&registry, "mesher").await;

        let claimable = registry
            .find_claimable(&scope(), &apps(&["solver"]))
            .await
            .unwrap();
        let ids: Vec<CaseId> = claimable.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first, second]);

        // Different scope sees nothing.
        let debug_scope = GridScope::new("acme", "debug").unwrap();
        let claimable = registry
            .find_claimable(&debug_scope, &apps(&["solver"]))
            .await
            .unwrap();
        assert!(claimable.is_empty());
    }

    #[tokio::test]
    async fn only_one_claim_wins() {
        let registry = InMemoryRegistry::new();
        let id = submit(&registry, "solver").await;
        let a = Identity::new("a", "u");
        let b = Identity::new("b", "u");

        let first = registry.claim(id, &a, Utc::now()).await.unwrap();
        let second = registry.claim(id, &b, Utc::now()).await.unwrap();
        assert!(first.is_applied());
        assert_eq!(
            second,
            CasOutcome::Rejected {
                actual: CaseStatus::Processing
            }
        );

        let record = registry.get(id).await.unwrap().unwrap();
        assert!(record.held_by(&a));
        assert_eq!(record.processors.attempts.len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_and_complete_require_holder() {
        let registry = InMemoryRegistry::new();
        let id = submit(&registry, "solver").await;
        let holder = Identity::new("a", "u");
        let intruder = Identity::new("b", "u");
        registry.claim(id, &holder, Utc::now()).await.unwrap();

        assert!(!registry
            .heartbeat(id, &intruder, Utc::now())
            .await
            .unwrap()
            .is_applied());
        assert!(!registry
            .complete(id, &intruder, Utc::now())
            .await
            .unwrap()
            .is_applied());
        assert!(registry
            .complete(id, &holder, Utc::now())
            .await
            .unwrap()
            .is_applied());
    }

    #[tokio::test]
    async fn reclaim_requires_staleness() {
        let registry = InMemoryRegistry::new();
        let id = submit(&registry, "solver").await;
        let holder = Identity::new("a", "u");
        let start = Utc::now();
        let grace = Duration::from_secs(120);
        registry.claim(id, &holder, start).await.unwrap();

        // Fresh heartbeat: rejected.
        let outcome = registry
            .reclaim(id, start + chrono::Duration::seconds(30), grace)
            .await
            .unwrap();
        assert!(!outcome.is_applied());

        // Stale: applied, attempts preserved.
        let outcome = registry
            .reclaim(id, start + chrono::Duration::seconds(130), grace)
            .await
            .unwrap();
        assert!(outcome.is_applied());
        let record = registry.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, CaseStatus::ToProcess);
        assert_eq!(record.processors.attempts.len(), 1);

        // The old holder's heartbeat and complete now fail.
        assert!(!registry
            .heartbeat(id, &holder, Utc::now())
            .await
            .unwrap()
            .is_applied());
        assert!(!registry
            .complete(id, &holder, Utc::now())
            .await
            .unwrap()
            .is_applied());
    }

    #[tokio::test]
    async fn mark_received_is_idempotent_at_db_level() {
        let registry = InMemoryRegistry::new();
        let id = submit(&registry, "solver").await;
        let holder = Identity::new("a", "u");
        registry.claim(id, &holder, Utc::now()).await.unwrap();
        registry.complete(id, &holder, Utc::now()).await.unwrap();

        assert!(registry.mark_received(id, Utc::now()).await.unwrap().is_applied());
        let snapshot = registry.get(id).await.unwrap().unwrap();

        // Second call returns false and leaves the record unchanged.
        let second = registry.mark_received(id, Utc::now()).await.unwrap();
        assert!(!second.is_applied());
        let after = registry.get(id).await.unwrap().unwrap();
        assert_eq!(after.status, CaseStatus::Received);
        assert_eq!(after.origin.received_at, snapshot.origin.received_at);
    }

    #[tokio::test]
    async fn delete_removes_and_is_idempotent() {
        let registry = InMemoryRegistry::new();
        let id = submit(&registry, "solver").await;
        assert_eq!(registry.case_count().unwrap(), 1);

        registry.delete(id).await.unwrap();
        assert!(registry.get(id).await.unwrap().is_none());
        registry.delete(id).await.unwrap();
        assert_eq!(registry.case_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn offline_registry_fails_transiently() {
        let registry = InMemoryRegistry::new();
        let id = submit(&registry, "solver").await;
        registry.set_offline(true);

        let err = registry.get(id).await.unwrap_err();
        assert!(err.is_transient());

        registry.set_offline(false);
        assert!(registry.get(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn version_gate_outcomes() {
        let registry = InMemoryRegistry::new();
        assert_eq!(
            registry.query_version("0.2.0").await.unwrap(),
            VersionGate::Uncontrolled
        );

        registry
            .set_versions(vec![
                VersionRecord {
                    id: "0.1.0".to_string(),
                    status: VersionStatus::Refused,
                    message: Some("upgrade required".to_string()),
                },
                VersionRecord {
                    id: "0.2.0".to_string(),
                    status: VersionStatus::Warning,
                    message: Some("deprecated soon".to_string()),
                },
                VersionRecord {
                    id: "0.3.0".to_string(),
                    status: VersionStatus::Allowed,
                    message: None,
                },
            ])
            .unwrap();

        assert_eq!(
            registry.query_version("0.1.0").await.unwrap(),
            VersionGate::Refused("upgrade required".to_string())
        );
        assert_eq!(
            registry.query_version("0.2.0").await.unwrap(),
            VersionGate::Warning("deprecated soon".to_string())
        );
        assert_eq!(
            registry.query_version("0.3.0").await.unwrap(),
            VersionGate::Allowed
        );
        // Record absent while the collection exists: uncontrolled.
        assert_eq!(
            registry.query_version("9.9.9").await.unwrap(),
            VersionGate::Uncontrolled
        );
    }
}
