//! The distributed lifecycle engine.
//!
//! One [`LifecycleEngine`] runs per participating process and owns the
//! node's side of the grid protocol:
//!
//! - **Poll & claim**: find claimable cases matching local capabilities and
//!   free worker capacity, claim them, hand them to the pool
//! - **Heartbeat duty**: keep live claims fresh; a rejected heartbeat means
//!   the claim was reclaimed and the local job is cancelled immediately
//! - **Completion**: upload the result bundle, then transition the record
//!   (archive write strictly before registry transition)
//! - **Reclamation**: cooperatively reset stalled `PROCESSING` cases
//! - **Retrieval**: pull results for cases this node originated
//! - **Submission**: expand a user selection via the adapter and insert
//!   new cases (archive write strictly before registry insert)
//!
//! Each duty is a single-pass method; the orchestration facade drives them
//! on jittered timers, and tests drive them directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use grid_core::archive::CaseArchive;
use grid_core::{CaseId, GridScope, Identity, bundle};

use crate::capability::{AdapterOperation, CapabilityIndex};
use crate::case::{CaseOrigin, CaseRecord};
use crate::error::{Error, Result};
use crate::registry::CaseRegistry;
use crate::worker::{JobOutcome, JobSpec, WorkerPool};

/// Timing parameters governing heartbeat and reclamation.
///
/// The heartbeat interval `H` must be substantially shorter than the
/// reclamation grace `G`; startup refuses `H >= G/2`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Cadence of the poll/claim and retrieval scans.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Heartbeat interval `H`.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Reclamation grace `G`: a `PROCESSING` case whose heartbeat is older
    /// than this is considered abandoned.
    #[serde(with = "humantime_serde")]
    pub reclaim_grace: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            reclaim_grace: Duration::from_secs(120),
        }
    }
}

impl TimingConfig {
    /// Validates the timing relationships.
    ///
    /// # Errors
    ///
    /// Fails if any interval is zero or the heartbeat interval is not
    /// strictly less than half the reclamation grace.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero()
            || self.heartbeat_interval.is_zero()
            || self.reclaim_grace.is_zero()
        {
            return Err(Error::config("timing intervals must be non-zero"));
        }
        if self.heartbeat_interval * 2 >= self.reclaim_grace {
            return Err(Error::config(format!(
                "heartbeat interval {:?} must be less than half the reclamation grace {:?}",
                self.heartbeat_interval, self.reclaim_grace
            )));
        }
        Ok(())
    }

    /// Cadence of the cooperative reclamation scan.
    #[must_use]
    pub fn reclaim_scan_interval(&self) -> Duration {
        (self.reclaim_grace / 4).max(self.poll_interval)
    }
}

/// Monotonic per-node event counters.
#[derive(Debug, Default)]
pub struct EngineCounters {
    claimed: AtomicU64,
    completed: AtomicU64,
    received: AtomicU64,
    reclaimed: AtomicU64,
    adapter_failures: AtomicU64,
    claims_lost: AtomicU64,
    submitted: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    /// Cases this node claimed.
    pub claimed: u64,
    /// Cases this node completed.
    pub completed: u64,
    /// Results this node received as originator.
    pub received: u64,
    /// Stalled cases this node reclaimed on behalf of the grid.
    pub reclaimed: u64,
    /// Local adapter failures.
    pub adapter_failures: u64,
    /// Claims lost to reclamation while still running locally.
    pub claims_lost: u64,
    /// Cases this node submitted.
    pub submitted: u64,
}

impl EngineCounters {
    fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            adapter_failures: self.adapter_failures.load(Ordering::Relaxed),
            claims_lost: self.claims_lost.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
        }
    }
}

/// The per-process scheduler/lifecycle engine.
pub struct LifecycleEngine {
    registry: Arc<dyn CaseRegistry>,
    archive: Arc<dyn CaseArchive>,
    capabilities: CapabilityIndex,
    pool: WorkerPool,
    identity: Identity,
    scope: GridScope,
    timing: TimingConfig,
    max_attempts: Option<usize>,
    counters: EngineCounters,
}

impl LifecycleEngine {
    /// Creates an engine after validating the timing configuration.
    ///
    /// # Errors
    ///
    /// Fails if the timing relationships are invalid (`H >= G/2`).
    pub fn new(
        registry: Arc<dyn CaseRegistry>,
        archive: Arc<dyn CaseArchive>,
        capabilities: CapabilityIndex,
        pool: WorkerPool,
        identity: Identity,
        scope: GridScope,
        timing: TimingConfig,
    ) -> Result<Self> {
        timing.validate()?;
        Ok(Self {
            registry,
            archive,
            capabilities,
            pool,
            identity,
            scope,
            timing,
            max_attempts: None,
            counters: EngineCounters::default(),
        })
    }

    /// Caps claim attempts per case: cases with this many recorded attempts
    /// are skipped by the claim path. Disabled by default.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Returns this node's identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Returns this node's scope.
    #[must_use]
    pub fn scope(&self) -> &GridScope {
        &self.scope
    }

    /// Returns the timing configuration.
    #[must_use]
    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Returns the worker pool.
    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Returns the registry handle.
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn CaseRegistry> {
        &self.registry
    }

    /// Returns a snapshot of the node counters.
    #[must_use]
    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    /// One pass of the poll & claim loop. Returns the number of cases
    /// claimed and handed to the worker pool.
    ///
    /// # Errors
    ///
    /// Propagates registry scan failures; individual lost claims are
    /// skipped silently.
    pub async fn poll_once(&self) -> Result<usize> {
        if !self.pool.is_accepting() || self.pool.free_slots() == 0 {
            return Ok(0);
        }
        let supported = self.capabilities.supported_applications();
        if supported.is_empty() {
            return Ok(0);
        }

        let candidates = self.registry.find_claimable(&self.scope, &supported).await?;
        let mut claimed = 0;
        for record in candidates {
            if !self.pool.is_accepting() || self.pool.free_slots() == 0 {
                break;
            }
            if let Some(cap) = self.max_attempts {
                if record.processors.attempts.len() >= cap {
                    trace!(case_id = %record.id, attempts = record.processors.attempts.len(),
                        "skipping case at attempt cap");
                    continue;
                }
            }
            let Some(adapter) = self.capabilities.adapter(&record.application) else {
                continue;
            };

            match self.registry.claim(record.id, &self.identity, Utc::now()).await? {
                outcome if outcome.is_applied() => {
                    let job = JobSpec {
                        case_id: record.id,
                        application: record.application.clone(),
                        input_path: record.path.clone(),
                    };
                    if let Err(error) = self.pool.submit(job, adapter, Arc::clone(&self.archive)) {
                        // Claim won but the pool raced shut; the claim will
                        // age out and be reclaimed.
                        warn!(case_id = %record.id, %error, "claimed case could not be started");
                        break;
                    }
                    self.counters.claimed.fetch_add(1, Ordering::Relaxed);
                    claimed += 1;
                    info!(case_id = %record.id, application = %record.application, "claimed case");
                }
                _ => trace!(case_id = %record.id, "claim lost to another machine"),
            }
        }
        Ok(claimed)
    }

    /// One pass of the heartbeat duty over all locally running jobs.
    ///
    /// A rejected heartbeat means the claim was reclaimed (or the record
    /// vanished): the local job is cancelled immediately and its outputs
    /// are discarded. Transient registry failures are absorbed; the grid's
    /// reclamation handles prolonged outages.
    pub async fn heartbeat_once(&self) {
        for case_id in self.pool.active_case_ids() {
            match self.registry.heartbeat(case_id, &self.identity, Utc::now()).await {
                Ok(outcome) if outcome.is_applied() => {}
                Ok(_) => {
                    self.counters.claims_lost.fetch_add(1, Ordering::Relaxed);
                    warn!(case_id = %case_id, "claim lost; cancelling local job");
                    self.pool.cancel(case_id);
                }
                Err(error) if error.is_transient() => {
                    debug!(case_id = %case_id, %error, "heartbeat deferred");
                }
                Err(error) => {
                    warn!(case_id = %case_id, %error, "heartbeat failed");
                }
            }
        }
    }

    /// One pass of the cooperative reclamation scan. Returns the reclaimed
    /// case IDs.
    ///
    /// # Errors
    ///
    /// Propagates registry scan failures.
    pub async fn reclaim_once(&self) -> Result<Vec<CaseId>> {
        let grace = self.timing.reclaim_grace;
        let stale = self
            .registry
            .find_stale_processing(&self.scope, Utc::now(), grace)
            .await?;

        let mut reclaimed = Vec::new();
        for case_id in stale {
            if self
                .registry
                .reclaim(case_id, Utc::now(), grace)
                .await?
                .is_applied()
            {
                self.counters.reclaimed.fetch_add(1, Ordering::Relaxed);
                info!(case_id = %case_id, "reclaimed stalled case");
                reclaimed.push(case_id);
            }
        }
        Ok(reclaimed)
    }

    /// One pass of originator-side result retrieval. Returns the number of
    /// cases received.
    ///
    /// A failing `receive` leaves the case `PROCESSED`; it is retried on
    /// the next scan, which is why adapters' `receive` must be idempotent.
    ///
    /// # Errors
    ///
    /// Propagates registry scan failures; per-case failures are absorbed.
    pub async fn receive_once(&self) -> Result<usize> {
        let candidates = self.registry.find_receivable(&self.scope, &self.identity).await?;
        let mut received = 0;
        for record in candidates {
            let Some(adapter) = self.capabilities.adapter(&record.application) else {
                continue;
            };
            if !adapter.provides(AdapterOperation::Receive) {
                continue;
            }
            match self.receive_case(&record).await {
                Ok(true) => received += 1,
                Ok(false) => {}
                Err(error) if error.is_transient() => {
                    debug!(case_id = %record.id, %error, "retrieval deferred");
                }
                Err(error) => {
                    warn!(case_id = %record.id, %error, "retrieval failed; will retry");
                }
            }
        }
        Ok(received)
    }

    async fn receive_case(&self, record: &CaseRecord) -> Result<bool> {
        let adapter = self
            .capabilities
            .adapter(&record.application)
            .ok_or_else(|| Error::config(format!("no adapter for {}", record.application)))?;

        let result = self
            .archive
            .get_result(record.id, &record.origin.user, &record.origin.machine)
            .await?;

        let scratch = tempfile::tempdir()
            .map_err(|e| grid_core::Error::from_io("creating receive scratch", e))?;
        let scratch_path = scratch.path().to_path_buf();
        let unpack_dir = scratch_path.clone();
        let outputs = tokio::task::spawn_blocking(move || bundle::unpack(&result, &unpack_dir))
            .await
            .map_err(|e| grid_core::Error::internal(format!("unpack task failed: {e}")))??;

        adapter.receive(&scratch_path, &outputs).await?;
        drop(scratch);

        let applied = self
            .registry
            .mark_received(record.id, Utc::now())
            .await?
            .is_applied();
        if applied {
            self.counters.received.fetch_add(1, Ordering::Relaxed);
            info!(case_id = %record.id, application = %record.application, "received case results");
            // Originator-driven cleanup: the input/result pair is removed
            // once the received mark has landed.
            self.archive.remove(&record.path).await?;
            self.archive.remove(&record.result_path()).await?;
        }
        Ok(applied)
    }

    /// Handles one worker-pool outcome.
    ///
    /// Completion ordering is critical: the result bundle is uploaded
    /// (atomic rename) before the record transitions, so a result archive
    /// exists from the instant any reader can observe `PROCESSED`.
    ///
    /// # Errors
    ///
    /// Propagates archive/registry failures; the facade logs and drops
    /// them (the case then ages out and is reclaimed).
    pub async fn handle_outcome(&self, outcome: JobOutcome) -> Result<()> {
        match outcome {
            JobOutcome::Completed { case_id, result } => {
                let Some(record) = self.registry.get(case_id).await? else {
                    debug!(case_id = %case_id, "completed case no longer exists; discarding result");
                    return Ok(());
                };
                self.archive
                    .put_result(case_id, &record.origin.user, &record.origin.machine, result)
                    .await?;

                if self
                    .registry
                    .complete(case_id, &self.identity, Utc::now())
                    .await?
                    .is_applied()
                {
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    info!(case_id = %case_id, "completed case");
                } else {
                    // Reclaimed while uploading; the orphan result at the
                    // canonical path is overwritten by the next processor.
                    debug!(case_id = %case_id, "completion superseded by reclamation");
                }
            }
            JobOutcome::AdapterFailed {
                case_id,
                application,
                message,
            } => {
                // Equivalent to a silent crash from the grid's perspective:
                // the case stays PROCESSING until reclaimed after the grace.
                self.counters.adapter_failures.fetch_add(1, Ordering::Relaxed);
                warn!(case_id = %case_id, application = %application, message = %message,
                    "adapter failed; case left for reclamation");
            }
            JobOutcome::Cancelled { case_id } => {
                debug!(case_id = %case_id, "job cancelled; outputs discarded");
            }
        }
        Ok(())
    }

    /// Submits a user selection for the given application.
    ///
    /// The adapter's `send` expands the selection into input-bundle specs;
    /// each bundle is zipped, uploaded, and only then inserted into the
    /// registry, so every visible record has its input archive.
    ///
    /// # Errors
    ///
    /// Fails if no local adapter implements `send` for the application, or
    /// on archive/registry failures.
    pub async fn submit(
        &self,
        application: &str,
        selection: &[std::path::PathBuf],
    ) -> Result<Vec<CaseId>> {
        let adapter = self
            .capabilities
            .adapter(application)
            .ok_or_else(|| Error::config(format!("no local adapter for '{application}'")))?;
        if !adapter.provides(AdapterOperation::Send) {
            return Err(Error::config(format!(
                "adapter '{application}' does not implement send"
            )));
        }

        let bundles = adapter.send(selection).await?;
        let mut ids = Vec::with_capacity(bundles.len());
        for files in bundles {
            let bytes = tokio::task::spawn_blocking(move || bundle::pack(&files))
                .await
                .map_err(|e| grid_core::Error::internal(format!("pack task failed: {e}")))??;

            let case_id = CaseId::generate();
            let path = self
                .archive
                .put_input(case_id, &self.identity.user, &self.identity.machine, bytes)
                .await?;

            let record = CaseRecord::new(
                case_id,
                &self.scope,
                application,
                path,
                CaseOrigin::new(&self.identity, Utc::now()),
            );
            self.registry.insert(record).await?;
            self.counters.submitted.fetch_add(1, Ordering::Relaxed);
            info!(case_id = %case_id, application = %application, "submitted case");
            ids.push(case_id);
        }
        Ok(ids)
    }
}
