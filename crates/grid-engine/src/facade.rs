//! Per-process orchestration facade.
//!
//! [`GridNode`] wires the lifecycle engine to its loops: poll/claim,
//! heartbeat, reclamation, retrieval, and outcome handling each run on
//! their own jittered timer (heartbeats on a dedicated task so they are
//! never starved by long scans). The facade also performs the startup
//! version handshake, surfaces status projections for UI collaborators,
//! and owns clean shutdown.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use grid_core::CaseId;

use crate::case::CaseStatus;
use crate::error::{Error, Result};
use crate::registry::{CaseRegistry, VersionGate};
use crate::scheduler::{CountersSnapshot, LifecycleEngine};
use crate::worker::{JobOutcome, JobStatus};

/// Queries the version gate and applies its policy: `REFUSED` is fatal,
/// `WARNING` surfaces the message and continues, anything else is silent.
///
/// # Errors
///
/// Fails with [`Error::VersionRefused`] when the registry refuses this
/// version, or propagates registry failures.
pub async fn version_handshake(registry: &Arc<dyn CaseRegistry>, version: &str) -> Result<()> {
    match registry.query_version(version).await? {
        VersionGate::Refused(message) => Err(Error::VersionRefused { message }),
        VersionGate::Warning(message) => {
            warn!(version = %version, message = %message, "version warning from registry");
            Ok(())
        }
        VersionGate::Allowed | VersionGate::Uncontrolled => Ok(()),
    }
}

/// Projection of one case owned by the local user, for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct CaseSummary {
    /// The case.
    pub id: CaseId,
    /// Application processing it.
    pub application: String,
    /// Lifecycle status.
    pub status: CaseStatus,
    /// Machine on the other side of the exchange (last processor), if any.
    pub counterparty_machine: Option<String>,
    /// When the case was submitted.
    pub submitted_at: DateTime<Utc>,
    /// Position in the scope-wide wait queue, for `TO_PROCESS` cases.
    pub queue_position: Option<usize>,
}

/// One row of the per-scope case report.
#[derive(Debug, Clone, Serialize)]
pub struct CaseReportRow {
    /// The case.
    pub id: CaseId,
    /// Grid instance the case belongs to.
    pub instance: String,
    /// Application processing it.
    pub application: String,
    /// Canonical input bundle location.
    pub path: String,
    /// Lifecycle status.
    pub status: CaseStatus,
    /// Last liveness signal, while processing.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Originating user.
    pub origin_user: String,
    /// Originating machine.
    pub origin_machine: String,
    /// When the case was submitted.
    pub submitted_at: DateTime<Utc>,
    /// When the current attempt started.
    pub processing_started_at: Option<DateTime<Utc>>,
    /// When the current attempt ended.
    pub processing_ended_at: Option<DateTime<Utc>>,
    /// When the originator received the results.
    pub received_at: Option<DateTime<Utc>>,
    /// Every processor that attempted the case, as `user@machine`.
    pub attempts: Vec<String>,
}

impl CaseReportRow {
    /// Tab-separated header matching [`Self::to_tsv_line`].
    pub const TSV_HEADER: &'static str = "Id\tInstance\tApplication\tPath\tStatus\tLast heartbeat\tOrigin user\tOrigin machine\tSubmitted\tProcessing started\tProcessing ended\tReceived\tAttempts";

    /// Renders the row as a tab-separated line.
    #[must_use]
    pub fn to_tsv_line(&self) -> String {
        let time = |value: &Option<DateTime<Utc>>| {
            value.map(|t| t.to_rfc3339()).unwrap_or_default()
        };
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.id,
            self.instance,
            self.application,
            self.path,
            self.status,
            time(&self.last_heartbeat),
            self.origin_user,
            self.origin_machine,
            self.submitted_at.to_rfc3339(),
            time(&self.processing_started_at),
            time(&self.processing_ended_at),
            time(&self.received_at),
            self.attempts.join(","),
        )
    }
}

/// A running grid node: the engine plus its loops.
pub struct GridNode {
    engine: Arc<LifecycleEngine>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for GridNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridNode").finish_non_exhaustive()
    }
}

impl GridNode {
    /// Performs the version handshake and starts the node's loops.
    ///
    /// `outcomes` is the receiving end of the engine's worker pool,
    /// obtained from [`crate::worker::WorkerPool::new`].
    ///
    /// # Errors
    ///
    /// Fails if the registry refuses this program version.
    pub async fn start(
        engine: LifecycleEngine,
        outcomes: mpsc::Receiver<JobOutcome>,
        version: &str,
    ) -> Result<Self> {
        version_handshake(engine.registry(), version).await?;

        let engine = Arc::new(engine);
        info!(
            identity = %engine.identity(),
            scope = %engine.scope(),
            "grid node starting"
        );

        let (shutdown, _) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(poll_loop(Arc::clone(&engine), shutdown.subscribe())),
            tokio::spawn(heartbeat_loop(Arc::clone(&engine), shutdown.subscribe())),
            tokio::spawn(reclaim_loop(Arc::clone(&engine), shutdown.subscribe())),
            tokio::spawn(receive_loop(Arc::clone(&engine), shutdown.subscribe())),
            tokio::spawn(outcome_loop(
                Arc::clone(&engine),
                outcomes,
                shutdown.subscribe(),
            )),
        ];

        Ok(Self {
            engine,
            shutdown,
            tasks,
        })
    }

    /// Returns the engine (submission, direct access in tests).
    #[must_use]
    pub fn engine(&self) -> &Arc<LifecycleEngine> {
        &self.engine
    }

    /// Submits a user selection for the given application.
    ///
    /// # Errors
    ///
    /// See [`LifecycleEngine::submit`].
    pub async fn submit(
        &self,
        application: &str,
        selection: &[std::path::PathBuf],
    ) -> Result<Vec<CaseId>> {
        self.engine.submit(application, selection).await
    }

    /// Cases owned by the local user that are still in flight, with their
    /// wait-queue position while unclaimed.
    ///
    /// # Errors
    ///
    /// Propagates registry scan failures.
    pub async fn my_cases(&self) -> Result<Vec<CaseSummary>> {
        let identity = self.engine.identity().clone();
        let records = self
            .engine
            .registry()
            .cases_in_scope(self.engine.scope())
            .await?;

        let mut summaries = Vec::new();
        let mut waiting = 0usize;
        for record in records {
            if record.status == CaseStatus::ToProcess {
                waiting += 1;
            }
            if record.origin.machine != identity.machine || record.origin.user != identity.user {
                continue;
            }
            if record.status == CaseStatus::Received {
                continue;
            }
            summaries.push(CaseSummary {
                id: record.id,
                application: record.application.clone(),
                status: record.status,
                counterparty_machine: record
                    .processors
                    .attempts
                    .last()
                    .map(|attempt| attempt.machine.clone()),
                submitted_at: record.origin.submitted_at,
                queue_position: (record.status == CaseStatus::ToProcess).then_some(waiting),
            });
        }
        Ok(summaries)
    }

    /// Jobs currently running on this machine.
    #[must_use]
    pub fn local_jobs(&self) -> Vec<JobStatus> {
        self.engine.pool().running()
    }

    /// Node event counters.
    #[must_use]
    pub fn counters(&self) -> CountersSnapshot {
        self.engine.counters()
    }

    /// Full per-case report for the node's scope, in submission order.
    ///
    /// # Errors
    ///
    /// Propagates registry scan failures.
    pub async fn case_report(&self) -> Result<Vec<CaseReportRow>> {
        let records = self
            .engine
            .registry()
            .cases_in_scope(self.engine.scope())
            .await?;
        Ok(records
            .into_iter()
            .map(|record| CaseReportRow {
                id: record.id,
                instance: record.instance.clone(),
                application: record.application.clone(),
                path: record.path.to_string(),
                status: record.status,
                last_heartbeat: record.last_heartbeat,
                origin_user: record.origin.user.clone(),
                origin_machine: record.origin.machine.clone(),
                submitted_at: record.origin.submitted_at,
                processing_started_at: record
                    .processors
                    .current
                    .as_ref()
                    .map(|current| current.started_at),
                processing_ended_at: record
                    .processors
                    .current
                    .as_ref()
                    .and_then(|current| current.ended_at),
                received_at: record.origin.received_at,
                attempts: record
                    .processors
                    .attempts
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            })
            .collect())
    }

    /// Stops the node cleanly: no new claims, in-flight jobs cancelled,
    /// heartbeats flushed, loops joined.
    pub async fn shutdown(mut self) {
        info!(identity = %self.engine.identity(), "grid node shutting down");
        self.engine.pool().pause();
        // Flush heartbeats so claims stay fresh if the node restarts fast.
        self.engine.heartbeat_once().await;
        self.engine.pool().cancel_all();
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Adds up to 20% random jitter so nodes started together do not scan the
/// registry in lockstep.
fn jittered(base: std::time::Duration) -> std::time::Duration {
    let base_millis = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let jitter = rand::thread_rng().gen_range(0..=base_millis / 5 + 1);
    base + std::time::Duration::from_millis(jitter)
}

macro_rules! loop_body {
    ($shutdown:ident, $interval:expr, $tick:expr) => {
        loop {
            tokio::select! {
                _ = $shutdown.changed() => break,
                () = tokio::time::sleep(jittered($interval)) => { $tick; }
            }
        }
    };
}

async fn poll_loop(engine: Arc<LifecycleEngine>, mut shutdown: watch::Receiver<bool>) {
    loop_body!(shutdown, engine.timing().poll_interval, {
        if let Err(err) = engine.poll_once().await {
            if err.is_transient() {
                tracing::debug!(error = %err, "poll deferred");
            } else {
                error!(error = %err, "poll failed");
            }
        }
    });
}

async fn heartbeat_loop(engine: Arc<LifecycleEngine>, mut shutdown: watch::Receiver<bool>) {
    loop_body!(shutdown, engine.timing().heartbeat_interval, {
        engine.heartbeat_once().await;
    });
}

async fn reclaim_loop(engine: Arc<LifecycleEngine>, mut shutdown: watch::Receiver<bool>) {
    loop_body!(shutdown, engine.timing().reclaim_scan_interval(), {
        if let Err(err) = engine.reclaim_once().await {
            if err.is_transient() {
                tracing::debug!(error = %err, "reclamation scan deferred");
            } else {
                error!(error = %err, "reclamation scan failed");
            }
        }
    });
}

async fn receive_loop(engine: Arc<LifecycleEngine>, mut shutdown: watch::Receiver<bool>) {
    loop_body!(shutdown, engine.timing().poll_interval, {
        if let Err(err) = engine.receive_once().await {
            if err.is_transient() {
                tracing::debug!(error = %err, "retrieval scan deferred");
            } else {
                error!(error = %err, "retrieval scan failed");
            }
        }
    });
}

async fn outcome_loop(
    engine: Arc<LifecycleEngine>,
    mut outcomes: mpsc::Receiver<JobOutcome>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            outcome = outcomes.recv() => {
                let Some(outcome) = outcome else { break };
                let case_id = outcome.case_id();
                if let Err(err) = engine.handle_outcome(outcome).await {
                    // The case stays PROCESSING and ages out; reclamation
                    // retries it elsewhere.
                    warn!(case_id = %case_id, error = %err, "outcome handling failed");
                }
            }
        }
    }
}
