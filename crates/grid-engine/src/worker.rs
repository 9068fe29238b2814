//! Bounded concurrent execution of adapter `process` invocations.
//!
//! The pool owns the local side of a claim: it materializes the input
//! bundle into a fresh scratch directory, runs the adapter, packs the
//! declared outputs, and reports a [`JobOutcome`] on its channel. The
//! scratch directory is reclaimed on every exit path.
//!
//! Capacity is live-adjustable: lowering it never interrupts running jobs,
//! raising it lets the next poll claim more. `pause` stops acceptance
//! without killing anything.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use grid_core::archive::CaseArchive;
use grid_core::paths::ArchivePath;
use grid_core::{CaseId, bundle};

use crate::capability::ApplicationAdapter;
use crate::error::{Error, Result};

/// Descriptor of a successfully claimed case, handed from the scheduler.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// The claimed case.
    pub case_id: CaseId,
    /// Adapter to run.
    pub application: String,
    /// Canonical input bundle location.
    pub input_path: ArchivePath,
}

/// Terminal report of one job.
#[derive(Debug)]
pub enum JobOutcome {
    /// The adapter succeeded; `result` is the packed result bundle.
    Completed {
        /// The processed case.
        case_id: CaseId,
        /// Packed result bundle, ready for upload.
        result: Bytes,
    },
    /// The adapter (or the job around it) failed. The case is left
    /// `PROCESSING`; reclamation will retry it elsewhere.
    AdapterFailed {
        /// The failed case.
        case_id: CaseId,
        /// Adapter that failed.
        application: String,
        /// Captured diagnostics.
        message: String,
    },
    /// The job was cancelled locally; outputs were discarded.
    Cancelled {
        /// The cancelled case.
        case_id: CaseId,
    },
}

impl JobOutcome {
    /// Returns the case this outcome belongs to.
    #[must_use]
    pub const fn case_id(&self) -> CaseId {
        match self {
            Self::Completed { case_id, .. }
            | Self::AdapterFailed { case_id, .. }
            | Self::Cancelled { case_id } => *case_id,
        }
    }
}

/// Status projection of one running job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    /// The case being processed.
    pub case_id: CaseId,
    /// Adapter running it.
    pub application: String,
    /// When the job started locally.
    pub started_at: DateTime<Utc>,
}

struct RunningJob {
    application: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

struct PoolInner {
    capacity: AtomicUsize,
    accepting: std::sync::atomic::AtomicBool,
    jobs: Mutex<HashMap<CaseId, RunningJob>>,
    outcomes: mpsc::Sender<JobOutcome>,
}

impl PoolInner {
    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<CaseId, RunningJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Local concurrency controller for adapter invocations.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Creates a pool with the given initial capacity, returning the pool
    /// and the receiving end of its outcome channel.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<JobOutcome>) {
        let (tx, rx) = mpsc::channel(capacity.max(8) * 2);
        let pool = Self {
            inner: Arc::new(PoolInner {
                capacity: AtomicUsize::new(capacity),
                accepting: std::sync::atomic::AtomicBool::new(true),
                jobs: Mutex::new(HashMap::new()),
                outcomes: tx,
            }),
        };
        (pool, rx)
    }

    /// Sets the concurrency cap. Lowering it never interrupts running jobs.
    pub fn set_capacity(&self, capacity: usize) {
        self.inner.capacity.store(capacity, Ordering::SeqCst);
    }

    /// Returns the concurrency cap.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity.load(Ordering::SeqCst)
    }

    /// Stops accepting new jobs without killing running ones.
    pub fn pause(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
    }

    /// Re-enables job acceptance.
    pub fn resume(&self) {
        self.inner.accepting.store(true, Ordering::SeqCst);
    }

    /// Returns true if the pool currently accepts new jobs.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Returns how many more jobs the pool would accept right now.
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.capacity().saturating_sub(self.inner.jobs().len())
    }

    /// Returns the number of running jobs.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.inner.jobs().len()
    }

    /// Returns the case IDs of running jobs.
    #[must_use]
    pub fn active_case_ids(&self) -> Vec<CaseId> {
        self.inner.jobs().keys().copied().collect()
    }

    /// Returns a status snapshot of running jobs.
    #[must_use]
    pub fn running(&self) -> Vec<JobStatus> {
        self.inner
            .jobs()
            .iter()
            .map(|(case_id, job)| JobStatus {
                case_id: *case_id,
                application: job.application.clone(),
                started_at: job.started_at,
            })
            .collect()
    }

    /// Cancels a running job: the adapter invocation is terminated and the
    /// scratch directory reclaimed. Returns false if the job is not running.
    pub fn cancel(&self, case_id: CaseId) -> bool {
        let jobs = self.inner.jobs();
        if let Some(job) = jobs.get(&case_id) {
            job.cancel.cancel();
            true
        } else {
            false
        }
    }

    /// Cancels every running job.
    pub fn cancel_all(&self) {
        for job in self.inner.jobs().values() {
            job.cancel.cancel();
        }
    }

    /// Accepts a claimed job and runs it.
    ///
    /// The scheduler consults acceptance and free capacity before claiming,
    /// so rejection here only guards against races.
    ///
    /// # Errors
    ///
    /// Fails if the pool is paused, saturated, or already running this case.
    pub fn submit(
        &self,
        job: JobSpec,
        adapter: Arc<dyn ApplicationAdapter>,
        archive: Arc<dyn CaseArchive>,
    ) -> Result<()> {
        if !self.is_accepting() {
            return Err(Error::worker_pool("pool is not accepting jobs"));
        }

        let cancel = CancellationToken::new();
        {
            let mut jobs = self.inner.jobs();
            if jobs.len() >= self.capacity() {
                return Err(Error::worker_pool("pool is at capacity"));
            }
            if jobs.contains_key(&job.case_id) {
                return Err(Error::worker_pool(format!(
                    "case {} is already running",
                    job.case_id
                )));
            }
            jobs.insert(
                job.case_id,
                RunningJob {
                    application: job.application.clone(),
                    started_at: Utc::now(),
                    cancel: cancel.clone(),
                },
            );
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(run_job(inner, cancel, job, adapter, archive));
        Ok(())
    }
}

async fn run_job(
    inner: Arc<PoolInner>,
    cancel: CancellationToken,
    job: JobSpec,
    adapter: Arc<dyn ApplicationAdapter>,
    archive: Arc<dyn CaseArchive>,
) {
    let case_id = job.case_id;
    let application = job.application.clone();

    let outcome = tokio::select! {
        () = cancel.cancelled() => JobOutcome::Cancelled { case_id },
        result = execute(&job, adapter.as_ref(), archive.as_ref()) => match result {
            Ok(result) => JobOutcome::Completed { case_id, result },
            Err(error) => JobOutcome::AdapterFailed {
                case_id,
                application,
                message: error.to_string(),
            },
        },
    };

    inner.jobs().remove(&case_id);
    // The receiver going away means the node is shutting down; outcomes are
    // then intentionally discarded.
    let _ = inner.outcomes.send(outcome).await;
}

async fn execute(
    job: &JobSpec,
    adapter: &dyn ApplicationAdapter,
    archive: &dyn CaseArchive,
) -> Result<Bytes> {
    let input = archive.get(&job.input_path).await?;

    let scratch = tempfile::tempdir()
        .map_err(|e| grid_core::Error::from_io("creating scratch directory", e))?;
    let scratch_path = scratch.path().to_path_buf();

    let unpack_dir = scratch_path.clone();
    let inputs = tokio::task::spawn_blocking(move || bundle::unpack(&input, &unpack_dir))
        .await
        .map_err(|e| grid_core::Error::internal(format!("unpack task failed: {e}")))??;

    let outputs = adapter.process(&scratch_path, &inputs).await?;

    for output in &outputs {
        if !output.starts_with(&scratch_path) {
            return Err(Error::adapter_failed(
                &job.application,
                format!("declared output outside scratch: {}", output.display()),
            ));
        }
        if !output.exists() {
            return Err(Error::adapter_failed(
                &job.application,
                format!("declared output missing: {}", output.display()),
            ));
        }
    }

    let to_pack: Vec<PathBuf> = outputs;
    let result = tokio::task::spawn_blocking(move || bundle::pack(&to_pack))
        .await
        .map_err(|e| grid_core::Error::internal(format!("pack task failed: {e}")))??;

    drop(scratch);
    Ok(result)
}
