//! Shared helpers for the multi-machine simulation tests.
//!
//! A simulated grid is several [`LifecycleEngine`]s sharing one in-memory
//! registry and one in-memory archive; each engine plays one machine, and
//! tests drive the engines' single-pass duties directly for determinism.

// Each integration test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use grid_core::archive::CaseArchive;
use grid_core::{CaseId, GridScope, Identity, MemoryArchive};
use grid_engine::capability::{ApplicationAdapter, CapabilityIndex, InputBundle};
use grid_engine::error::Result;
use grid_engine::registry::memory::InMemoryRegistry;
use grid_engine::registry::{CasOutcome, CaseRegistry, VersionGate};
use grid_engine::scheduler::{LifecycleEngine, TimingConfig};
use grid_engine::worker::{JobOutcome, WorkerPool};

/// Grace used across the simulation: short enough for wall-clock tests.
pub const GRACE: Duration = Duration::from_millis(600);

/// The scope every simulated machine runs in.
pub fn scope() -> GridScope {
    GridScope::new("acme", "test").unwrap()
}

/// Timing with a short grace for wall-clock reclamation tests.
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        poll_interval: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(100),
        reclaim_grace: GRACE,
    }
}

/// One simulated machine: an engine plus its outcome channel.
pub struct TestNode {
    pub engine: LifecycleEngine,
    pub outcomes: mpsc::Receiver<JobOutcome>,
}

impl TestNode {
    /// Builds a node named `machine` over shared registry and archive.
    pub fn new(
        machine: &str,
        registry: Arc<dyn CaseRegistry>,
        archive: Arc<dyn CaseArchive>,
        adapters: Vec<Arc<dyn ApplicationAdapter>>,
        allowed: &[&str],
        capacity: usize,
    ) -> Self {
        let allowed: BTreeSet<String> = allowed.iter().map(|s| (*s).to_string()).collect();
        let (pool, outcomes) = WorkerPool::new(capacity);
        let engine = LifecycleEngine::new(
            registry,
            archive,
            CapabilityIndex::new(allowed, adapters),
            pool,
            Identity::new(machine, "griduser"),
            scope(),
            fast_timing(),
        )
        .unwrap();
        Self { engine, outcomes }
    }

    /// Receives the next job outcome, with a timeout.
    pub async fn next_outcome(&mut self) -> JobOutcome {
        tokio::time::timeout(Duration::from_secs(5), self.outcomes.recv())
            .await
            .expect("timed out waiting for a job outcome")
            .expect("outcome channel closed")
    }

    /// Runs one claim pass, waits for the outcome of every claimed job,
    /// and applies it. Returns how many jobs were claimed.
    pub async fn work_once(&mut self) -> usize {
        let claimed = self.engine.poll_once().await.unwrap();
        for _ in 0..claimed {
            let outcome = self.next_outcome().await;
            self.engine.handle_outcome(outcome).await.unwrap();
        }
        claimed
    }
}

/// An adapter whose `process` stamps outputs with the processing machine,
/// so tests can tell which machine produced a result. `receive` copies
/// outputs into `receive_dir` (idempotent overwrite).
pub struct MarkerAdapter {
    application: String,
    machine: String,
    receive_dir: Option<PathBuf>,
}

impl MarkerAdapter {
    pub fn new(application: &str, machine: &str) -> Self {
        Self {
            application: application.to_string(),
            machine: machine.to_string(),
            receive_dir: None,
        }
    }

    pub fn with_receive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.receive_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl ApplicationAdapter for MarkerAdapter {
    fn application(&self) -> &str {
        &self.application
    }

    async fn send(&self, selection: &[PathBuf]) -> Result<Vec<InputBundle>> {
        Ok(selection.iter().map(|file| vec![file.clone()]).collect())
    }

    async fn process(&self, scratch: &Path, inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let output = scratch.join("result.txt");
        let inputs_listed = inputs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(",");
        tokio::fs::write(&output, format!("processed by {}: {inputs_listed}", self.machine))
            .await
            .map_err(|e| grid_core::Error::from_io("writing marker output", e))?;
        Ok(vec![output])
    }

    async fn receive(&self, _scratch: &Path, outputs: &[PathBuf]) -> Result<()> {
        let Some(dir) = &self.receive_dir else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| grid_core::Error::from_io("creating receive dir", e))?;
        for output in outputs {
            tokio::fs::copy(output, dir.join(output.file_name().unwrap()))
                .await
                .map_err(|e| grid_core::Error::from_io("copying received output", e))?;
        }
        Ok(())
    }
}

/// An adapter whose `process` never returns, standing in for a wedged or
/// crashed computation.
pub struct StuckAdapter {
    application: String,
}

impl StuckAdapter {
    pub fn new(application: &str) -> Self {
        Self {
            application: application.to_string(),
        }
    }
}

#[async_trait]
impl ApplicationAdapter for StuckAdapter {
    fn application(&self) -> &str {
        &self.application
    }

    async fn send(&self, selection: &[PathBuf]) -> Result<Vec<InputBundle>> {
        Ok(selection.iter().map(|file| vec![file.clone()]).collect())
    }

    async fn process(&self, _scratch: &Path, _inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
        std::future::pending().await
    }

    async fn receive(&self, _scratch: &Path, _outputs: &[PathBuf]) -> Result<()> {
        Ok(())
    }
}

/// A node-local view of the shared registry that can be partitioned away,
/// modeling one machine losing the database while the rest of the grid
/// keeps going.
pub struct PartitionedRegistry {
    inner: Arc<InMemoryRegistry>,
    offline: std::sync::atomic::AtomicBool,
}

impl PartitionedRegistry {
    pub fn new(inner: Arc<InMemoryRegistry>) -> Self {
        Self {
            inner,
            offline: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline
            .store(offline, std::sync::atomic::Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(grid_engine::error::Error::transient_registry(
                "partitioned from registry",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CaseRegistry for PartitionedRegistry {
    async fn insert(&self, record: grid_engine::CaseRecord) -> Result<()> {
        self.check()?;
        self.inner.insert(record).await
    }

    async fn get(&self, id: CaseId) -> Result<Option<grid_engine::CaseRecord>> {
        self.check()?;
        self.inner.get(id).await
    }

    async fn find_claimable(
        &self,
        scope: &GridScope,
        applications: &BTreeSet<String>,
    ) -> Result<Vec<grid_engine::CaseRecord>> {
        self.check()?;
        self.inner.find_claimable(scope, applications).await
    }

    async fn claim(
        &self,
        id: CaseId,
        claimer: &Identity,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome> {
        self.check()?;
        self.inner.claim(id, claimer, now).await
    }

    async fn heartbeat(
        &self,
        id: CaseId,
        claimer: &Identity,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome> {
        self.check()?;
        self.inner.heartbeat(id, claimer, now).await
    }

    async fn complete(
        &self,
        id: CaseId,
        claimer: &Identity,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome> {
        self.check()?;
        self.inner.complete(id, claimer, now).await
    }

    async fn reclaim(
        &self,
        id: CaseId,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<CasOutcome> {
        self.check()?;
        self.inner.reclaim(id, now, grace).await
    }

    async fn mark_received(&self, id: CaseId, now: DateTime<Utc>) -> Result<CasOutcome> {
        self.check()?;
        self.inner.mark_received(id, now).await
    }

    async fn delete(&self, id: CaseId) -> Result<()> {
        self.check()?;
        self.inner.delete(id).await
    }

    async fn find_stale_processing(
        &self,
        scope: &GridScope,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Vec<CaseId>> {
        self.check()?;
        self.inner.find_stale_processing(scope, now, grace).await
    }

    async fn find_receivable(
        &self,
        scope: &GridScope,
        origin: &Identity,
    ) -> Result<Vec<grid_engine::CaseRecord>> {
        self.check()?;
        self.inner.find_receivable(scope, origin).await
    }

    async fn cases_in_scope(&self, scope: &GridScope) -> Result<Vec<grid_engine::CaseRecord>> {
        self.check()?;
        self.inner.cases_in_scope(scope).await
    }

    async fn query_version(&self, version: &str) -> Result<VersionGate> {
        self.check()?;
        self.inner.query_version(version).await
    }
}

/// Writes a selection file and returns its path.
pub fn selection_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// Shared in-memory grid substrate.
pub fn grid() -> (Arc<InMemoryRegistry>, Arc<MemoryArchive>) {
    (
        Arc::new(InMemoryRegistry::new()),
        Arc::new(MemoryArchive::new()),
    )
}
