//! End-to-end node runtime: real loops, version handshake, projections,
//! and clean shutdown over the in-memory grid.

mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use grid_core::{GridScope, Identity};
use grid_engine::capability::{ApplicationAdapter, CapabilityIndex};
use grid_engine::case::CaseStatus;
use grid_engine::error::Error;
use grid_engine::registry::{CaseRegistry, VersionRecord, VersionStatus};
use grid_engine::scheduler::{LifecycleEngine, TimingConfig};
use grid_engine::worker::{JobOutcome, WorkerPool};
use grid_engine::GridNode;

use support::{MarkerAdapter, fast_timing, grid, scope, selection_file};

fn build_engine(
    machine: &str,
    registry: Arc<dyn CaseRegistry>,
    archive: Arc<dyn grid_core::archive::CaseArchive>,
    adapters: Vec<Arc<dyn ApplicationAdapter>>,
    allowed: &[&str],
    timing: TimingConfig,
) -> (LifecycleEngine, mpsc::Receiver<JobOutcome>) {
    let allowed = allowed.iter().map(|s| (*s).to_string()).collect();
    let (pool, outcomes) = WorkerPool::new(2);
    let engine = LifecycleEngine::new(
        registry,
        archive,
        CapabilityIndex::new(allowed, adapters),
        pool,
        Identity::new(machine, "griduser"),
        scope(),
        timing,
    )
    .unwrap();
    (engine, outcomes)
}

/// Claiming is live: with loops running, a submitted case reaches RECEIVED
/// without any manual driving, and the projections reflect it.
#[tokio::test]
async fn node_processes_own_submission_end_to_end() {
    let (registry, archive) = grid();
    let recv_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();

    // One machine playing submitter, processor, and receiver at once.
    let (engine, outcomes) = build_engine(
        "solo",
        registry.clone(),
        archive,
        vec![Arc::new(
            MarkerAdapter::new("app1", "solo").with_receive_dir(recv_dir.path()),
        )],
        &["app1"],
        fast_timing(),
    );
    let node = GridNode::start(engine, outcomes, "0.1.0").await.unwrap();

    let input = selection_file(work_dir.path(), "input.txt", "payload");
    let case_id = node.submit("app1", &[input]).await.unwrap()[0];

    let summaries = node.my_cases().await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].id, case_id);

    // Bounded-time liveness: the loops carry the case to RECEIVED.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let record = registry.get(case_id).await.unwrap().unwrap();
        if record.status == CaseStatus::Received {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "case stuck in {} after 10s",
            record.status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let counters = node.counters();
    assert_eq!(counters.submitted, 1);
    assert_eq!(counters.claimed, 1);
    assert_eq!(counters.completed, 1);
    assert_eq!(counters.received, 1);

    // Received cases leave the "my cases" projection; the report keeps them.
    assert!(node.my_cases().await.unwrap().is_empty());
    let report = node.case_report().await.unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].status, CaseStatus::Received);
    assert_eq!(report[0].attempts, vec!["griduser@solo".to_string()]);
    assert!(node.local_jobs().is_empty());

    node.shutdown().await;
}

/// The startup handshake refuses a gated version, and starts silently once
/// the record is gone.
#[tokio::test]
async fn version_handshake_gates_startup() {
    let (registry, archive) = grid();
    registry
        .set_versions(vec![VersionRecord {
            id: "1.0.0".to_string(),
            status: VersionStatus::Refused,
            message: Some("too old for this grid".to_string()),
        }])
        .unwrap();

    let (engine, outcomes) = build_engine(
        "solo",
        registry.clone(),
        archive.clone(),
        vec![Arc::new(MarkerAdapter::new("app1", "solo"))],
        &["app1"],
        fast_timing(),
    );
    let err = GridNode::start(engine, outcomes, "1.0.0").await.unwrap_err();
    assert!(matches!(err, Error::VersionRefused { .. }));

    // Record removed: the same startup succeeds silently.
    registry.set_versions(vec![]).unwrap();
    let (engine, outcomes) = build_engine(
        "solo",
        registry,
        archive,
        vec![Arc::new(MarkerAdapter::new("app1", "solo"))],
        &["app1"],
        fast_timing(),
    );
    let node = GridNode::start(engine, outcomes, "1.0.0").await.unwrap();
    node.shutdown().await;
}

/// Startup refuses timing where the heartbeat interval is not strictly
/// less than half the reclamation grace.
#[test]
fn engine_refuses_heartbeat_slower_than_half_grace() {
    let (registry, archive) = grid();
    let (pool, _outcomes) = WorkerPool::new(1);
    let timing = TimingConfig {
        poll_interval: Duration::from_secs(1),
        heartbeat_interval: Duration::from_secs(60),
        reclaim_grace: Duration::from_secs(120),
    };

    let result = LifecycleEngine::new(
        registry as Arc<dyn CaseRegistry>,
        archive,
        CapabilityIndex::new(Default::default(), Vec::<Arc<dyn ApplicationAdapter>>::new()),
        pool,
        Identity::new("solo", "griduser"),
        GridScope::new("acme", "test").unwrap(),
        timing,
    );
    assert!(matches!(result, Err(Error::Config { .. })));
}
