//! Single-machine GridCompute node.
//!
//! Runs a complete node (submitter, processor, receiver) against the
//! shared folder named by the pointer file, with an in-memory registry.
//! This is the standalone mode for trying a grid on one machine; grid
//! deployments attach their document-store registry behind the same
//! [`grid_engine::CaseRegistry`] trait.

use std::path::PathBuf;
use std::sync::Arc;

use grid_core::{FsArchive, Identity, LogFormat, init_logging};
use grid_engine::capability::ApplicationAdapter;
use grid_engine::config::GridConfig;
use grid_engine::error::{Error, Result};
use grid_engine::registry::memory::InMemoryRegistry;
use grid_engine::{CapabilityIndex, GridNode, LifecycleEngine, WorkerPool, adapter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn log_format_from_env() -> LogFormat {
    match std::env::var("GRID_LOG_FORMAT") {
        Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| Error::config(format!("invalid {key}: '{value}'"))),
        Err(_) => Ok(None),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(log_format_from_env());

    let pointer =
        PathBuf::from(optional_env("GRID_POINTER_FILE").unwrap_or_else(|| "server.txt".to_string()));
    let identity = Identity::detect();

    let mut config = GridConfig::load(&pointer, &identity.machine)?;
    if let Some(capacity) = parse_env("GRID_CAPACITY")? {
        config.capacity = capacity;
    }
    if let Some(max_attempts) = parse_env("GRID_MAX_ATTEMPTS")? {
        config.max_attempts = Some(max_attempts);
    }

    let adapters: Vec<Arc<dyn ApplicationAdapter>> = adapter::discover(&config.applications_dir())?
        .into_iter()
        .map(|script| Arc::new(script) as Arc<dyn ApplicationAdapter>)
        .collect();
    let capabilities = CapabilityIndex::new(config.allowed_applications.clone(), adapters);

    let archive = Arc::new(FsArchive::new(&config.shared_root));
    let registry = Arc::new(InMemoryRegistry::new());
    let (pool, outcomes) = WorkerPool::new(config.capacity);

    let mut engine = LifecycleEngine::new(
        registry,
        archive,
        capabilities,
        pool,
        identity,
        config.scope.clone(),
        config.timing.clone(),
    )?;
    if let Some(max_attempts) = config.max_attempts {
        engine = engine.with_max_attempts(max_attempts);
    }

    let node = GridNode::start(engine, outcomes, VERSION).await?;
    tracing::info!(version = VERSION, "grid node running; press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| grid_core::Error::from_io("waiting for ctrl-c", e))?;
    node.shutdown().await;
    Ok(())
}
