//! Capability index and the application adapter contract.
//!
//! An application is a named set of three operations:
//!
//! - `send`: turn a user selection into one or more input-bundle specs
//! - `process`: run the computation in a scratch directory
//! - `receive`: apply results on the originator machine
//!
//! The [`CapabilityIndex`] answers "what may this machine process":
//! the intersection of the operator's machine/application matrix with the
//! adapters actually present locally. Adapters without `process` can still
//! submit and receive.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// One of the three adapter operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterOperation {
    /// Turn a user selection into input-bundle specs.
    Send,
    /// Run the computation.
    Process,
    /// Apply results on the originator.
    Receive,
}

/// An ordered list of files/directories forming one case's input.
pub type InputBundle = Vec<PathBuf>;

/// The per-application capability object.
///
/// `receive` runs on the originator at arbitrary times after completion and
/// may run more than once for the same case (the originator can crash
/// between `receive` finishing and the received mark landing), so it MUST
/// be idempotent. The engine surfaces this requirement to adapter authors;
/// it cannot enforce it.
#[async_trait]
pub trait ApplicationAdapter: Send + Sync {
    /// The application ID this adapter implements.
    fn application(&self) -> &str;

    /// Returns true if the adapter implements the given operation.
    fn provides(&self, _operation: AdapterOperation) -> bool {
        true
    }

    /// Expands a user selection into input-bundle specs, one per case.
    async fn send(&self, selection: &[PathBuf]) -> Result<Vec<InputBundle>>;

    /// Processes a case inside `scratch`, given the materialized input
    /// files in declared order. Returns the declared output paths, which
    /// must live under `scratch`.
    async fn process(&self, scratch: &Path, inputs: &[PathBuf]) -> Result<Vec<PathBuf>>;

    /// Applies unpacked outputs on the originator machine.
    async fn receive(&self, scratch: &Path, outputs: &[PathBuf]) -> Result<()>;
}

/// Read-only snapshot of what this machine may run.
///
/// Loaded once at startup; reloading the matrix is a restart-level event.
#[derive(Clone)]
pub struct CapabilityIndex {
    allowed: BTreeSet<String>,
    adapters: HashMap<String, Arc<dyn ApplicationAdapter>>,
}

impl CapabilityIndex {
    /// Builds an index from the matrix row for this machine and the locally
    /// available adapters.
    #[must_use]
    pub fn new(
        allowed: BTreeSet<String>,
        adapters: impl IntoIterator<Item = Arc<dyn ApplicationAdapter>>,
    ) -> Self {
        let adapters = adapters
            .into_iter()
            .map(|adapter| (adapter.application().to_string(), adapter))
            .collect();
        Self { allowed, adapters }
    }

    /// Applications this machine may process: matrix row ∩ local adapters
    /// implementing `process`.
    #[must_use]
    pub fn supported_applications(&self) -> BTreeSet<String> {
        self.adapters
            .values()
            .filter(|adapter| adapter.provides(AdapterOperation::Process))
            .map(|adapter| adapter.application().to_string())
            .filter(|application| self.allowed.contains(application))
            .collect()
    }

    /// Returns the local adapter for an application, if present.
    ///
    /// Submission and retrieval use local adapters regardless of the
    /// processing matrix, so no `allowed` filter here.
    #[must_use]
    pub fn adapter(&self, application: &str) -> Option<Arc<dyn ApplicationAdapter>> {
        self.adapters.get(application).cloned()
    }

    /// Returns the IDs of all locally present adapters.
    #[must_use]
    pub fn local_applications(&self) -> BTreeSet<String> {
        self.adapters.keys().cloned().collect()
    }
}

impl std::fmt::Debug for CapabilityIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityIndex")
            .field("allowed", &self.allowed)
            .field("local", &self.local_applications())
            .finish()
    }
}

/// An adapter that declares its inputs as its outputs.
///
/// `send` maps each selected file to its own single-file case. `receive`
/// copies outputs into an optional destination directory, overwriting
/// (idempotent). Used by tests and the identity round-trip law.
#[derive(Debug)]
pub struct EchoAdapter {
    application: String,
    receive_dir: Option<PathBuf>,
}

impl EchoAdapter {
    /// Creates an echo adapter for the given application ID.
    #[must_use]
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            receive_dir: None,
        }
    }

    /// Sets a directory into which `receive` copies outputs.
    #[must_use]
    pub fn with_receive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.receive_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl ApplicationAdapter for EchoAdapter {
    fn application(&self) -> &str {
        &self.application
    }

    async fn send(&self, selection: &[PathBuf]) -> Result<Vec<InputBundle>> {
        Ok(selection.iter().map(|file| vec![file.clone()]).collect())
    }

    async fn process(&self, _scratch: &Path, inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
        Ok(inputs.to_vec())
    }

    async fn receive(&self, _scratch: &Path, outputs: &[PathBuf]) -> Result<()> {
        let Some(dir) = &self.receive_dir else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| grid_core::Error::from_io("creating receive directory", e))?;
        for output in outputs {
            let name = output.file_name().ok_or_else(|| {
                Error::adapter_failed(&self.application, "output without a file name")
            })?;
            tokio::fs::copy(output, dir.join(name))
                .await
                .map_err(|e| grid_core::Error::from_io("copying received output", e))?;
        }
        Ok(())
    }
}

/// An adapter whose `process` always fails, for retry-path tests.
#[derive(Debug)]
pub struct FailingAdapter {
    application: String,
    message: String,
}

impl FailingAdapter {
    /// Creates a failing adapter with the given diagnostic message.
    #[must_use]
    pub fn new(application: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl ApplicationAdapter for FailingAdapter {
    fn application(&self) -> &str {
        &self.application
    }

    async fn send(&self, selection: &[PathBuf]) -> Result<Vec<InputBundle>> {
        Ok(selection.iter().map(|file| vec![file.clone()]).collect())
    }

    async fn process(&self, _scratch: &Path, _inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
        Err(Error::adapter_failed(&self.application, self.message.clone()))
    }

    async fn receive(&self, _scratch: &Path, _outputs: &[PathBuf]) -> Result<()> {
        Ok(())
    }
}
