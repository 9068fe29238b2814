//! Subprocess-backed application adapters.
//!
//! Adapters are declared by the shared folder: each application directory
//! under `Settings/Applications/<id>/` carries up to three executables
//! named `send`, `process`, and `receive`. The engine never embeds a
//! scripting runtime; it spawns the executable and speaks a line protocol:
//!
//! - paths are written to the child's stdin, one per line
//! - `send` prints input-bundle specs to stdout, bundles separated by a
//!   blank line
//! - `process` prints declared output paths to stdout (relative paths are
//!   resolved against the scratch directory)
//! - `receive` prints nothing
//!
//! Children are spawned with kill-on-drop so cancelling a job terminates
//! the adapter.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::capability::{AdapterOperation, ApplicationAdapter, InputBundle};
use crate::error::{Error, Result};

/// Executable name for each operation.
const fn program_name(operation: AdapterOperation) -> &'static str {
    match operation {
        AdapterOperation::Send => "send",
        AdapterOperation::Process => "process",
        AdapterOperation::Receive => "receive",
    }
}

/// Which operations an adapter directory provides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptOperations {
    /// `send` executable present.
    pub send: bool,
    /// `process` executable present.
    pub process: bool,
    /// `receive` executable present.
    pub receive: bool,
}

/// An application adapter backed by executables in a shared directory.
#[derive(Debug, Clone)]
pub struct ScriptAdapter {
    application: String,
    dir: PathBuf,
    operations: ScriptOperations,
}

impl ScriptAdapter {
    /// Creates an adapter for the given application directory, probing
    /// which operations it provides.
    #[must_use]
    pub fn new(application: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let operations = ScriptOperations {
            send: dir.join(program_name(AdapterOperation::Send)).is_file(),
            process: dir.join(program_name(AdapterOperation::Process)).is_file(),
            receive: dir.join(program_name(AdapterOperation::Receive)).is_file(),
        };
        Self {
            application: application.into(),
            dir,
            operations,
        }
    }

    /// Returns which operations this adapter provides.
    #[must_use]
    pub const fn operations(&self) -> ScriptOperations {
        self.operations
    }

    async fn run(
        &self,
        operation: AdapterOperation,
        workdir: Option<&Path>,
        lines: &[PathBuf],
    ) -> Result<Vec<String>> {
        let name = program_name(operation);
        let program = self.dir.join(name);
        if !program.is_file() {
            return Err(Error::adapter_failed(
                &self.application,
                format!("adapter has no '{name}' executable"),
            ));
        }

        let mut command = Command::new(&program);
        if let Some(dir) = workdir {
            command.current_dir(dir);
        }
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::adapter_failed(&self.application, format!("spawning '{name}': {e}"))
            })?;

        let mut payload = String::new();
        for line in lines {
            payload.push_str(&line.display().to_string());
            payload.push('\n');
        }
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.as_bytes()).await.map_err(|e| {
                Error::adapter_failed(&self.application, format!("writing to '{name}': {e}"))
            })?;
        }

        let output = child.wait_with_output().await.map_err(|e| {
            Error::adapter_failed(&self.application, format!("waiting for '{name}': {e}"))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .chars()
                .rev()
                .take(400)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            return Err(Error::adapter_failed(
                &self.application,
                format!("'{name}' exited with {}: {}", output.status, tail.trim()),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim_end)
            .map(ToString::to_string)
            .collect())
    }
}

#[async_trait]
impl ApplicationAdapter for ScriptAdapter {
    fn application(&self) -> &str {
        &self.application
    }

    fn provides(&self, operation: AdapterOperation) -> bool {
        match operation {
            AdapterOperation::Send => self.operations.send,
            AdapterOperation::Process => self.operations.process,
            AdapterOperation::Receive => self.operations.receive,
        }
    }

    async fn send(&self, selection: &[PathBuf]) -> Result<Vec<InputBundle>> {
        let lines = self.run(AdapterOperation::Send, None, selection).await?;
        let mut bundles = Vec::new();
        let mut current = InputBundle::new();
        for line in lines {
            if line.trim().is_empty() {
                if !current.is_empty() {
                    bundles.push(std::mem::take(&mut current));
                }
            } else {
                current.push(PathBuf::from(line));
            }
        }
        if !current.is_empty() {
            bundles.push(current);
        }
        Ok(bundles)
    }

    async fn process(&self, scratch: &Path, inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let lines = self
            .run(AdapterOperation::Process, Some(scratch), inputs)
            .await?;
        Ok(lines
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let path = PathBuf::from(line);
                if path.is_absolute() {
                    path
                } else {
                    scratch.join(path)
                }
            })
            .collect())
    }

    async fn receive(&self, scratch: &Path, outputs: &[PathBuf]) -> Result<()> {
        self.run(AdapterOperation::Receive, Some(scratch), outputs)
            .await?;
        Ok(())
    }
}

/// Scans the applications directory and returns one adapter per
/// application subdirectory.
///
/// # Errors
///
/// Fails with a configuration error if the directory cannot be read or an
/// application ID contains `.` (reserved by the adapter loader).
pub fn discover(applications_dir: &Path) -> Result<Vec<ScriptAdapter>> {
    let entries = std::fs::read_dir(applications_dir).map_err(|e| {
        Error::config(format!(
            "cannot read applications directory {}: {e}",
            applications_dir.display()
        ))
    })?;

    let mut adapters = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::config(format!("scanning applications: {e}")))?;
        if !entry.path().is_dir() {
            continue;
        }
        let application = entry.file_name().to_string_lossy().into_owned();
        if application.contains('.') {
            return Err(Error::config(format!(
                "application id '{application}' contains '.'"
            )));
        }
        adapters.push(ScriptAdapter::new(application, entry.path()));
    }
    adapters.sort_by(|a, b| a.application.cmp(&b.application));
    Ok(adapters)
}
