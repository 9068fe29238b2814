//! Case archive backends over the shared filesystem.
//!
//! The archive holds zipped input and result bundles. Its single hard
//! requirement is atomic visibility: a bundle must appear to readers only
//! once fully written, which [`FsArchive`] implements by writing to a
//! sibling temp name and renaming. The archive never retries internally;
//! failures are classified transient/permanent and left to the caller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::id::CaseId;
use crate::paths::{self, ArchivePath};

/// Read/write access to the shared case archive.
///
/// Implementations must make `put` atomic with respect to readers: a path
/// either resolves to a complete bundle or does not resolve at all.
/// A `put` to an existing path replaces the bundle atomically (the
/// overwrite-by-rename that resolves orphaned results from crashed
/// processors).
#[async_trait]
pub trait CaseArchive: Send + Sync {
    /// Writes a bundle, replacing any existing bundle at the path.
    async fn put(&self, path: &ArchivePath, bytes: Bytes) -> Result<()>;

    /// Reads a bundle.
    ///
    /// Returns [`Error::NotFound`] if nothing exists at the path.
    async fn get(&self, path: &ArchivePath) -> Result<Bytes>;

    /// Returns true if a bundle exists at the path.
    async fn exists(&self, path: &ArchivePath) -> Result<bool>;

    /// Removes a bundle. Removing a missing path succeeds (idempotent).
    async fn remove(&self, path: &ArchivePath) -> Result<()>;

    /// Writes an input bundle at its canonical path and returns the path.
    async fn put_input(
        &self,
        case_id: CaseId,
        user: &str,
        machine: &str,
        bytes: Bytes,
    ) -> Result<ArchivePath> {
        let path = paths::input_path(user, machine, case_id);
        self.put(&path, bytes).await?;
        Ok(path)
    }

    /// Reads an input bundle from its canonical path.
    async fn get_input(&self, case_id: CaseId, user: &str, machine: &str) -> Result<Bytes> {
        let path = paths::input_path(user, machine, case_id);
        self.get(&path).await
    }

    /// Writes a result bundle at its canonical path and returns the path.
    async fn put_result(
        &self,
        case_id: CaseId,
        user: &str,
        machine: &str,
        bytes: Bytes,
    ) -> Result<ArchivePath> {
        let path = paths::result_path(user, machine, case_id);
        self.put(&path, bytes).await?;
        Ok(path)
    }

    /// Reads a result bundle from its canonical path.
    async fn get_result(&self, case_id: CaseId, user: &str, machine: &str) -> Result<Bytes> {
        let path = paths::result_path(user, machine, case_id);
        self.get(&path).await
    }
}

/// Filesystem archive rooted at the shared folder.
///
/// Writes go to a hidden sibling temp file and are renamed into place, so
/// concurrent readers on other machines never observe partial bundles.
#[derive(Debug, Clone)]
pub struct FsArchive {
    root: PathBuf,
}

impl FsArchive {
    /// Creates an archive over the given shared-folder root.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the archive root.
    #[must_use]
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn resolve(&self, path: &ArchivePath) -> Result<PathBuf> {
        if path.is_traversal() {
            return Err(Error::permanent_io(format!(
                "archive path '{path}' escapes the archive root"
            )));
        }
        Ok(path.under(&self.root))
    }
}

#[async_trait]
impl CaseArchive for FsArchive {
    async fn put(&self, path: &ArchivePath, bytes: Bytes) -> Result<()> {
        let target = self.resolve(path)?;
        let parent = target.parent().ok_or_else(|| {
            Error::permanent_io(format!("archive path '{path}' has no parent directory"))
        })?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::from_io("creating archive directory", e))?;

        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::permanent_io(format!("archive path '{path}' has no file name")))?;
        let temp = parent.join(format!(".{file_name}.tmp-{}", Ulid::new()));

        tokio::fs::write(&temp, &bytes)
            .await
            .map_err(|e| Error::from_io("writing bundle", e))?;
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(Error::from_io("publishing bundle", e));
        }
        Ok(())
    }

    async fn get(&self, path: &ArchivePath) -> Result<Bytes> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(path.to_string()))
            }
            Err(e) => Err(Error::from_io("reading bundle", e)),
        }
    }

    async fn exists(&self, path: &ArchivePath) -> Result<bool> {
        let target = self.resolve(path)?;
        tokio::fs::try_exists(&target)
            .await
            .map_err(|e| Error::from_io("checking bundle", e))
    }

    async fn remove(&self, path: &ArchivePath) -> Result<()> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from_io("removing bundle", e)),
        }
    }
}

/// In-memory archive for tests and multi-machine simulation.
///
/// Thread-safe via `RwLock`; puts are atomic by construction, so the
/// rename contract holds trivially.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    entries: RwLock<HashMap<String, Bytes>>,
}

impl MemoryArchive {
    /// Creates a new empty archive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored bundles.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self
            .entries
            .read()
            .map_err(|_| Error::internal("archive lock poisoned"))?
            .len())
    }

    /// Returns true if no bundles are stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl CaseArchive for MemoryArchive {
    async fn put(&self, path: &ArchivePath, bytes: Bytes) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| Error::internal("archive lock poisoned"))?
            .insert(path.as_str().to_string(), bytes);
        Ok(())
    }

    async fn get(&self, path: &ArchivePath) -> Result<Bytes> {
        self.entries
            .read()
            .map_err(|_| Error::internal("archive lock poisoned"))?
            .get(path.as_str())
            .cloned()
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn exists(&self, path: &ArchivePath) -> Result<bool> {
        Ok(self
            .entries
            .read()
            .map_err(|_| Error::internal("archive lock poisoned"))?
            .contains_key(path.as_str()))
    }

    async fn remove(&self, path: &ArchivePath) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| Error::internal("archive lock poisoned"))?
            .remove(path.as_str());
        Ok(())
    }
}
