//! Canonical archive path policy.
//!
//! Bundles live under the shared folder at stable, collision-free locations:
//!
//! ```text
//! Cases/<USER>/<MACHINE>/<case-id>.zip      input bundle
//! Results/<USER>/<MACHINE>/<case-id>.zip    result bundle
//! ```
//!
//! User and machine segments are uppercased so grids mixing case-sensitive
//! and case-insensitive filesystems agree on one spelling. Case IDs are
//! unique, so paths are collision-free by construction.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::id::CaseId;

/// Top-level folder for input bundles.
pub const CASES_DIR: &str = "Cases";
/// Top-level folder for result bundles.
pub const RESULTS_DIR: &str = "Results";

/// A logical location within the case archive.
///
/// Always relative to the archive root, always forward-slash separated.
/// This is the canonical handle stored in case records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchivePath(String);

impl ArchivePath {
    /// Wraps a relative, forward-slash path string.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Returns the path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolves this path under a filesystem root.
    #[must_use]
    pub fn under(&self, root: &std::path::Path) -> PathBuf {
        let mut resolved = root.to_path_buf();
        for segment in self.0.split('/') {
            resolved.push(segment);
        }
        resolved
    }

    /// Returns true if the path escapes the archive root.
    #[must_use]
    pub fn is_traversal(&self) -> bool {
        self.0.starts_with('/')
            || self.0.split('/').any(|segment| segment == "..")
    }
}

impl fmt::Display for ArchivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the canonical input bundle path for a case.
#[must_use]
pub fn input_path(user: &str, machine: &str, case_id: CaseId) -> ArchivePath {
    bundle_path(CASES_DIR, user, machine, case_id)
}

/// Returns the canonical result bundle path for a case.
#[must_use]
pub fn result_path(user: &str, machine: &str, case_id: CaseId) -> ArchivePath {
    bundle_path(RESULTS_DIR, user, machine, case_id)
}

fn bundle_path(root: &str, user: &str, machine: &str, case_id: CaseId) -> ArchivePath {
    ArchivePath(format!(
        "{root}/{}/{}/{case_id}.zip",
        user.to_uppercase(),
        machine.to_uppercase()
    ))
}
