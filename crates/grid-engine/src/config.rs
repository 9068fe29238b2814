//! Node configuration from the pointer file and the shared folder.
//!
//! A node bootstraps from a single pointer file beside the executable
//! naming the shared-folder root. Under that root:
//!
//! ```text
//! Settings/settings.txt              key: value lines
//! Settings/Software_Per_Machine.csv  machine/application matrix
//! Settings/Applications/<id>/        adapter bundles
//! Cases/  Results/                   the case archive
//! ```
//!
//! Anything malformed here is `CONFIG_INVALID` and fatal at startup.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use tracing::warn;

use grid_core::{GridScope, Redacted};

use crate::error::{Error, Result};
use crate::scheduler::TimingConfig;

/// Settings directory under the shared root.
pub const SETTINGS_DIR: &str = "Settings";
/// Settings file name.
pub const SETTINGS_FILE: &str = "settings.txt";
/// Machine/application matrix file name.
pub const MATRIX_FILE: &str = "Software_Per_Machine.csv";
/// Adapter bundles directory under the settings directory.
pub const APPLICATIONS_DIR: &str = "Applications";

/// Header of the matrix's machine column.
const MACHINE_COLUMN: &str = "Machine name";

const KEY_REGISTRY: &str = "mongodb server";
const KEY_USER_GROUP: &str = "user group";
const KEY_PASSWORD: &str = "password";
const KEY_INSTANCE: &str = "instance";

/// Resolved node configuration.
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Shared-folder root from the pointer file.
    pub shared_root: PathBuf,
    /// Registry server address, including port.
    pub registry_addr: String,
    /// Visibility scope (user group + instance).
    pub scope: GridScope,
    /// Registry credential for the user group.
    pub credential: Redacted,
    /// Applications this machine may process, per the matrix.
    pub allowed_applications: BTreeSet<String>,
    /// Heartbeat/reclamation timing.
    pub timing: TimingConfig,
    /// Initial worker-pool capacity.
    pub capacity: usize,
    /// Optional cap on claim attempts per case.
    pub max_attempts: Option<usize>,
}

impl GridConfig {
    /// Loads configuration for `machine` starting from the pointer file.
    ///
    /// # Errors
    ///
    /// Fails with a configuration error on a missing or unreadable pointer
    /// file, shared folder, settings file, or required setting.
    pub fn load(pointer_file: &Path, machine: &str) -> Result<Self> {
        let shared_root = read_pointer(pointer_file)?;

        let settings_dir = shared_root.join(SETTINGS_DIR);
        if !settings_dir.is_dir() {
            return Err(Error::config(format!(
                "settings folder not found at {}",
                settings_dir.display()
            )));
        }

        let settings_path = settings_dir.join(SETTINGS_FILE);
        let settings_text = std::fs::read_to_string(&settings_path).map_err(|e| {
            Error::config(format!("cannot read {}: {e}", settings_path.display()))
        })?;
        let settings = parse_settings(&settings_text)?;

        let scope = GridScope::new(
            settings[KEY_USER_GROUP].clone(),
            settings[KEY_INSTANCE].clone(),
        )
        .map_err(|e| Error::config(e.to_string()))?;

        let matrix_path = settings_dir.join(MATRIX_FILE);
        let allowed_applications = if matrix_path.is_file() {
            let matrix_text = std::fs::read_to_string(&matrix_path).map_err(|e| {
                Error::config(format!("cannot read {}: {e}", matrix_path.display()))
            })?;
            machine_row(&matrix_text, machine)?
        } else {
            warn!(path = %matrix_path.display(), "machine matrix missing; this machine will not process");
            BTreeSet::new()
        };

        Ok(Self {
            shared_root,
            registry_addr: settings[KEY_REGISTRY].clone(),
            scope,
            credential: Redacted::new(settings[KEY_PASSWORD].clone()),
            allowed_applications,
            timing: TimingConfig::default(),
            capacity: 1,
            max_attempts: None,
        })
    }

    /// Returns the adapter bundles directory.
    #[must_use]
    pub fn applications_dir(&self) -> PathBuf {
        self.shared_root.join(SETTINGS_DIR).join(APPLICATIONS_DIR)
    }
}

/// Reads the pointer file: a single path string, whitespace trimmed.
fn read_pointer(pointer_file: &Path) -> Result<PathBuf> {
    let text = std::fs::read_to_string(pointer_file).map_err(|e| {
        Error::config(format!(
            "pointer file {} not readable: {e}",
            pointer_file.display()
        ))
    })?;
    let root = PathBuf::from(text.trim());
    if !root.is_dir() {
        return Err(Error::config(format!(
            "pointer file {} does not name an accessible directory ({})",
            pointer_file.display(),
            root.display()
        )));
    }
    Ok(root)
}

/// Parses `key: value` lines. Keys and values are trimmed; later
/// occurrences of a key win; unknown keys are ignored.
fn parse_settings(text: &str) -> Result<HashMap<String, String>> {
    let mut settings = HashMap::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            settings.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    let required = [KEY_REGISTRY, KEY_USER_GROUP, KEY_PASSWORD, KEY_INSTANCE];
    let missing: Vec<&str> = required
        .iter()
        .filter(|key| !settings.contains_key(**key))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(Error::config(format!(
            "settings.txt missing: {}",
            missing.join(", ")
        )));
    }
    Ok(settings)
}

/// Extracts the allowed-application set for `machine` from the matrix.
///
/// Machine names compare case-insensitively; a cell value of `1` allows
/// the application. A machine without a row may not process anything.
fn machine_row(matrix: &str, machine: &str) -> Result<BTreeSet<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(matrix.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| Error::config(format!("malformed machine matrix: {e}")))?
        .clone();
    if headers.get(0) != Some(MACHINE_COLUMN) {
        return Err(Error::config(format!(
            "machine matrix must start with a '{MACHINE_COLUMN}' column"
        )));
    }

    for record in reader.records() {
        let record = record.map_err(|e| Error::config(format!("malformed machine matrix: {e}")))?;
        let Some(row_machine) = record.get(0) else {
            continue;
        };
        if row_machine.eq_ignore_ascii_case(machine) {
            return Ok(headers
                .iter()
                .skip(1)
                .zip(record.iter().skip(1))
                .filter(|(_, cell)| *cell == "1")
                .map(|(application, _)| application.to_string())
                .collect());
        }
    }

    warn!(machine = %machine, "machine not listed in the matrix; it will not process");
    Ok(BTreeSet::new())
}
