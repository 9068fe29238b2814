//! Strongly-typed case identifiers.
//!
//! Case IDs are ULIDs:
//! - **Time-ordered**: lexicographic order is submission order, which gives
//!   the registry its FIFO claim fairness for free
//! - **Globally unique**: no coordination required between submitters
//!
//! # Example
//!
//! ```rust
//! use grid_core::id::CaseId;
//!
//! let id = CaseId::generate();
//! let parsed: CaseId = id.to_string().parse().unwrap();
//! assert_eq!(id, parsed);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

/// A unique identifier for a submitted case.
///
/// The ID doubles as the case's archive file stem, so it must stay
/// filesystem-safe (ULIDs are).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(Ulid);

impl CaseId {
    /// Generates a new unique case ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a case ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the submission timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = self.0.timestamp_ms();
        chrono::DateTime::from_timestamp_millis(i64::try_from(ms).unwrap_or(0))
            .unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CaseId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid case ID '{s}': {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_id_roundtrip() {
        let id = CaseId::generate();
        let parsed: CaseId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn case_id_rejects_garbage() {
        let result: Result<CaseId> = "not-a-ulid".parse();
        assert!(result.is_err());
    }

    #[test]
    fn case_ids_are_time_ordered() {
        let first = CaseId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = CaseId::generate();
        assert!(first < second);
    }

    #[test]
    fn case_id_serde_transparent() {
        let id = CaseId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }
}
