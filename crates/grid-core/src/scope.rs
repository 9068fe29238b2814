//! Grid visibility scope and machine identity.
//!
//! Cases are visible only within their user group, and grids can run
//! several isolated instances (a debug instance next to production) over the
//! same database. The pair of labels forms a [`GridScope`]; every registry
//! query is filtered by it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The tenant and partition labels that jointly scope case visibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridScope {
    /// Tenant tag: cases are visible only within their group.
    pub user_group: String,
    /// Partition tag: isolates debug grids from production grids.
    pub instance: String,
}

impl GridScope {
    /// Creates a scope after validating both labels.
    ///
    /// # Errors
    ///
    /// Returns an error if either label is empty after trimming.
    pub fn new(user_group: impl Into<String>, instance: impl Into<String>) -> Result<Self> {
        let user_group = user_group.into();
        let instance = instance.into();
        if user_group.trim().is_empty() {
            return Err(Error::InvalidScope {
                message: "user group cannot be empty".to_string(),
            });
        }
        if instance.trim().is_empty() {
            return Err(Error::InvalidScope {
                message: "instance cannot be empty".to_string(),
            });
        }
        Ok(Self {
            user_group,
            instance,
        })
    }
}

impl fmt::Display for GridScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_group, self.instance)
    }
}

/// The `(machine, user)` pair identifying a submitter or processor.
///
/// Identities are compared verbatim; the archive path policy uppercases
/// them separately so comparisons here stay exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Machine (host) name.
    pub machine: String,
    /// Login name on that machine.
    pub user: String,
}

impl Identity {
    /// Creates an identity from explicit machine and user names.
    #[must_use]
    pub fn new(machine: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
            user: user.into(),
        }
    }

    /// Detects the local identity from the environment.
    ///
    /// Falls back to placeholder names when the environment does not expose
    /// them; a real deployment should always set them.
    #[must_use]
    pub fn detect() -> Self {
        let machine = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown-machine".to_string());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown-user".to_string());
        Self { machine, user }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.machine)
    }
}
