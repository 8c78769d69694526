//! # Core Types
//!
//! Identity and ordering primitives used throughout the federation.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    str::FromStr,
};

use crate::error::Error;

/// Unique, restart-stable identifier for a node in the federation
///
/// Ordering is plain byte-wise lexicographic order over the identifier, which is the
/// order the election tie-break relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node ID from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Borrow the identifier bytes
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Whether the identifier is empty (never valid on the wire)
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::configuration("node id cannot be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Per-node election epoch
///
/// Advanced only by the node that owns it, each time it contends for leadership.
/// A higher epoch wins the election.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Epoch(u64);

impl Epoch {
    /// Create an epoch with the given value
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the epoch value
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// The epoch immediately after this one
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Big-endian encoding used in signed payloads
    pub const fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Epoch {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Epoch> for u64 {
    fn from(epoch: Epoch) -> Self {
        epoch.0
    }
}

/// Local role of a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Observes the federation and follows the elected leader (boot state)
    #[default]
    Witness,
    /// Holds orchestration authority
    Leader,
}

impl Role {
    /// Whether this role carries orchestration authority
    pub const fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Witness => write!(f, "witness"),
            Self::Leader => write!(f, "leader"),
        }
    }
}
