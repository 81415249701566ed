//! Arbor Cluster - Cache Flush Protocol
//!
//! After a write commits and the local cache is flushed, the node announces
//! the flushed scope to its peers with a [`FlushMessage`]. Replicas answer by
//! flushing the same scope under the same path locks; the primary ignores
//! the announcement because it flushed locally when it made the write.
//!
//! Delivery is best-effort. Messages are never persisted and never retried.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod bus;
pub mod message;
pub mod transport;

pub use bus::{BusStats, BusTransport, InMemoryClusterBus};
pub use message::{decode, encode, ClusterMessage, FlushMessage};
pub use transport::{ClusterListener, ClusterTransport};

// ============================================================================
// ROLES AND MESSAGE TYPES
// ============================================================================

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    /// Performs writes and flushes its own cache as it goes.
    Primary,
    /// Serves reads and flushes when told to by its peers.
    Replica,
}

impl ClusterRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterRole::Primary => "primary",
            ClusterRole::Replica => "replica",
        }
    }
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterRole {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "primary" | "master" => Ok(ClusterRole::Primary),
            "replica" | "slave" => Ok(ClusterRole::Replica),
            _ => Err(RoleParseError(s.to_string())),
        }
    }
}

/// Error when parsing an unknown cluster role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleParseError(pub String);

impl fmt::Display for RoleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown cluster role: {}", self.0)
    }
}

impl std::error::Error for RoleParseError {}

/// Kinds of message a node can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Flush,
}
