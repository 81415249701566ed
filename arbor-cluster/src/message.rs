//! Cluster messages and their JSON wire codec.

use arbor_core::{new_entity_id, ClusterError, EntityId, RepoPath, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::MessageType;

/// Announcement that a node flushed `path` from its cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushMessage {
    pub id: EntityId,
    /// Node that performed the write.
    pub origin: String,
    pub path: RepoPath,
    pub flush_descendants: bool,
    /// Label of the write that caused the flush (`"delete"`, `"move"`, ...).
    pub operation: String,
    pub sent_at: Timestamp,
}

impl FlushMessage {
    pub fn new(
        origin: impl Into<String>,
        path: RepoPath,
        flush_descendants: bool,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            id: new_entity_id(),
            origin: origin.into(),
            path,
            flush_descendants,
            operation: operation.into(),
            sent_at: Utc::now(),
        }
    }
}

/// Every message exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterMessage {
    Flush(FlushMessage),
}

impl ClusterMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ClusterMessage::Flush(_) => MessageType::Flush,
        }
    }

    pub fn origin(&self) -> &str {
        match self {
            ClusterMessage::Flush(flush) => &flush.origin,
        }
    }
}

impl From<FlushMessage> for ClusterMessage {
    fn from(flush: FlushMessage) -> Self {
        ClusterMessage::Flush(flush)
    }
}

/// Serialize a message to its wire form.
pub fn encode(message: &ClusterMessage) -> Result<Vec<u8>, ClusterError> {
    serde_json::to_vec(message).map_err(|e| ClusterError::Encode {
        reason: e.to_string(),
    })
}

/// Parse a message from its wire form.
pub fn decode(bytes: &[u8]) -> Result<ClusterMessage, ClusterError> {
    serde_json::from_slice(bytes).map_err(|e| ClusterError::Decode {
        reason: e.to_string(),
    })
}
