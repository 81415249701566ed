//! Transport and listener contracts.

use arbor_core::ClusterError;

use crate::{ClusterMessage, ClusterRole, MessageType};

/// Outbound side of the cluster connection held by one node.
pub trait ClusterTransport: Send + Sync {
    /// Identifier of the local node.
    fn node_id(&self) -> &str;

    /// Ask to receive inbound messages of `message_type`.
    fn subscribe(&self, message_type: MessageType) -> Result<(), ClusterError>;

    /// Broadcast to every other subscribed node. Returns once the message is
    /// handed off; delivery happens later, or not at all.
    fn cluster_message(&self, message: ClusterMessage) -> Result<(), ClusterError>;
}

/// Inbound side: callbacks a node registers with its transport.
///
/// Callbacks for one node are delivered in order on a single thread.
pub trait ClusterListener: Send + Sync {
    fn role_changed(&self, role: ClusterRole);

    fn cluster_message(&self, message: ClusterMessage);
}
