//! Wire messages exchanged by the leader ping protocol.

use serde::{Deserialize, Serialize};

use super::node::{ClusterName, DiscoveryNode};
use crate::errors::PingRejection;

/// Path the leader serves pings on.
pub const LEADER_PING_PATH: &str = "/internal/leader_ping";

/// Path returning the serving node's [`DiscoveryNode`] (handshake).
pub const NODE_INFO_PATH: &str = "/internal/node";

/// Ping sent by a follower to the node it believes is the leader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingRequest {
    /// The pinging follower.
    pub source_node: DiscoveryNode,
    /// The leader the follower believes it is talking to.
    pub leader_node: DiscoveryNode,
    /// Sender's cluster name.  Older senders omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<ClusterName>,
}

impl PingRequest {
    pub fn new(
        source_node: DiscoveryNode,
        leader_node: DiscoveryNode,
        cluster_name: Option<ClusterName>,
    ) -> Self {
        Self {
            source_node,
            leader_node,
            cluster_name,
        }
    }
}

/// Successful ping acknowledgement.  Carries no data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {}

/// Body of a `409 Conflict` ping response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionBody {
    pub rejection: PingRejection,
}

/// Body of a `500` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
