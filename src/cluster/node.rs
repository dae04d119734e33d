//! Node and cluster identity types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A cluster member as seen on the wire.
///
/// `ephemeral_id` is regenerated every time a process starts, so a node
/// restarted under the same id and address compares unequal to its previous
/// incarnation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveryNode {
    /// Stable node identifier from configuration.
    pub id: String,
    /// Per-process identifier.
    pub ephemeral_id: String,
    /// Base URL the node serves its internal endpoints on.
    pub address: String,
}

impl DiscoveryNode {
    /// Create a node with a freshly generated ephemeral id.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ephemeral_id: uuid::Uuid::new_v4().simple().to_string(),
            address: address.into(),
        }
    }

    /// Create a node with an explicit ephemeral id.
    pub fn with_ephemeral_id(
        id: impl Into<String>,
        ephemeral_id: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            ephemeral_id: ephemeral_id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for DiscoveryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{{{}}}{{{}}}", self.id, self.ephemeral_id, self.address)
    }
}

/// Name of the cluster a node belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterName(String);

impl ClusterName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restarted_node_is_not_equal() {
        let before = DiscoveryNode::new("node-1", "http://127.0.0.1:9301");
        let after = DiscoveryNode::new("node-1", "http://127.0.0.1:9301");
        assert_ne!(before.ephemeral_id, after.ephemeral_id);
        assert_ne!(before, after);
        assert_eq!(before, before.clone());
    }

    #[test]
    fn test_display_includes_all_identifiers() {
        let node = DiscoveryNode::with_ephemeral_id("node-1", "abc", "http://h:1");
        assert_eq!(node.to_string(), "{node-1}{abc}{http://h:1}");
    }

    #[test]
    fn test_cluster_name_serializes_as_plain_string() {
        let name = ClusterName::new("prod");
        assert_eq!(serde_json::to_string(&name).unwrap(), "\"prod\"");
        assert!(ClusterName::new("").is_empty());
    }
}
