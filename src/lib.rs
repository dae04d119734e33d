//! leaderwatch library -- leader fault detection for a cluster membership layer.
//!
//! A follower pings the node it believes is the elected leader and raises a
//! one-shot failure event when the leader stops answering or rejects the
//! follower's view of the cluster.  The leader side validates every inbound
//! ping against its own membership state, deferring ambiguous cases to a
//! serialized cluster state task.

pub mod cluster;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod server;

use crate::cluster::node::DiscoveryNode;
use crate::cluster::ping_handler::LeaderPingValidator;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// The node this process runs as (returned by the handshake endpoint).
    pub local_node: DiscoveryNode,
    /// Leader-side validation of inbound pings.
    pub validator: LeaderPingValidator,
}
