//! Leader side of the ping protocol.
//!
//! The fast path answers from the applied cluster state snapshot.  When the
//! snapshot says this node is not the leader, or does not know the pinging
//! node, the check is re-run as a serialized state task so that it sees any
//! in-flight membership change before rejecting the follower.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, trace};

use super::messages::{PingRequest, PingResponse};
use super::node::ClusterName;
use super::state::{MembershipView, StateTaskQueue, StateUpdateTask};
use crate::errors::{PingError, PingRejection, StateTaskError};
use crate::metrics::PINGS_HANDLED_TOTAL;

/// Validates incoming leader pings against the local cluster state.
pub struct LeaderPingValidator {
    cluster_name: ClusterName,
    membership: Arc<dyn MembershipView>,
    state_tasks: Arc<dyn StateTaskQueue>,
}

impl LeaderPingValidator {
    pub fn new(
        cluster_name: ClusterName,
        membership: Arc<dyn MembershipView>,
        state_tasks: Arc<dyn StateTaskQueue>,
    ) -> Self {
        Self {
            cluster_name,
            membership,
            state_tasks,
        }
    }

    /// Answer a ping, or reject it with the reason the follower should act on.
    pub async fn handle_ping(&self, request: PingRequest) -> Result<PingResponse, PingError> {
        let result = self.validate(request).await;
        let outcome = match &result {
            Ok(_) => "ack",
            Err(PingError::Rejected(rejection)) => rejection.code(),
            Err(PingError::Internal(_)) => "error",
        };
        counter!(PINGS_HANDLED_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn validate(&self, request: PingRequest) -> Result<PingResponse, PingError> {
        let snapshot = self.membership.snapshot();
        let local_node = &snapshot.local_node;

        // The follower may be pinging an earlier incarnation of this node.
        if request.leader_node != *local_node {
            trace!(
                "got ping addressed to leader [{}], local node is [{}]",
                request.leader_node,
                local_node
            );
            return Err(PingRejection::NotTheLeader {
                message: format!(
                    "got ping as leader [{}], but local node is [{}]",
                    request.leader_node, local_node
                ),
            }
            .into());
        }

        if let Some(cluster_name) = &request.cluster_name {
            if !cluster_name.is_empty() && *cluster_name != self.cluster_name {
                debug!(
                    "leader ping from [{}] for cluster [{}] does not match local cluster [{}]",
                    request.source_node, cluster_name, self.cluster_name
                );
                return Err(PingRejection::NotTheLeader {
                    message: format!(
                        "leader ping for cluster [{}] received by leader of cluster [{}]",
                        cluster_name, self.cluster_name
                    ),
                }
                .into());
            }
        }

        if snapshot.local_node_is_leader() && snapshot.node_exists(&request.source_node) {
            return Ok(PingResponse::default());
        }

        // The snapshot may be stale; ask the state queue before rejecting.
        let source_node = request.source_node;
        let task_source = format!("leader ping (from: {source_node})");
        let checked = source_node.clone();
        let task = StateUpdateTask::new(task_source, move |current| {
            if current.node_exists(&checked) {
                Ok(current.clone())
            } else {
                Err(StateTaskError::NodeDoesNotExist {
                    node: checked.to_string(),
                })
            }
        });

        match self.state_tasks.submit_state_update(task).await {
            Ok(()) => Ok(PingResponse::default()),
            Err(StateTaskError::NotLeader) => {
                trace!("ping from [{}] rejected, no longer leader", source_node);
                Err(PingRejection::NoLongerLeader.into())
            }
            Err(StateTaskError::NodeDoesNotExist { node }) => {
                trace!("ping from [{}] rejected, node unknown", source_node);
                Err(PingRejection::UnknownToLeader { node }.into())
            }
            Err(err) => {
                debug!("unexpected error while checking ping from [{}]: {}", source_node, err);
                Err(PingError::Internal(err.to_string()))
            }
        }
    }
}
