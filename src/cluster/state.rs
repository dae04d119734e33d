//! Cluster state, membership snapshots and the serialized state task queue.
//!
//! The applied [`ClusterState`] is published as an `Arc` snapshot that any
//! thread can read without blocking.  All changes go through
//! [`ClusterStateService`]'s queue, which runs one [`StateUpdateTask`] at a
//! time against the state current at execution time (not at submission
//! time).

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::node::{ClusterName, DiscoveryNode};
use crate::errors::StateTaskError;

/// A versioned view of cluster membership.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterState {
    pub cluster_name: ClusterName,
    /// Bumped every time a task publishes a changed state.
    pub version: u64,
    /// The node this process runs as.
    pub local_node: DiscoveryNode,
    /// Id of the elected leader, if any.
    pub leader_id: Option<String>,
    /// Known members keyed by node id, including the local node.
    pub nodes: BTreeMap<String, DiscoveryNode>,
}

impl ClusterState {
    /// Initial state containing only the local node and no leader.
    pub fn new(cluster_name: ClusterName, local_node: DiscoveryNode) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(local_node.id.clone(), local_node.clone());
        Self {
            cluster_name,
            version: 0,
            local_node,
            leader_id: None,
            nodes,
        }
    }

    pub fn local_node_is_leader(&self) -> bool {
        self.leader_id.as_deref() == Some(self.local_node.id.as_str())
    }

    /// The elected leader, if it is a known member.
    pub fn leader_node(&self) -> Option<&DiscoveryNode> {
        self.leader_id.as_ref().and_then(|id| self.nodes.get(id))
    }

    /// Whether `node` is a member.  Matches the incarnation too, so a
    /// restarted node is unknown until its new identity is added.
    pub fn node_exists(&self, node: &DiscoveryNode) -> bool {
        self.nodes.get(&node.id) == Some(node)
    }

    /// Add `node`, replacing any previous incarnation with the same id.
    pub fn with_node(mut self, node: DiscoveryNode) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    pub fn without_node(mut self, node_id: &str) -> Self {
        if node_id != self.local_node.id {
            self.nodes.remove(node_id);
        }
        self
    }

    pub fn with_leader(mut self, leader_id: Option<String>) -> Self {
        self.leader_id = leader_id;
        self
    }
}

/// Read-only access to the applied cluster state.
pub trait MembershipView: Send + Sync + 'static {
    fn snapshot(&self) -> Arc<ClusterState>;
}

type UpdateFn = Box<dyn FnOnce(&ClusterState) -> Result<ClusterState, StateTaskError> + Send>;

/// A unit of work run against the authoritative cluster state.
pub struct StateUpdateTask {
    source: String,
    leader_only: bool,
    update: UpdateFn,
}

impl StateUpdateTask {
    /// A task that only runs while the local node is the elected leader.
    /// On any other node it fails with [`StateTaskError::NotLeader`].
    pub fn new<F>(source: impl Into<String>, update: F) -> Self
    where
        F: FnOnce(&ClusterState) -> Result<ClusterState, StateTaskError> + Send + 'static,
    {
        Self {
            source: source.into(),
            leader_only: true,
            update: Box::new(update),
        }
    }

    /// A task that runs regardless of leadership (local bookkeeping such as
    /// recording discovered peers).
    pub fn local<F>(source: impl Into<String>, update: F) -> Self
    where
        F: FnOnce(&ClusterState) -> Result<ClusterState, StateTaskError> + Send + 'static,
    {
        Self {
            source: source.into(),
            leader_only: false,
            update: Box::new(update),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Single-writer queue of state tasks.
pub trait StateTaskQueue: Send + Sync + 'static {
    /// Enqueue `task` and resolve once it has run (and its result, if any,
    /// has been published).
    fn submit_state_update(
        &self,
        task: StateUpdateTask,
    ) -> Pin<Box<dyn Future<Output = Result<(), StateTaskError>> + Send + '_>>;
}

struct QueuedTask {
    task: StateUpdateTask,
    done: oneshot::Sender<Result<(), StateTaskError>>,
}

/// Owns the cluster state and applies tasks one at a time on a dedicated
/// tokio task.
pub struct ClusterStateService {
    applied: Arc<RwLock<Arc<ClusterState>>>,
    queue: mpsc::UnboundedSender<QueuedTask>,
}

impl ClusterStateService {
    /// Start the service with `initial` as the applied state.
    ///
    /// Must be called from within a tokio runtime.  The worker stops once the
    /// service is dropped.
    pub fn start(initial: ClusterState) -> Arc<Self> {
        let applied = Arc::new(RwLock::new(Arc::new(initial)));
        let (queue, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_state_queue(receiver, Arc::clone(&applied)));
        Arc::new(Self { applied, queue })
    }
}

impl MembershipView for ClusterStateService {
    fn snapshot(&self) -> Arc<ClusterState> {
        Arc::clone(&self.applied.read().expect("cluster state lock poisoned"))
    }
}

impl StateTaskQueue for ClusterStateService {
    fn submit_state_update(
        &self,
        task: StateUpdateTask,
    ) -> Pin<Box<dyn Future<Output = Result<(), StateTaskError>> + Send + '_>> {
        Box::pin(async move {
            let (done, result) = oneshot::channel();
            self.queue
                .send(QueuedTask { task, done })
                .map_err(|_| StateTaskError::QueueClosed)?;
            result.await.map_err(|_| StateTaskError::QueueClosed)?
        })
    }
}

async fn run_state_queue(
    mut receiver: mpsc::UnboundedReceiver<QueuedTask>,
    applied: Arc<RwLock<Arc<ClusterState>>>,
) {
    while let Some(QueuedTask { task, done }) = receiver.recv().await {
        let current = Arc::clone(&applied.read().expect("cluster state lock poisoned"));
        let source = task.source;

        let result = if task.leader_only && !current.local_node_is_leader() {
            trace!("[{}] skipped, local node is not the leader", source);
            Err(StateTaskError::NotLeader)
        } else {
            (task.update)(&*current).map(|mut next| {
                if next != *current {
                    next.version = current.version + 1;
                    debug!(
                        "[{}] publishing cluster state version [{}]",
                        source, next.version
                    );
                    *applied.write().expect("cluster state lock poisoned") = Arc::new(next);
                }
            })
        };

        // The submitter may have given up waiting; nothing to do then.
        let _ = done.send(result);
    }
}
