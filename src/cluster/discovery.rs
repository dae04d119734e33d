//! Static peer discovery.
//!
//! Every round handshakes each configured peer, records the identities that
//! answer in the cluster state, and points the leader fault detector at the
//! elected leader once that leader is a known member.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use super::leader_fd::{LeaderFailure, LeaderFailureListener, LeaderFaultDetection};
use super::state::{MembershipView, StateTaskQueue, StateUpdateTask};
use super::transport::Transport;
use crate::config::{ClusterConfig, PeerConfig};

pub struct PeerDiscovery {
    local_id: String,
    peers: Vec<PeerConfig>,
    interval: Duration,
    transport: Arc<dyn Transport>,
    membership: Arc<dyn MembershipView>,
    state_tasks: Arc<dyn StateTaskQueue>,
    detector: Arc<LeaderFaultDetection>,
}

impl PeerDiscovery {
    pub fn new(
        config: &ClusterConfig,
        transport: Arc<dyn Transport>,
        membership: Arc<dyn MembershipView>,
        state_tasks: Arc<dyn StateTaskQueue>,
        detector: Arc<LeaderFaultDetection>,
    ) -> Self {
        Self {
            local_id: config.node_id.clone(),
            peers: config.peers.clone(),
            interval: config.discovery_interval(),
            transport,
            membership,
            state_tasks,
            detector,
        }
    }

    /// Run discovery rounds forever, the first one immediately.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.discover_once().await;
        }
    }

    /// Handshake every peer once, then reconcile the detector with the
    /// resulting membership.
    pub async fn discover_once(&self) {
        for peer in self.peers.iter().filter(|p| p.id != self.local_id) {
            let node = match self.transport.handshake(peer.address.clone()).await {
                Ok(node) => node,
                Err(err) => {
                    trace!("handshake with [{}] at [{}] failed: {}", peer.id, peer.address, err);
                    continue;
                }
            };
            if node.id != peer.id {
                warn!(
                    "peer at [{}] identifies as [{}], expected [{}]",
                    peer.address, node.id, peer.id
                );
                continue;
            }
            if self.membership.snapshot().node_exists(&node) {
                continue;
            }

            debug!("discovered peer {}", node);
            let source = format!("discovered peer [{node}]");
            let task = StateUpdateTask::local(source, move |current| {
                Ok(current.clone().with_node(node))
            });
            if let Err(err) = self.state_tasks.submit_state_update(task).await {
                warn!("failed to record peer [{}]: {}", peer.id, err);
            }
        }

        self.sync_detector();
    }

    fn sync_detector(&self) {
        let snapshot = self.membership.snapshot();
        if snapshot.local_node_is_leader() {
            if self.detector.leader_node().is_some() {
                self.detector.stop("local node is the leader");
            }
            return;
        }
        // Until the leader has answered a handshake there is nothing to ping.
        let Some(leader) = snapshot.leader_node() else {
            return;
        };
        if self.detector.leader_node().as_ref() != Some(leader) {
            self.detector.restart(leader.clone(), "leader discovered");
        }
    }
}

/// Failure listener that drops the failed leader incarnation from the local
/// membership, so detection only resumes once the leader answers a
/// handshake again.
pub struct ForgetFailedLeader {
    state_tasks: Arc<dyn StateTaskQueue>,
}

impl ForgetFailedLeader {
    pub fn new(state_tasks: Arc<dyn StateTaskQueue>) -> Self {
        Self { state_tasks }
    }
}

impl LeaderFailureListener for ForgetFailedLeader {
    fn on_leader_failure(&self, failure: &LeaderFailure) {
        warn!("leader {} failed: {}", failure.leader, failure.reason);

        let state_tasks = Arc::clone(&self.state_tasks);
        let failed = failure.leader.clone();
        tokio::spawn(async move {
            let source = format!("leader failed [{failed}]");
            let task = StateUpdateTask::local(source, move |current| {
                if current.node_exists(&failed) {
                    Ok(current.clone().without_node(&failed.id))
                } else {
                    Ok(current.clone())
                }
            });
            if let Err(err) = state_tasks.submit_state_update(task).await {
                warn!("failed to forget failed leader: {}", err);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::messages::{PingRequest, PingResponse};
    use crate::cluster::node::{ClusterName, DiscoveryNode};
    use crate::cluster::scheduler::TokioScheduler;
    use crate::cluster::state::{ClusterState, ClusterStateService};
    use crate::cluster::transport::{ConnectionListener, TransportFuture};
    use crate::config::FaultDetectionConfig;
    use crate::errors::TransportError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers handshakes from a fixed address book and acknowledges pings.
    #[derive(Default)]
    struct AddressBook {
        nodes: Mutex<HashMap<String, DiscoveryNode>>,
        handshakes: AtomicUsize,
    }

    impl AddressBook {
        fn serve(&self, node: DiscoveryNode) {
            self.nodes.lock().unwrap().insert(node.address.clone(), node);
        }
    }

    impl Transport for AddressBook {
        fn send_ping(
            &self,
            _target: DiscoveryNode,
            _request: PingRequest,
            _timeout: Duration,
        ) -> TransportFuture<'_, PingResponse> {
            Box::pin(async { Ok(PingResponse::default()) })
        }

        fn connect(&self, _target: DiscoveryNode) -> TransportFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn handshake(&self, address: String) -> TransportFuture<'_, DiscoveryNode> {
            self.handshakes.fetch_add(1, Ordering::SeqCst);
            let found = self.nodes.lock().unwrap().get(&address).cloned();
            Box::pin(async move {
                found.ok_or(TransportError::Disconnected {
                    node: address,
                    message: "connection refused".into(),
                })
            })
        }

        fn add_connection_listener(&self, _listener: Arc<dyn ConnectionListener>) {}

        fn remove_connection_listener(&self, _listener: &Arc<dyn ConnectionListener>) {}
    }

    fn node(id: &str) -> DiscoveryNode {
        DiscoveryNode::with_ephemeral_id(id, format!("{id}-eph"), format!("http://{id}"))
    }

    fn cluster_config(local: &str, leader: &str) -> ClusterConfig {
        ClusterConfig {
            node_id: local.to_string(),
            leader_id: Some(leader.to_string()),
            peers: ["leader", "follower"]
                .iter()
                .map(|id| PeerConfig {
                    id: id.to_string(),
                    address: format!("http://{id}"),
                })
                .collect(),
            ..ClusterConfig::default()
        }
    }

    struct Setup {
        discovery: PeerDiscovery,
        transport: Arc<AddressBook>,
        state: Arc<ClusterStateService>,
        detector: Arc<LeaderFaultDetection>,
    }

    fn setup(local: &str, leader: &str) -> Setup {
        let config = cluster_config(local, leader);
        let transport = Arc::new(AddressBook::default());
        let state = ClusterStateService::start(
            ClusterState::new(ClusterName::new("test"), node(local))
                .with_leader(Some(leader.to_string())),
        );
        let detector = Arc::new(LeaderFaultDetection::new(
            FaultDetectionConfig::default(),
            ClusterName::new("test"),
            state.clone(),
            transport.clone(),
            Arc::new(TokioScheduler::current()),
        ));
        let discovery = PeerDiscovery::new(
            &config,
            transport.clone(),
            state.clone(),
            state.clone(),
            Arc::clone(&detector),
        );
        Setup {
            discovery,
            transport,
            state,
            detector,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_starts_detection_once_leader_answers() {
        let s = setup("follower", "leader");

        s.discovery.discover_once().await;
        assert!(s.detector.leader_node().is_none());

        s.transport.serve(node("leader"));
        s.discovery.discover_once().await;
        assert!(s.state.snapshot().node_exists(&node("leader")));
        assert_eq!(s.detector.leader_node(), Some(node("leader")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_node_is_never_handshaken() {
        let s = setup("follower", "leader");
        s.discovery.discover_once().await;
        assert_eq!(s.transport.handshakes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_does_not_watch_itself() {
        let s = setup("leader", "leader");
        s.transport.serve(node("follower"));

        s.discovery.discover_once().await;
        assert!(s.state.snapshot().node_exists(&node("follower")));
        assert!(s.detector.leader_node().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_identity_is_ignored() {
        let s = setup("follower", "leader");
        let imposter = DiscoveryNode::with_ephemeral_id("intruder", "x", "http://leader");
        s.transport.serve(imposter);

        s.discovery.discover_once().await;
        assert_eq!(s.state.snapshot().nodes.len(), 1);
        assert!(s.detector.leader_node().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarted_leader_replaces_old_incarnation() {
        let s = setup("follower", "leader");
        s.transport.serve(node("leader"));
        s.discovery.discover_once().await;

        let restarted = DiscoveryNode::with_ephemeral_id("leader", "new-eph", "http://leader");
        s.transport.serve(restarted.clone());
        s.discovery.discover_once().await;

        assert!(s.state.snapshot().node_exists(&restarted));
        assert_eq!(s.detector.leader_node(), Some(restarted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_failed_leader_then_rediscover() {
        let s = setup("follower", "leader");
        s.transport.serve(node("leader"));
        s.discovery.discover_once().await;

        let listener = ForgetFailedLeader::new(s.state.clone());
        listener.on_leader_failure(&LeaderFailure {
            leader: node("leader"),
            cause: None,
            reason: "transport disconnected".into(),
        });
        s.detector.stop("test");
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!s.state.snapshot().node_exists(&node("leader")));

        s.discovery.discover_once().await;
        assert_eq!(s.detector.leader_node(), Some(node("leader")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_repeats_rounds() {
        let s = Arc::new(setup("follower", "leader"));
        let runner = Arc::clone(&s);
        let handle = tokio::spawn(async move { runner.discovery.run().await });

        tokio::time::sleep(Duration::from_millis(5_000 * 2 + 1)).await;
        assert_eq!(s.transport.handshakes.load(Ordering::SeqCst), 3);
        handle.abort();
    }
}
