//! Leader fault detection (follower side).
//!
//! [`LeaderFaultDetection`] watches one leader at a time.  A detection
//! session starts with [`LeaderFaultDetection::restart`], pings the leader
//! every `ping_interval`, and ends either with [`LeaderFaultDetection::stop`]
//! or with a single failure notification to every registered
//! [`LeaderFailureListener`].
//!
//! Failures are classified as:
//! - authoritative rejections from the leader, which fail the session at once;
//! - transport disconnects, which either fail the session or trigger a
//!   reconnect-and-restart, depending on `connect_on_network_disconnect`;
//! - anything else, which is retried by resending the same ping immediately
//!   until `ping_retries` attempts have failed in a row.
//!
//! Session state lives behind a single mutex.  Every ping round captures the
//! leader it pings and re-validates it under that mutex before touching the
//! session, so a response that arrives after a stop or restart is dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use metrics::counter;
use tracing::{debug, error, trace, warn};

use super::messages::PingRequest;
use super::node::{ClusterName, DiscoveryNode};
use super::scheduler::Scheduler;
use super::state::MembershipView;
use super::transport::{ConnectionListener, Transport};
use crate::config::FaultDetectionConfig;
use crate::errors::{PingRejection, TransportError};
use crate::metrics::{LEADER_FAILURES_TOTAL, PINGS_SENT_TOTAL, PING_FAILURES_TOTAL};

/// Details handed to listeners when a leader is declared failed.
#[derive(Debug, Clone)]
pub struct LeaderFailure {
    /// The leader the failed session was watching.
    pub leader: DiscoveryNode,
    /// The transport error that triggered the failure, if any.
    pub cause: Option<Arc<TransportError>>,
    /// Human-readable reason.
    pub reason: String,
}

/// Subscriber to leader failure events.
pub trait LeaderFailureListener: Send + Sync + 'static {
    /// Called at most once per detection session, never on the transport's
    /// completion path.
    fn on_leader_failure(&self, failure: &LeaderFailure);
}

impl<F> LeaderFailureListener for F
where
    F: Fn(&LeaderFailure) + Send + Sync + 'static,
{
    fn on_leader_failure(&self, failure: &LeaderFailure) {
        self(failure)
    }
}

/// Handle returned by [`LeaderFaultDetection::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerEntries = Arc<Vec<(ListenerId, Arc<dyn LeaderFailureListener>)>>;

/// Copy-on-write listener list.  Dispatch iterates a snapshot and never holds
/// the lock used by add/remove.
struct ListenerSet {
    next_id: AtomicU64,
    entries: RwLock<ListenerEntries>,
}

impl ListenerSet {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }

    fn add(&self, listener: Arc<dyn LeaderFailureListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.entries.write().expect("listener set lock poisoned");
        let mut next: Vec<_> = guard.iter().cloned().collect();
        next.push((id, listener));
        *guard = Arc::new(next);
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut guard = self.entries.write().expect("listener set lock poisoned");
        if !guard.iter().any(|(entry, _)| *entry == id) {
            return false;
        }
        let next = guard
            .iter()
            .filter(|(entry, _)| *entry != id)
            .cloned()
            .collect();
        *guard = Arc::new(next);
        true
    }

    fn clear(&self) {
        *self.entries.write().expect("listener set lock poisoned") = Arc::new(Vec::new());
    }

    fn snapshot(&self) -> ListenerEntries {
        Arc::clone(&self.entries.read().expect("listener set lock poisoned"))
    }
}

/// Liveness flag of one ping loop.  Stopping it turns every pending timer
/// and in-flight response of that loop into a no-op.
struct Pinger {
    running: AtomicBool,
}

impl Pinger {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
        })
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Mutable detection state.  Only touched with the session mutex held.
struct Session {
    leader: Option<DiscoveryNode>,
    retry_count: u32,
    pinger: Option<Arc<Pinger>>,
    /// One-shot latch of the current session.
    failure_notified: Arc<AtomicBool>,
}

impl Session {
    fn idle() -> Self {
        Self {
            leader: None,
            retry_count: 0,
            pinger: None,
            failure_notified: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether `pinger` is the live ping loop of this session.
    fn is_current(&self, pinger: &Arc<Pinger>) -> bool {
        pinger.is_running()
            && self
                .pinger
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, pinger))
    }

    /// Whether a response from `pinger` for `leader` still belongs to this
    /// session.
    fn owns(&self, pinger: &Arc<Pinger>, leader: &DiscoveryNode) -> bool {
        self.is_current(pinger) && self.leader.as_ref() == Some(leader)
    }
}

/// What the ping loop does after a failed attempt.
enum AfterFailure {
    Resend,
    HandleDisconnect,
    Done,
}

struct Inner {
    settings: FaultDetectionConfig,
    cluster_name: ClusterName,
    membership: Arc<dyn MembershipView>,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    session: Mutex<Session>,
    listeners: ListenerSet,
    closed: AtomicBool,
    connection_listener: Mutex<Option<Arc<dyn ConnectionListener>>>,
}

/// Pings the elected leader and reports when it can no longer be reached or
/// no longer recognizes this node.
pub struct LeaderFaultDetection {
    inner: Arc<Inner>,
}

impl LeaderFaultDetection {
    /// Create an idle detector.  Registers for transport disconnect events
    /// when `register_connection_listener` is set.
    pub fn new(
        settings: FaultDetectionConfig,
        cluster_name: ClusterName,
        membership: Arc<dyn MembershipView>,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        debug!(
            "[leader] uses ping_interval [{:?}], ping_timeout [{:?}], ping_retries [{}]",
            settings.ping_interval(),
            settings.ping_timeout(),
            settings.ping_retries
        );

        let register = settings.register_connection_listener;
        let inner = Arc::new(Inner {
            settings,
            cluster_name,
            membership,
            transport,
            scheduler,
            session: Mutex::new(Session::idle()),
            listeners: ListenerSet::new(),
            closed: AtomicBool::new(false),
            connection_listener: Mutex::new(None),
        });

        if register {
            let listener: Arc<dyn ConnectionListener> = Arc::new(DisconnectListener {
                inner: Arc::downgrade(&inner),
            });
            inner.transport.add_connection_listener(Arc::clone(&listener));
            *inner
                .connection_listener
                .lock()
                .expect("connection listener mutex poisoned") = Some(listener);
        }

        Self { inner }
    }

    /// The leader currently being watched.
    pub fn leader_node(&self) -> Option<DiscoveryNode> {
        self.inner.lock_session().leader.clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn LeaderFailureListener>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Start watching `leader`.  Same as [`restart`](Self::restart).
    pub fn start(&self, leader: DiscoveryNode, reason: &str) {
        self.restart(leader, reason);
    }

    /// Stop any running session and start a new one against `leader`.
    ///
    /// The first ping is sent after `ping_interval`, giving a freshly elected
    /// leader time to finish its own election.
    pub fn restart(&self, leader: DiscoveryNode, reason: &str) {
        let mut session = self.inner.lock_session();
        // Read under the session mutex; shutdown sets it under the same lock.
        if self.inner.closed.load(Ordering::Acquire) {
            warn!(
                "[leader] ignoring restart against {}, fault detection is closed",
                leader
            );
            return;
        }
        debug!(
            "[leader] restarting fault detection against leader [{}], reason [{}]",
            leader, reason
        );
        Inner::stop_session(&mut session);
        self.inner.start_session(&mut session, leader);
    }

    /// Stop the running session, if any.
    pub fn stop(&self, reason: &str) {
        let mut session = self.inner.lock_session();
        if let Some(leader) = &session.leader {
            debug!(
                "[leader] stopping fault detection against leader [{}], reason [{}]",
                leader, reason
            );
        }
        Inner::stop_session(&mut session);
    }

    /// Stop for good: end the session, drop all listeners, and detach from
    /// the transport.  Later restarts are ignored.
    pub fn shutdown(&self) {
        {
            let mut session = self.inner.lock_session();
            self.inner.closed.store(true, Ordering::Release);
            if let Some(leader) = &session.leader {
                debug!(
                    "[leader] stopping fault detection against leader [{}], reason [closing]",
                    leader
                );
            }
            Inner::stop_session(&mut session);
        }
        self.inner.listeners.clear();
        let listener = self
            .inner
            .connection_listener
            .lock()
            .expect("connection listener mutex poisoned")
            .take();
        if let Some(listener) = listener {
            self.inner.transport.remove_connection_listener(&listener);
        }
    }

    /// React to the transport losing its connection to `node`.  Ignored
    /// unless `node` is the leader being watched.
    pub async fn handle_transport_disconnect(&self, node: &DiscoveryNode) {
        Arc::clone(&self.inner)
            .handle_transport_disconnect(node.clone())
            .await;
    }
}

impl Drop for LeaderFaultDetection {
    fn drop(&mut self) {
        // Pending timers hold the inner state alive; stopping makes them exit.
        Inner::stop_session(&mut self.inner.lock_session());
    }
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().expect("fault detection session mutex poisoned")
    }

    fn start_session(self: &Arc<Self>, session: &mut Session, leader: DiscoveryNode) {
        let pinger = Pinger::new();
        session.leader = Some(leader);
        session.retry_count = 0;
        session.failure_notified = Arc::new(AtomicBool::new(false));
        session.pinger = Some(Arc::clone(&pinger));
        self.schedule_ping(pinger, self.settings.ping_interval());
    }

    fn stop_session(session: &mut Session) {
        session.retry_count = 0;
        if let Some(pinger) = session.pinger.take() {
            pinger.stop();
        }
        session.leader = None;
    }

    fn schedule_ping(self: &Arc<Self>, pinger: Arc<Pinger>, delay: Duration) {
        let inner = Arc::clone(self);
        let task = Box::pin(async move { inner.run_ping(pinger).await });
        if let Err(err) = self.scheduler.schedule(delay, task) {
            warn!("[leader] failed to schedule leader ping: {}", err);
        }
    }

    /// One ping round: send, then resend on transient failures until the
    /// round succeeds, the retry budget runs out, or the session moves on.
    async fn run_ping(self: Arc<Self>, pinger: Arc<Pinger>) {
        let leader = {
            let session = self.lock_session();
            if !session.is_current(&pinger) {
                return;
            }
            session.leader.clone()
        };
        let Some(leader) = leader else {
            // Running without a leader should not happen; keep the loop alive.
            self.schedule_ping(pinger, self.settings.ping_interval());
            return;
        };

        let request = PingRequest::new(
            self.membership.snapshot().local_node.clone(),
            leader.clone(),
            Some(self.cluster_name.clone()),
        );
        let timeout = self.settings.ping_timeout();

        loop {
            counter!(PINGS_SENT_TOTAL).increment(1);
            let result = self
                .transport
                .send_ping(leader.clone(), request.clone(), timeout)
                .await;
            if !pinger.is_running() {
                return;
            }

            match result {
                Ok(_) => {
                    self.on_ping_success(&pinger, &leader);
                    return;
                }
                Err(err) => match self.on_ping_failure(&pinger, &leader, err) {
                    AfterFailure::Resend => continue,
                    AfterFailure::HandleDisconnect => {
                        Arc::clone(&self)
                            .handle_transport_disconnect(leader)
                            .await;
                        return;
                    }
                    AfterFailure::Done => return,
                },
            }
        }
    }

    fn on_ping_success(self: &Arc<Self>, pinger: &Arc<Pinger>, leader: &DiscoveryNode) {
        let mut session = self.lock_session();
        // The leader may have been switched on us; then there is nothing to
        // reschedule.
        if !session.owns(pinger, leader) {
            return;
        }
        session.retry_count = 0;
        self.schedule_ping(Arc::clone(pinger), self.settings.ping_interval());
    }

    fn on_ping_failure(
        self: &Arc<Self>,
        pinger: &Arc<Pinger>,
        leader: &DiscoveryNode,
        err: TransportError,
    ) -> AfterFailure {
        let mut session = self.lock_session();
        if !session.owns(pinger, leader) {
            return AfterFailure::Done;
        }
        counter!(PING_FAILURES_TOTAL, "kind" => err.kind()).increment(1);

        let rejection_reason = match &err {
            TransportError::Disconnected { .. } => return AfterFailure::HandleDisconnect,
            TransportError::Rejected { rejection, .. } => Some(match rejection {
                PingRejection::NoLongerLeader => {
                    debug!("[leader] pinging a leader {} that is no longer a leader", leader);
                    "no longer leader"
                }
                PingRejection::NotTheLeader { .. } => {
                    debug!("[leader] pinging a leader {} that is not the leader", leader);
                    "not leader"
                }
                PingRejection::UnknownToLeader { .. } => {
                    debug!(
                        "[leader] pinging a leader {} but we do not exist on it, act as if its leader failure",
                        leader
                    );
                    "do not exist on leader, act as leader failure"
                }
            }),
            _ => None,
        };
        if let Some(reason) = rejection_reason {
            self.notify_failure(&mut session, leader, Some(Arc::new(err)), reason.to_string());
            return AfterFailure::Done;
        }

        session.retry_count += 1;
        let retry_count = session.retry_count;
        let max_retries = self.settings.ping_retries;
        trace!(
            "[leader] failed to ping [{}], retry [{}] out of [{}]: {}",
            leader,
            retry_count,
            max_retries,
            err
        );
        if retry_count < max_retries {
            // Resend rather than reschedule; the send timeout paces retries.
            return AfterFailure::Resend;
        }

        let timeout = self.settings.ping_timeout();
        debug!(
            "[leader] failed to ping [{}], tried [{}] times, each with maximum [{:?}] timeout",
            leader, max_retries, timeout
        );
        self.notify_failure(
            &mut session,
            leader,
            Some(Arc::new(err)),
            format!(
                "failed to ping, tried [{max_retries}] times, each with maximum [{timeout:?}] timeout"
            ),
        );
        AfterFailure::Done
    }

    async fn handle_transport_disconnect(self: Arc<Self>, node: DiscoveryNode) {
        let pinger = {
            let mut session = self.lock_session();
            if session.leader.as_ref() != Some(&node) {
                return;
            }
            if !self.settings.connect_on_network_disconnect {
                trace!("[leader] [{}] transport disconnected", node);
                self.notify_failure(&mut session, &node, None, "transport disconnected".to_string());
                return;
            }
            session.pinger.clone()
        };

        // Reconnect outside the mutex, then make sure nothing changed meanwhile.
        let connected = self.transport.connect(node.clone()).await;

        let mut session = self.lock_session();
        let same_pinger = match (&pinger, &session.pinger) {
            (Some(before), Some(now)) => Arc::ptr_eq(before, now),
            (None, None) => true,
            _ => false,
        };
        if session.leader.as_ref() != Some(&node) || !same_pinger {
            return;
        }

        match connected {
            Ok(()) => {
                debug!("[leader] reconnected to {}, restarting pings", node);
                if let Some(old) = session.pinger.take() {
                    old.stop();
                }
                let pinger = Pinger::new();
                session.pinger = Some(Arc::clone(&pinger));
                session.retry_count = 0;
                self.schedule_ping(pinger, Duration::ZERO);
            }
            Err(err) => {
                trace!("[leader] [{}] transport disconnected (with verified connect)", node);
                self.notify_failure(
                    &mut session,
                    &node,
                    Some(Arc::new(err)),
                    "transport disconnected (with verified connect)".to_string(),
                );
            }
        }
    }

    /// Fire the failure event for the current session (once) and end it.
    fn notify_failure(
        &self,
        session: &mut Session,
        leader: &DiscoveryNode,
        cause: Option<Arc<TransportError>>,
        reason: String,
    ) {
        let latch = Arc::clone(&session.failure_notified);
        if latch
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        counter!(LEADER_FAILURES_TOTAL).increment(1);

        let listeners = self.listeners.snapshot();
        let failure = LeaderFailure {
            leader: leader.clone(),
            cause,
            reason: reason.clone(),
        };
        let dispatch = Box::pin(async move {
            for (_, listener) in listeners.iter() {
                listener.on_leader_failure(&failure);
            }
        });
        if let Err(err) = self.scheduler.execute(dispatch) {
            error!(
                "leader failure notification was rejected, it's highly likely the node is shutting down: {}",
                err
            );
        }

        debug!(
            "[leader] stopping fault detection against leader [{}], reason [leader failure, {}]",
            leader, reason
        );
        Self::stop_session(session);
    }
}

/// Forwards transport disconnects to the detector without keeping it alive.
struct DisconnectListener {
    inner: Weak<Inner>,
}

impl ConnectionListener for DisconnectListener {
    fn on_node_disconnected(&self, node: &DiscoveryNode) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let task = Box::pin(Arc::clone(&inner).handle_transport_disconnect(node.clone()));
        if let Err(err) = inner.scheduler.execute(task) {
            warn!("[leader] failed to handle disconnect from {}: {}", node, err);
        }
    }
}
