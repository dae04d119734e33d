//! Node-to-node transport.
//!
//! The [`Transport`] trait is everything fault detection needs from the
//! network: a ping request with a deadline, an explicit (re)connect, a
//! handshake that returns the remote node's identity, and disconnect
//! notifications.  [`HttpTransport`] implements it over HTTP/JSON with
//! `reqwest`, talking to the routes in [`crate::server`].

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, trace};

use super::messages::{
    ErrorBody, PingRequest, PingResponse, RejectionBody, LEADER_PING_PATH, NODE_INFO_PATH,
};
use super::node::DiscoveryNode;
use crate::errors::TransportError;

/// Boxed future returned by [`Transport`] methods.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Receives notice that the transport lost its connection to a node.
pub trait ConnectionListener: Send + Sync + 'static {
    fn on_node_disconnected(&self, node: &DiscoveryNode);
}

/// Request/response messaging between cluster nodes.
pub trait Transport: Send + Sync + 'static {
    /// Send a leader ping to `target`, failing after `timeout`.
    fn send_ping(
        &self,
        target: DiscoveryNode,
        request: PingRequest,
        timeout: Duration,
    ) -> TransportFuture<'_, PingResponse>;

    /// Establish (or verify) a connection to `target`.  Fails if the node at
    /// the address is unreachable or is a different incarnation.
    fn connect(&self, target: DiscoveryNode) -> TransportFuture<'_, ()>;

    /// Ask whatever node serves `address` for its identity.
    fn handshake(&self, address: String) -> TransportFuture<'_, DiscoveryNode>;

    fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>);

    fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>);
}

/// [`Transport`] over HTTP/JSON.
///
/// HTTP has no long-lived connection, so a node counts as connected after
/// any successful exchange.  A connection-level failure against a connected
/// node marks it disconnected and notifies the registered listeners.
pub struct HttpTransport {
    client: reqwest::Client,
    connect_timeout: Duration,
    connected: Mutex<HashSet<DiscoveryNode>>,
    listeners: RwLock<Arc<Vec<Arc<dyn ConnectionListener>>>>,
}

impl HttpTransport {
    /// Create a transport whose handshake and connect requests time out after
    /// `connect_timeout`.  Ping requests use the timeout passed per call.
    pub fn new(connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        Ok(Self {
            client,
            connect_timeout,
            connected: Mutex::new(HashSet::new()),
            listeners: RwLock::new(Arc::new(Vec::new())),
        })
    }

    /// Whether the last exchange with `node` succeeded.
    pub fn is_connected(&self, node: &DiscoveryNode) -> bool {
        self.connected
            .lock()
            .expect("connected nodes mutex poisoned")
            .contains(node)
    }

    fn url(address: &str, path: &str) -> String {
        format!("{}{}", address.trim_end_matches('/'), path)
    }

    fn mark_connected(&self, node: &DiscoveryNode) {
        let inserted = self
            .connected
            .lock()
            .expect("connected nodes mutex poisoned")
            .insert(node.clone());
        if inserted {
            debug!("connected to node {}", node);
        }
    }

    fn mark_disconnected(&self, node: &DiscoveryNode) {
        let removed = self
            .connected
            .lock()
            .expect("connected nodes mutex poisoned")
            .remove(node);
        if !removed {
            return;
        }
        debug!("disconnected from node {}", node);
        let listeners = Arc::clone(&self.listeners.read().expect("listeners lock poisoned"));
        for listener in listeners.iter() {
            listener.on_node_disconnected(node);
        }
    }

    /// Classify a `reqwest` failure for a request to `node`.
    fn map_send_error(
        &self,
        node: &DiscoveryNode,
        err: reqwest::Error,
        timeout: Duration,
    ) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout {
                node: node.to_string(),
                timeout,
            }
        } else if err.is_connect() {
            self.mark_disconnected(node);
            TransportError::Disconnected {
                node: node.to_string(),
                message: err.to_string(),
            }
        } else {
            TransportError::Remote {
                node: node.to_string(),
                message: err.to_string(),
            }
        }
    }

    async fn fetch_node(&self, address: &str) -> Result<DiscoveryNode, reqwest::Error> {
        self.client
            .get(Self::url(address, NODE_INFO_PATH))
            .timeout(self.connect_timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<DiscoveryNode>()
            .await
    }
}

impl Transport for HttpTransport {
    fn send_ping(
        &self,
        target: DiscoveryNode,
        request: PingRequest,
        timeout: Duration,
    ) -> TransportFuture<'_, PingResponse> {
        Box::pin(async move {
            let response = self
                .client
                .post(Self::url(&target.address, LEADER_PING_PATH))
                .json(&request)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| self.map_send_error(&target, e, timeout))?;

            let status = response.status();
            if status.is_success() {
                self.mark_connected(&target);
                return Ok(PingResponse {});
            }

            if status == StatusCode::CONFLICT {
                let body: RejectionBody = response
                    .json()
                    .await
                    .map_err(|e| self.map_send_error(&target, e, timeout))?;
                return Err(TransportError::Rejected {
                    node: target.to_string(),
                    rejection: body.rejection,
                });
            }

            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.error,
                Err(_) => format!("unexpected status {status}"),
            };
            Err(TransportError::Remote {
                node: target.to_string(),
                message,
            })
        })
    }

    fn connect(&self, target: DiscoveryNode) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let remote = self
                .fetch_node(&target.address)
                .await
                .map_err(|e| self.map_send_error(&target, e, self.connect_timeout))?;

            if remote != target {
                trace!("expected node {} at {}, found {}", target, target.address, remote);
                self.mark_disconnected(&target);
                return Err(TransportError::Disconnected {
                    node: target.to_string(),
                    message: format!("address is now served by {remote}"),
                });
            }
            self.mark_connected(&target);
            Ok(())
        })
    }

    fn handshake(&self, address: String) -> TransportFuture<'_, DiscoveryNode> {
        Box::pin(async move {
            let node = self.fetch_node(&address).await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout {
                        node: address.clone(),
                        timeout: self.connect_timeout,
                    }
                } else {
                    TransportError::Disconnected {
                        node: address.clone(),
                        message: e.to_string(),
                    }
                }
            })?;
            self.mark_connected(&node);
            Ok(node)
        })
    }

    fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        let mut guard = self.listeners.write().expect("listeners lock poisoned");
        let mut next: Vec<_> = guard.iter().cloned().collect();
        next.push(listener);
        *guard = Arc::new(next);
    }

    fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        let mut guard = self.listeners.write().expect("listeners lock poisoned");
        let next: Vec<_> = guard
            .iter()
            .filter(|l| !std::ptr::addr_eq(Arc::as_ptr(*l), Arc::as_ptr(listener)))
            .cloned()
            .collect();
        *guard = Arc::new(next);
    }
}
