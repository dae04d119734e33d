//! Axum router construction.
//!
//! The [`app`] function wires the leader ping protocol endpoints and the
//! operational endpoints to their handlers and returns a ready-to-serve
//! [`axum::Router`].

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::cluster::messages::{PingRequest, PingResponse, LEADER_PING_PATH, NODE_INFO_PATH};
use crate::cluster::node::DiscoveryNode;
use crate::errors::PingError;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

/// Build the axum [`Router`] serving this node.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route(NODE_INFO_PATH, get(node_info))
        .route(LEADER_PING_PATH, post(leader_ping))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        // Outermost, so it captures the full request lifecycle.
        .layer(middleware::from_fn(metrics_middleware))
}

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// `GET /internal/node` -- Identity of this node, used as the handshake.
async fn node_info(State(state): State<Arc<AppState>>) -> Json<DiscoveryNode> {
    Json(state.local_node.clone())
}

/// `POST /internal/leader_ping` -- Validate a follower's leader ping.
async fn leader_ping(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PingRequest>,
) -> Result<Json<PingResponse>, PingError> {
    state.validator.handle_ping(request).await.map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::messages::RejectionBody;
    use crate::cluster::node::ClusterName;
    use crate::cluster::ping_handler::LeaderPingValidator;
    use crate::cluster::state::{ClusterState, ClusterStateService};
    use crate::errors::PingRejection;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn leader() -> DiscoveryNode {
        DiscoveryNode::with_ephemeral_id("leader", "e1", "http://leader")
    }

    fn follower() -> DiscoveryNode {
        DiscoveryNode::with_ephemeral_id("follower", "e2", "http://follower")
    }

    fn test_app(members: &[DiscoveryNode]) -> Router {
        let mut state = ClusterState::new(ClusterName::new("test"), leader())
            .with_leader(Some("leader".into()));
        for member in members {
            state = state.with_node(member.clone());
        }
        let service = ClusterStateService::start(state);
        app(Arc::new(AppState {
            local_node: leader(),
            validator: LeaderPingValidator::new(ClusterName::new("test"), service.clone(), service),
        }))
    }

    fn ping_request(request: &PingRequest) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(LEADER_PING_PATH)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(request).unwrap()))
            .unwrap()
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_health() {
        let response = test_app(&[])
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, br#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_node_info_returns_local_node() {
        let response = test_app(&[])
            .oneshot(Request::get(NODE_INFO_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let node: DiscoveryNode = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(node, leader());
    }

    #[tokio::test]
    async fn test_ping_from_member_is_acknowledged() {
        let request = PingRequest::new(follower(), leader(), Some(ClusterName::new("test")));
        let response = test_app(&[follower()])
            .oneshot(ping_request(&request))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"{}");
    }

    #[tokio::test]
    async fn test_ping_from_stranger_is_conflict() {
        let request = PingRequest::new(follower(), leader(), None);
        let response = test_app(&[]).oneshot(ping_request(&request)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body: RejectionBody = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(
            body.rejection,
            PingRejection::UnknownToLeader {
                node: follower().to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_ping_is_client_error() {
        let response = test_app(&[])
            .oneshot(
                Request::post(LEADER_PING_PATH)
                    .header("content-type", "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
