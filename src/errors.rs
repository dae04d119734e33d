//! Error types for the leader ping protocol.
//!
//! [`PingRejection`] is the closed set of authoritative answers a leader can
//! give instead of an acknowledgement.  [`TransportError`] classifies a
//! failed request on the follower side, and [`PingError`] is what the leader's
//! handler returns; it implements [`axum::response::IntoResponse`] so the
//! route can simply return `Err(..)`.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::messages::{ErrorBody, RejectionBody};

/// Authoritative rejection of a leader ping.
///
/// Retrying cannot turn any of these into a success: the follower's premise
/// about who the leader is has been proven wrong.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PingRejection {
    /// The ping reached a node that is not the leader it was addressed to
    /// (different incarnation, or a different cluster).
    #[error("{message}")]
    NotTheLeader { message: String },

    /// The pinging node is not part of the leader's cluster state.
    #[error("node [{node}] does not exist on the leader")]
    UnknownToLeader { node: String },

    /// The pinged node lost leadership before it could check the ping.
    #[error("local node is not the leader")]
    NoLongerLeader,
}

impl PingRejection {
    /// Short label used in logs and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            PingRejection::NotTheLeader { .. } => "not_the_leader",
            PingRejection::UnknownToLeader { .. } => "unknown_to_leader",
            PingRejection::NoLongerLeader => "no_longer_leader",
        }
    }
}

/// Failure of a single request sent through the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection to the node could not be established or was lost.
    #[error("node [{node}] disconnected: {message}")]
    Disconnected { node: String, message: String },

    /// No answer within the request deadline.
    #[error("request to [{node}] timed out after {timeout:?}")]
    Timeout { node: String, timeout: Duration },

    /// The remote node answered with an authoritative rejection.
    #[error("rejected by [{node}]: {rejection}")]
    Rejected {
        node: String,
        rejection: PingRejection,
    },

    /// The remote node failed to process the request.
    #[error("request to [{node}] failed: {message}")]
    Remote { node: String, message: String },
}

impl TransportError {
    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Disconnected { .. } => "disconnected",
            TransportError::Timeout { .. } => "timeout",
            TransportError::Rejected { rejection, .. } => rejection.code(),
            TransportError::Remote { .. } => "remote",
        }
    }
}

/// Failure of a serialized cluster state task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateTaskError {
    /// The task only runs on the leader and the local node is not it.
    #[error("local node is not the leader")]
    NotLeader,

    /// The task looked for a node that is not in the cluster state.
    #[error("node [{node}] does not exist in the cluster state")]
    NodeDoesNotExist { node: String },

    /// The state queue has stopped accepting tasks.
    #[error("cluster state queue is closed")]
    QueueClosed,
}

/// A task could not be handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("scheduler is shut down")]
    Closed,
}

/// Error returned by the leader's ping handler.
#[derive(Debug, Error)]
pub enum PingError {
    /// Authoritative rejection, sent back as `409 Conflict`.
    #[error(transparent)]
    Rejected(#[from] PingRejection),

    /// Unexpected failure while checking the ping, sent back as `500`.
    #[error("{0}")]
    Internal(String),
}

impl PingError {
    /// Return the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            PingError::Rejected(_) => StatusCode::CONFLICT,
            PingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PingError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            PingError::Rejected(rejection) => {
                (status, Json(RejectionBody { rejection })).into_response()
            }
            PingError::Internal(error) => (status, Json(ErrorBody { error })).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_wire_format() {
        let json = serde_json::to_string(&PingRejection::NoLongerLeader).unwrap();
        assert_eq!(json, r#"{"kind":"no_longer_leader"}"#);

        let parsed: PingRejection =
            serde_json::from_str(r#"{"kind":"unknown_to_leader","node":"n1"}"#).unwrap();
        assert_eq!(
            parsed,
            PingRejection::UnknownToLeader {
                node: "n1".to_string()
            }
        );
    }

    #[test]
    fn test_transport_error_kind_uses_rejection_code() {
        let err = TransportError::Rejected {
            node: "n1".to_string(),
            rejection: PingRejection::NotTheLeader {
                message: "x".to_string(),
            },
        };
        assert_eq!(err.kind(), "not_the_leader");

        let err = TransportError::Timeout {
            node: "n1".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn test_ping_error_status_codes() {
        let rejected = PingError::from(PingRejection::NoLongerLeader);
        assert_eq!(rejected.status_code(), StatusCode::CONFLICT);
        assert_eq!(rejected.into_response().status(), StatusCode::CONFLICT);

        let internal = PingError::Internal("boom".to_string());
        assert_eq!(
            internal.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
