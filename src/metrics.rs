//! Prometheus metrics for leaderwatch.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants for the HTTP surface and for both sides of
//! the leader ping protocol, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

use crate::cluster::messages::{LEADER_PING_PATH, NODE_INFO_PATH};

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "leaderwatch_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "leaderwatch_http_request_duration_seconds";

/// Leader pings sent by this node, retries included (counter).
pub const PINGS_SENT_TOTAL: &str = "leaderwatch_pings_sent_total";

/// Failed leader ping attempts (counter). Labels: kind.
pub const PING_FAILURES_TOTAL: &str = "leaderwatch_ping_failures_total";

/// Leader failure events raised (counter).
pub const LEADER_FAILURES_TOTAL: &str = "leaderwatch_leader_failures_total";

/// Leader pings answered by this node (counter). Labels: outcome.
pub const PINGS_HANDLED_TOTAL: &str = "leaderwatch_pings_handled_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(PINGS_SENT_TOTAL, "Leader pings sent, retries included");
    describe_counter!(PING_FAILURES_TOTAL, "Failed leader ping attempts by kind");
    describe_counter!(LEADER_FAILURES_TOTAL, "Leader failure events raised");
    describe_counter!(PINGS_HANDLED_TOTAL, "Leader pings answered by outcome");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path, "status" => status)
        .increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

/// Map a request path to a bounded label value.  Unknown paths collapse to
/// `/other` so scanners cannot blow up label cardinality.
fn normalize_path(path: &str) -> &'static str {
    match path {
        "/health" => "/health",
        "/metrics" => "/metrics",
        LEADER_PING_PATH => LEADER_PING_PATH,
        NODE_INFO_PATH => NODE_INFO_PATH,
        _ => "/other",
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics are disabled").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_known_routes() {
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/metrics"), "/metrics");
        assert_eq!(normalize_path("/internal/leader_ping"), "/internal/leader_ping");
        assert_eq!(normalize_path("/internal/node"), "/internal/node");
    }

    #[test]
    fn test_normalize_path_collapses_unknown() {
        assert_eq!(normalize_path("/"), "/other");
        assert_eq!(normalize_path("/internal/leader_ping/extra"), "/other");
        assert_eq!(normalize_path("/wp-login.php"), "/other");
    }
}
