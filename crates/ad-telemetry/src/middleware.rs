use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};

use crate::metrics::MetricsCollector;

/// Axum middleware that records API request metrics into an injected collector.
///
/// Install with `axum::middleware::from_fn_with_state(metrics, metrics_middleware)`.
/// The route template (`/api/tenants/{tenant}/...`) is used as the `path` label
/// when available so tenant ids do not explode label cardinality.
pub async fn metrics_middleware(
    State(metrics): State<Arc<MetricsCollector>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    metrics.increment_counter(
        "api_requests_total",
        &[("method", &method), ("path", &path), ("status", &status)],
    );
    metrics.record_histogram(
        "api_request_duration_seconds",
        start.elapsed().as_secs_f64(),
    );

    response
}
