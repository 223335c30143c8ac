use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use super::state::ApiState;

/// GET /api/health -- liveness plus a coarse view of the core.
pub(crate) async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.uptime_seconds(),
        "running_tasks": state.registry.running_count(),
        "online_agents": state.hub.online_count(),
        "pending_challenges": state.relay.pending_count(),
    }))
}

/// GET /api/metrics -- Prometheus text format.
pub(crate) async fn get_metrics_prometheus(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    state.refresh_gauges();
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.export_prometheus(),
    )
}

/// GET /api/metrics/json
pub(crate) async fn get_metrics_json(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    state.refresh_gauges();
    Json(state.metrics.export_json())
}
