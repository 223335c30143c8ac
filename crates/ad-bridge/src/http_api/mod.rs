// ---------------------------------------------------------------------------
// HTTP API module directory
// ---------------------------------------------------------------------------
//
// One sub-module per surface: task triggers, the verification relay, remote
// agent control, event streaming and health/metrics. This file owns the
// router and its middleware stack.

mod misc;
mod remote;
pub mod state;
mod tasks;
pub mod types;
mod verification;
mod websocket;

pub use state::ApiState;
pub use types::*;

use std::sync::Arc;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::agent_ws;
use crate::auth::AuthLayer;
use ad_telemetry::middleware::metrics_middleware;
use ad_telemetry::tracing_setup::request_id_middleware;

// ---------------------------------------------------------------------------
// Router + middleware
// ---------------------------------------------------------------------------

/// Build the API router without authentication.
pub fn api_router(state: Arc<ApiState>) -> Router {
    api_router_with_auth(state, None)
}

/// Build the full API router.
///
/// When `api_key` is `Some`, [`AuthLayer`] requires every request outside
/// `/api/health` to carry it.
pub fn api_router_with_auth(state: Arc<ApiState>, api_key: Option<String>) -> Router {
    let metrics = Arc::clone(&state.metrics);
    Router::new()
        .route("/api/health", get(misc::health))
        // Task triggers
        .route("/api/tenants/{tenant}/task/start", post(tasks::start_task))
        .route("/api/tenants/{tenant}/task/stop", post(tasks::stop_task))
        .route("/api/tenants/{tenant}/task/status", get(tasks::task_status))
        .route("/api/tasks/running", get(tasks::running_tasks))
        // Verification relay
        .route(
            "/api/verification",
            post(verification::publish_challenge).get(verification::find_challenges),
        )
        .route(
            "/api/verification/answer",
            post(verification::answer_challenge),
        )
        .route("/api/verification/await", post(verification::await_answer))
        .route(
            "/api/verification/{request_id}",
            get(verification::get_challenge),
        )
        .route(
            "/api/verification/{request_id}/artifact",
            get(verification::get_artifact),
        )
        // Remote agents
        .route("/api/tenants/{tenant}/remote", get(remote::remote_status))
        .route(
            "/api/tenants/{tenant}/remote/login",
            post(remote::remote_login),
        )
        .route(
            "/api/tenants/{tenant}/remote/delivery",
            post(remote::remote_delivery),
        )
        .route("/ws/agent/{tenant}", get(agent_ws::agent_ws))
        // Events + metrics
        .route("/api/events/ws", get(websocket::events_ws_handler))
        .route("/api/metrics", get(misc::get_metrics_prometheus))
        .route("/api/metrics/json", get(misc::get_metrics_json))
        .route_layer(axum_middleware::from_fn_with_state(
            metrics,
            metrics_middleware,
        ))
        .layer(axum_middleware::from_fn(request_id_middleware))
        .layer(AuthLayer::new(api_key))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}
