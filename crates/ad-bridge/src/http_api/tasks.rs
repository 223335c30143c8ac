use std::sync::Arc;
use std::time::Duration;

use ad_agents::supervisor::StartOptions;
use ad_core::types::TenantId;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::info;

use super::state::ApiState;
use super::types::StartTaskRequest;
use crate::api_error::ApiError;

pub(crate) fn parse_tenant(raw: &str) -> Result<TenantId, ApiError> {
    Ok(TenantId::parse(raw)?)
}

pub(crate) fn parse_timeout(secs: Option<u64>) -> Result<Option<Duration>, ApiError> {
    match secs {
        Some(0) => Err(ApiError::BadRequest("timeout_secs must be positive".into())),
        Some(s) => Ok(Some(Duration::from_secs(s))),
        None => Ok(None),
    }
}

/// Claim the tenant's slot and hand the run to the supervisor.
pub(crate) fn start_run(
    state: &ApiState,
    tenant: &TenantId,
    options: StartOptions,
) -> Response {
    let mode = options.mode;
    let backend = options.backend;
    match state.supervisor.start(tenant, options) {
        Ok(running) => {
            state.metrics.increment_counter("tasks_started_total", &[]);
            state.refresh_gauges();
            (
                StatusCode::ACCEPTED,
                Json(json!({
                    "accepted": true,
                    "tenant_id": tenant,
                    "task_id": running.task_id(),
                    "mode": mode,
                    "backend": backend,
                })),
            )
                .into_response()
        }
        Err(rejected) => {
            state.metrics.increment_counter("tasks_rejected_total", &[]);
            (
                StatusCode::CONFLICT,
                Json(json!({
                    "accepted": false,
                    "rejected": true,
                    "reason": rejected.reason(),
                    "task_id": rejected.task_id,
                    "state": rejected.state,
                    "running_seconds": rejected.running_seconds,
                })),
            )
                .into_response()
        }
    }
}

/// POST /api/tenants/{tenant}/task/start
///
/// **Response:** 202 with the new task id, or 409 when the tenant already
/// has a run in flight:
///
/// ```json
/// {"accepted": false, "rejected": true, "reason": "...", "running_seconds": 42}
/// ```
pub(crate) async fn start_task(
    State(state): State<Arc<ApiState>>,
    Path(tenant): Path<String>,
    Json(req): Json<StartTaskRequest>,
) -> Result<Response, ApiError> {
    let tenant = parse_tenant(&tenant)?;
    let options = StartOptions {
        mode: req.mode,
        backend: req.backend,
        timeout: parse_timeout(req.timeout_secs)?,
        delivery_config: req.config,
    };
    Ok(start_run(&state, &tenant, options))
}

/// POST /api/tenants/{tenant}/task/stop
pub(crate) async fn stop_task(
    State(state): State<Arc<ApiState>>,
    Path(tenant): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tenant = parse_tenant(&tenant)?;
    let stopped = state.registry.cancel(&tenant);
    state.refresh_gauges();
    if stopped {
        info!(tenant_id = %tenant, "stop requested over http");
        Ok(Json(json!({"stopped": true, "result": "stopped"})))
    } else {
        Ok(Json(json!({"stopped": false, "result": "not_running"})))
    }
}

/// GET /api/tenants/{tenant}/task/status
pub(crate) async fn task_status(
    State(state): State<Arc<ApiState>>,
    Path(tenant): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = parse_tenant(&tenant)?;
    Ok(Json(state.registry.status(&tenant)))
}

/// GET /api/tasks/running
pub(crate) async fn running_tasks(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let tenants = state.registry.running_tenant_ids();
    Json(json!({
        "count": tenants.len(),
        "tenants": tenants,
    }))
}
