use std::sync::Arc;

use ad_agents::supervisor::StartOptions;
use ad_core::types::{Backend, RunMode};
use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::state::ApiState;
use super::tasks::{parse_tenant, parse_timeout, start_run};
use super::types::{RemoteDeliveryRequest, RemoteLoginRequest};
use crate::api_error::ApiError;

/// GET /api/tenants/{tenant}/remote
pub(crate) async fn remote_status(
    State(state): State<Arc<ApiState>>,
    Path(tenant): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = parse_tenant(&tenant)?;
    Ok(Json(json!({
        "tenant_id": tenant,
        "online": state.hub.is_online(&tenant),
        "state": state.hub.state(&tenant),
    })))
}

/// POST /api/tenants/{tenant}/remote/login
///
/// Blocks until the agent confirms, fails, disconnects or the timeout
/// passes. The timeout is capped at `remote.login_timeout_secs`. An offline
/// tenant answers at once with `"outcome": "offline"`.
pub(crate) async fn remote_login(
    State(state): State<Arc<ApiState>>,
    Path(tenant): Path<String>,
    Json(req): Json<RemoteLoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = parse_tenant(&tenant)?;
    let cap = state.remote.login_timeout();
    let timeout = parse_timeout(req.timeout_secs)?.map_or(cap, |t| t.min(cap));
    let outcome = state.hub.request_login(&tenant, timeout).await;
    state
        .metrics
        .increment_counter("remote_login_total", &[("outcome", outcome.as_str())]);
    Ok(Json(json!({
        "tenant_id": tenant,
        "success": outcome.is_success(),
        "outcome": outcome.as_str(),
        "detail": outcome,
    })))
}

/// POST /api/tenants/{tenant}/remote/delivery
///
/// Starts a full run on the tenant's remote agent. Goes through the task
/// registry, so it conflicts with any other run for the tenant.
pub(crate) async fn remote_delivery(
    State(state): State<Arc<ApiState>>,
    Path(tenant): Path<String>,
    Json(req): Json<RemoteDeliveryRequest>,
) -> Result<Response, ApiError> {
    let tenant = parse_tenant(&tenant)?;
    if !state.hub.is_online(&tenant) {
        return Err(ApiError::Conflict(format!(
            "remote agent for tenant {tenant} is offline"
        )));
    }
    let options = StartOptions {
        mode: RunMode::FullRun,
        backend: Backend::Remote,
        timeout: parse_timeout(req.timeout_secs)?,
        delivery_config: req.config,
    };
    Ok(start_run(&state, &tenant, options))
}
