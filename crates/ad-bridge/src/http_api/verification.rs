use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use super::state::ApiState;
use super::tasks::parse_tenant;
use super::types::{
    AnswerRequest, AwaitAnswerRequest, ChallengeQuery, ChallengeView, PublishChallengeRequest,
};
use crate::api_error::ApiError;

/// POST /api/verification -- a worker hands a challenge to a human.
///
/// Returns the request id and the artifact path the worker should write its
/// screenshot to.
pub(crate) async fn publish_challenge(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<PublishChallengeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = parse_tenant(&req.tenant_id)?;
    let artifact_path = match req.artifact_path {
        Some(path) => path,
        None => state.relay.challenge_artifact_path(&tenant, &req.task_id)?,
    };
    let request_id = state.relay.publish(
        &tenant,
        &req.task_id,
        &req.challenge_label,
        artifact_path.clone(),
    )?;
    state.refresh_gauges();
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "request_id": request_id,
            "artifact_path": artifact_path,
        })),
    ))
}

/// GET /api/verification/{request_id}
///
/// 404 for unknown ids, 410 once the challenge has expired.
pub(crate) async fn get_challenge(
    State(state): State<Arc<ApiState>>,
    Path(request_id): Path<String>,
) -> Result<Json<ChallengeView>, ApiError> {
    Ok(Json(state.relay.lookup(&request_id)?.into()))
}

/// GET /api/verification?tenant_id=&task_id=
///
/// With `task_id` returns that task's challenge; without it, every pending
/// challenge of the tenant.
pub(crate) async fn find_challenges(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ChallengeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = parse_tenant(&query.tenant_id)?;
    match query.task_id {
        Some(task_id) => {
            let view: ChallengeView = state
                .relay
                .lookup_by_tenant_and_task(&tenant, &task_id)?
                .into();
            Ok(Json(json!(view)))
        }
        None => {
            let views: Vec<ChallengeView> = state
                .relay
                .pending_for_tenant(&tenant)
                .into_iter()
                .map(ChallengeView::from)
                .collect();
            Ok(Json(json!(views)))
        }
    }
}

/// POST /api/verification/answer
///
/// **Response:** `{"accepted": true}`, or the rejection with a matching
/// status: `{"accepted": false, "rejected": "expired" | "not_found" | "already_answered"}`.
pub(crate) async fn answer_challenge(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<AnswerRequest>,
) -> impl IntoResponse {
    match state.relay.answer(&req.request_id, &req.answer) {
        Ok(()) => {
            state
                .metrics
                .increment_counter("verification_answered_total", &[("result", "accepted")]);
            (StatusCode::OK, Json(json!({"accepted": true})))
        }
        Err(e) => {
            let err = ApiError::from(e);
            let rejected = match &err {
                ApiError::Gone(_) => "expired",
                ApiError::Conflict(_) => "already_answered",
                ApiError::NotFound(_) => "not_found",
                _ => err.code(),
            };
            state
                .metrics
                .increment_counter("verification_answered_total", &[("result", rejected)]);
            (
                err.status(),
                Json(json!({
                    "accepted": false,
                    "rejected": rejected,
                    "error": err.to_string(),
                })),
            )
        }
    }
}

/// POST /api/verification/await -- worker long-poll for the answer.
///
/// The wait is capped at `verification.max_wait_secs`; 408 when it runs out.
pub(crate) async fn await_answer(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<AwaitAnswerRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tenant = parse_tenant(&req.tenant_id)?;
    let cap = state.verification.max_wait_secs.max(1);
    let timeout = Duration::from_secs(req.timeout_secs.unwrap_or(cap).clamp(1, cap));
    let answer = state
        .relay
        .await_answer(&tenant, &req.task_id, timeout)
        .await?;
    state.refresh_gauges();
    Ok(Json(json!({ "answer": answer })))
}

/// GET /api/verification/{request_id}/artifact
///
/// Served only after the path is confirmed to lie inside the artifact dir.
pub(crate) async fn get_artifact(
    State(state): State<Arc<ApiState>>,
    Path(request_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let path = state.relay.resolve_artifact(&request_id)?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::NotFound("artifact file".into()))?;
    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    };
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-store"),
        ],
        bytes,
    ))
}
