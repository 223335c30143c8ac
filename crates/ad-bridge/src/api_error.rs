//! HTTP API error types.
//!
//! Every handler returns `Result<_, ApiError>`; the body is always
//! `{"error": <message>, "code": <machine code>}`.

use std::time::Duration;

use ad_core::isolation::PathGuardError;
use ad_core::types::IdError;
use ad_session::verification::RelayError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The resource existed but is no longer usable (expired challenge).
    #[error("gone: {0}")]
    Gone(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Gone(_) => StatusCode::GONE,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "not_found",
            ApiError::Gone(_) => "expired",
            ApiError::Conflict(_) => "conflict",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::Timeout(_) => "timeout",
            ApiError::InternalError(_) => "internal",
        }
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl From<IdError> for ApiError {
    fn from(e: IdError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::InvalidId(e) => ApiError::BadRequest(e.to_string()),
            RelayError::NotFound(id) => ApiError::NotFound(format!("verification request {id}")),
            RelayError::Expired(id) => ApiError::Gone(format!("verification request {id} has expired")),
            RelayError::AlreadyAnswered(id) => {
                ApiError::Conflict(format!("verification request {id} was already answered"))
            }
            RelayError::Timeout(after) => ApiError::Timeout(after),
            RelayError::Artifact(PathGuardError::Outside(_)) => {
                ApiError::Forbidden("artifact lies outside the artifact directory".into())
            }
            RelayError::Artifact(PathGuardError::Unresolvable { .. }) => {
                ApiError::NotFound("artifact file".into())
            }
            RelayError::Io(e) => ApiError::InternalError(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// IntoResponse implementation
// ---------------------------------------------------------------------------

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));
        (status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
