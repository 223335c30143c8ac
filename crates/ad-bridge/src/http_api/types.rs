use std::path::PathBuf;

use ad_core::types::{Backend, RunMode};
use ad_session::verification::VerificationRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct StartTaskRequest {
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub backend: Backend,
    pub timeout_secs: Option<u64>,
    /// Forwarded to remote agents with `start_delivery`.
    #[serde(default)]
    pub config: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PublishChallengeRequest {
    pub tenant_id: String,
    pub task_id: String,
    pub challenge_label: String,
    /// Omit to have the relay allocate a namespaced path.
    pub artifact_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct ChallengeQuery {
    pub tenant_id: String,
    pub task_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub request_id: String,
    pub answer: String,
}

#[derive(Debug, Deserialize)]
pub struct AwaitAnswerRequest {
    pub tenant_id: String,
    pub task_id: String,
    pub timeout_secs: Option<u64>,
}

/// What a human-facing client sees of a challenge. The artifact is exposed
/// as a URL, never as a filesystem path.
#[derive(Debug, Serialize)]
pub struct ChallengeView {
    pub request_id: String,
    pub tenant_id: String,
    pub task_id: String,
    pub challenge_label: String,
    pub artifact_url: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub answered: bool,
}

impl From<VerificationRequest> for ChallengeView {
    fn from(req: VerificationRequest) -> Self {
        Self {
            artifact_url: format!("/api/verification/{}/artifact", req.request_id),
            request_id: req.request_id,
            tenant_id: req.tenant_id.to_string(),
            task_id: req.task_id,
            challenge_label: req.challenge_label,
            created_at: req.created_at,
            expires_at: req.expires_at,
            answered: req.answered,
        }
    }
}

// ---------------------------------------------------------------------------
// Remote agents
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct RemoteLoginRequest {
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoteDeliveryRequest {
    #[serde(default)]
    pub config: serde_json::Value,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub tenant_id: Option<String>,
}
