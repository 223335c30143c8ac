use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest accepted tenant identifier.
pub const MAX_TENANT_ID_LEN: usize = 64;

/// Longest accepted worker-side task identifier.
pub const MAX_TASK_ID_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Identifier validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("{kind} must not be empty")]
    Empty { kind: &'static str },

    #[error("{kind} is longer than {max} characters")]
    TooLong { kind: &'static str, max: usize },

    #[error("{kind} contains forbidden character {ch:?}")]
    InvalidChar { kind: &'static str, ch: char },
}

/// Check that `raw` is usable as a single path segment.
///
/// Only ASCII alphanumerics, `-` and `_` are accepted. Identifiers are never
/// rewritten: two distinct raw ids always map to two distinct paths.
pub fn validate_segment(kind: &'static str, raw: &str, max: usize) -> Result<(), IdError> {
    if raw.is_empty() {
        return Err(IdError::Empty { kind });
    }
    if raw.chars().count() > max {
        return Err(IdError::TooLong { kind, max });
    }
    if let Some(ch) = raw
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(IdError::InvalidChar { kind, ch });
    }
    Ok(())
}

/// Validate a worker-side task identifier (same alphabet as tenant ids).
pub fn validate_task_id(raw: &str) -> Result<(), IdError> {
    validate_segment("task id", raw, MAX_TASK_ID_LEN)
}

// ---------------------------------------------------------------------------
// TenantId
// ---------------------------------------------------------------------------

/// Sanitized tenant identifier. Safe to embed in filesystem paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, IdError> {
        let raw = raw.into();
        validate_segment("tenant id", &raw, MAX_TENANT_ID_LEN)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// RunMode / Backend
// ---------------------------------------------------------------------------

/// What the worker is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Establish (or refresh) the tenant's login session only.
    LoginOnly,
    /// Full delivery run.
    #[default]
    FullRun,
}

impl RunMode {
    /// Value exported to the worker as `AD_RUN_MODE`.
    pub fn as_env(&self) -> &'static str {
        match self {
            RunMode::LoginOnly => "login",
            RunMode::FullRun => "full",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunMode::LoginOnly => "login_only",
            RunMode::FullRun => "full_run",
        })
    }
}

/// Where the worker executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Subprocess on this host.
    #[default]
    Local,
    /// Browser agent connected over the remote-agent WebSocket.
    Remote,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Local => "local",
            Backend::Remote => "remote",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Starting,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::TimedOut | TaskState::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::TimedOut => "timed_out",
            TaskState::Cancelled => "cancelled",
        }
    }
}

// ---------------------------------------------------------------------------
// TaskStatus: externally visible status of a tenant's task slot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
    Starting,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Stopped,
}

impl From<TaskState> for TaskStatus {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Starting => TaskStatus::Starting,
            TaskState::Running => TaskStatus::Running,
            TaskState::Completed => TaskStatus::Succeeded,
            TaskState::Failed => TaskStatus::Failed,
            TaskState::TimedOut => TaskStatus::TimedOut,
            TaskState::Cancelled => TaskStatus::Stopped,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Why a run failed. `hints` is advisory text for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub hints: Vec<String>,
}

impl FailureInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            hints: Vec::new(),
        }
    }
}

/// Terminal result of one tenant run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub task_id: Uuid,
    pub tenant_id: TenantId,
    pub state: TaskState,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub failure: Option<FailureInfo>,
    pub log_path: Option<PathBuf>,
}

impl Outcome {
    /// Build an outcome that finishes now.
    pub fn finished(
        task_id: Uuid,
        tenant_id: TenantId,
        state: TaskState,
        started_at: DateTime<Utc>,
    ) -> Self {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            task_id,
            tenant_id,
            state,
            exit_code: None,
            started_at,
            finished_at,
            duration_ms,
            failure: None,
            log_path: None,
        }
    }

    pub fn with_failure(mut self, failure: FailureInfo) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_log_path(mut self, path: Option<PathBuf>) -> Self {
        self.log_path = path;
        self
    }

    pub fn is_success(&self) -> bool {
        self.state == TaskState::Completed
    }

    pub fn status(&self) -> TaskStatus {
        self.state.into()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_accepts_safe_alphabet() {
        let id = TenantId::parse("tenant-a_01").unwrap();
        assert_eq!(id.as_str(), "tenant-a_01");
        assert_eq!(id.to_string(), "tenant-a_01");
    }

    #[test]
    fn tenant_id_rejects_path_characters() {
        for raw in ["../etc", "a/b", "a\\b", "a.b", "tenant a", "tenant\0"] {
            assert!(TenantId::parse(raw).is_err(), "{raw:?} should be rejected");
        }
        assert_eq!(
            TenantId::parse("a/b"),
            Err(IdError::InvalidChar {
                kind: "tenant id",
                ch: '/'
            })
        );
    }

    #[test]
    fn tenant_id_rejects_empty_and_long() {
        assert!(matches!(TenantId::parse(""), Err(IdError::Empty { .. })));
        let long = "x".repeat(MAX_TENANT_ID_LEN + 1);
        assert!(matches!(TenantId::parse(long), Err(IdError::TooLong { .. })));
        assert!(TenantId::parse("x".repeat(MAX_TENANT_ID_LEN)).is_ok());
    }

    #[test]
    fn tenant_id_serde_validates() {
        let id: TenantId = serde_json::from_str("\"tenant-b\"").unwrap();
        assert_eq!(id.as_str(), "tenant-b");
        assert!(serde_json::from_str::<TenantId>("\"../../root\"").is_err());
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"tenant-b\"");
    }

    #[test]
    fn task_state_terminality() {
        assert!(TaskState::Starting.is_active());
        assert!(TaskState::Running.is_active());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::TimedOut.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn task_state_maps_to_status() {
        assert_eq!(TaskStatus::from(TaskState::Completed), TaskStatus::Succeeded);
        assert_eq!(TaskStatus::from(TaskState::TimedOut), TaskStatus::TimedOut);
        assert_eq!(TaskStatus::from(TaskState::Cancelled), TaskStatus::Stopped);
    }

    #[test]
    fn run_mode_env_and_serde() {
        assert_eq!(RunMode::LoginOnly.as_env(), "login");
        assert_eq!(RunMode::FullRun.as_env(), "full");
        let mode: RunMode = serde_json::from_str("\"login_only\"").unwrap();
        assert_eq!(mode, RunMode::LoginOnly);
        assert_eq!(RunMode::default(), RunMode::FullRun);
        assert_eq!(Backend::default(), Backend::Local);
    }

    #[test]
    fn outcome_duration_is_non_negative() {
        let tenant = TenantId::parse("t1").unwrap();
        let outcome = Outcome::finished(Uuid::new_v4(), tenant, TaskState::Completed, Utc::now());
        assert!(outcome.is_success());
        assert_eq!(outcome.status(), TaskStatus::Succeeded);
        assert!(outcome.duration_ms < 5_000);
    }
}
