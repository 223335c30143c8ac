//! Per-task append-only log file.
//!
//! Layout: `<log_dir>/<tenant>/<YYYYmmdd-HHMMSS>-<task_id>.log`. The file
//! starts with a header block, then one timestamped line per captured worker
//! output line, and ends with a footer recording the outcome.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ad_core::types::{Backend, Outcome, RunMode, TenantId};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TaskLogError {
    #[error("task log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, TaskLogError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
    /// Lines written by the supervisor itself.
    Supervisor,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
            Stream::Supervisor => "supervisor",
        }
    }
}

/// Environment diagnostics written once at task start.
#[derive(Debug, Clone)]
pub struct LogHeader {
    pub tenant_id: TenantId,
    pub task_id: Uuid,
    pub mode: RunMode,
    pub backend: Backend,
    pub started_at: DateTime<Utc>,
    pub working_dir: Option<PathBuf>,
    pub session_dir: PathBuf,
    pub memory_limit_mb: u64,
    pub timeout: Duration,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The single writer for one task's log. Lines are written whole under a
/// lock, so concurrent capture loops never interleave partial lines.
#[derive(Debug)]
pub struct TaskLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl TaskLog {
    pub fn path_for(
        log_dir: &Path,
        tenant: &TenantId,
        task_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> PathBuf {
        log_dir.join(tenant.as_str()).join(format!(
            "{}-{task_id}.log",
            started_at.format("%Y%m%d-%H%M%S")
        ))
    }

    pub async fn create(
        log_dir: &Path,
        tenant: &TenantId,
        task_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<Self> {
        let path = Self::path_for(log_dir, tenant, task_id, started_at);
        let io_err = |source| TaskLogError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_header(&self, header: &LogHeader) -> Result<()> {
        let working_dir = header
            .working_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .or_else(|| {
                std::env::current_dir()
                    .ok()
                    .map(|p| p.display().to_string())
            })
            .unwrap_or_else(|| "-".into());
        let block = format!(
            "==== auto-deliver task log ====\n\
             service_version: {}\n\
             platform: {}/{}\n\
             supervisor_pid: {}\n\
             tenant_id: {}\n\
             task_id: {}\n\
             mode: {}\n\
             backend: {}\n\
             started_at: {}\n\
             working_dir: {}\n\
             session_dir: {}\n\
             memory_limit_mb: {}\n\
             timeout_secs: {}\n\
             ===============================\n",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH,
            std::process::id(),
            header.tenant_id,
            header.task_id,
            header.mode,
            header.backend,
            timestamp(header.started_at),
            working_dir,
            header.session_dir.display(),
            header.memory_limit_mb,
            header.timeout.as_secs(),
        );
        self.write_raw(block.as_bytes()).await
    }

    /// Append one captured line with a timestamp and stream tag.
    pub async fn append_line(&self, stream: Stream, line: &str) -> Result<()> {
        let record = format!("{} [{}] {}\n", timestamp(Utc::now()), stream.as_str(), line);
        self.write_raw(record.as_bytes()).await
    }

    pub async fn write_footer(&self, outcome: &Outcome) -> Result<()> {
        let mut block = format!(
            "==== finished ====\n\
             state: {}\n\
             exit_code: {}\n\
             finished_at: {}\n\
             duration_ms: {}\n",
            outcome.state.as_str(),
            outcome
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".into()),
            timestamp(outcome.finished_at),
            outcome.duration_ms,
        );
        if let Some(failure) = &outcome.failure {
            block.push_str(&format!("failure: {}: {}\n", failure.kind, failure.message));
            for hint in &failure.hints {
                block.push_str(&format!("hint: {hint}\n"));
            }
        }
        block.push_str("==================\n");
        self.write_raw(block.as_bytes()).await?;
        self.file
            .lock()
            .await
            .flush()
            .await
            .map_err(|source| TaskLogError::Io {
                path: self.path.clone(),
                source,
            })
    }

    async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(bytes)
            .await
            .map_err(|source| TaskLogError::Io {
                path: self.path.clone(),
                source,
            })
    }
}
