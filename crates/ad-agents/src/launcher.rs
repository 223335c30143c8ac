use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use ad_core::event_bus::{Event, EventBus};
use ad_core::types::{Backend, FailureInfo, RunMode, TenantId};
use ad_session::remote_hub::{HubError, LoginOutcome, RemoteSessionHub};
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {0} stream was not captured")]
    MissingPipe(&'static str),

    #[error("remote agent for tenant {0} is offline")]
    AgentOffline(TenantId),

    #[error("remote agent: {0}")]
    Hub(#[from] HubError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no launcher configured for backend {0}")]
    Unsupported(Backend),
}

impl LaunchError {
    /// Short class name recorded as the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            LaunchError::Spawn { .. } => "SpawnFailed",
            LaunchError::MissingPipe(_) => "MissingPipe",
            LaunchError::AgentOffline(_) => "AgentOffline",
            LaunchError::Hub(HubError::Offline(_)) => "AgentOffline",
            LaunchError::Hub(HubError::ChannelClosed(_)) => "AgentDisconnected",
            LaunchError::Io(_) => "Io",
            LaunchError::Unsupported(_) => "Unsupported",
        }
    }
}

pub type Result<T> = std::result::Result<T, LaunchError>;

// ---------------------------------------------------------------------------
// Launch contract
// ---------------------------------------------------------------------------

/// Everything a launcher needs to start one isolated worker.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub tenant_id: TenantId,
    pub task_id: Uuid,
    pub mode: RunMode,
    pub session_dir: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub memory_limit_mb: u64,
    pub timeout: Duration,
    /// Full environment handed to the worker (`AD_*` plus configured extras).
    pub env: BTreeMap<String, String>,
    /// Opaque delivery settings forwarded to remote agents.
    pub delivery_config: serde_json::Value,
}

impl LaunchSpec {
    /// The `AD_*` variables every worker receives, merged over `extra`.
    pub fn worker_env(
        tenant: &TenantId,
        task_id: Uuid,
        mode: RunMode,
        session_dir: &std::path::Path,
        memory_limit_mb: u64,
        extra: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut env = extra.clone();
        env.insert("AD_TENANT_ID".into(), tenant.to_string());
        env.insert("AD_TASK_ID".into(), task_id.to_string());
        env.insert("AD_RUN_MODE".into(), mode.as_env().into());
        env.insert("AD_SESSION_DIR".into(), session_dir.display().to_string());
        env.insert("AD_MEMORY_LIMIT_MB".into(), memory_limit_mb.to_string());
        env
    }
}

/// How a worker ended on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    /// Process exit code; `None` when killed by a signal or not a process.
    pub code: Option<i32>,
    pub failure: Option<FailureInfo>,
}

impl WorkerExit {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            failure: None,
        }
    }

    pub fn failed(failure: FailureInfo) -> Self {
        Self {
            code: None,
            failure: Some(failure),
        }
    }

    pub fn from_status(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            failure: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.code == Some(0)
    }
}

pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Control side of a launched worker.
#[async_trait::async_trait]
pub trait WorkerControl: Send {
    /// Wait for natural completion. Must be cancel-safe.
    async fn wait(&mut self) -> Result<WorkerExit>;

    /// Forcibly terminate the worker.
    async fn kill(&mut self) -> Result<()>;
}

pub struct LaunchedWorker {
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    pub control: Box<dyn WorkerControl>,
}

/// Starts workers for one backend. Both variants satisfy the same contract,
/// so the supervisor does not care which one runs a task.
#[async_trait::async_trait]
pub trait WorkerLauncher: Send + Sync {
    fn backend(&self) -> Backend;

    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorker>;
}

// ---------------------------------------------------------------------------
// Local subprocess
// ---------------------------------------------------------------------------

/// Runs the worker as a child process in its own process group.
pub struct LocalProcessLauncher {
    program: String,
    args: Vec<String>,
}

impl LocalProcessLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait::async_trait]
impl WorkerLauncher for LocalProcessLauncher {
    fn backend(&self) -> Backend {
        Backend::Local
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorker> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            cmd.process_group(0);
            apply_memory_limit(&mut cmd, spec.memory_limit_mb);
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let stdout = child.stdout.take().ok_or(LaunchError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(LaunchError::MissingPipe("stderr"))?;
        let pid = child.id();
        info!(
            tenant_id = %spec.tenant_id,
            task_id = %spec.task_id,
            program = %self.program,
            pid,
            "worker process spawned"
        );

        Ok(LaunchedWorker {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            control: Box::new(LocalWorker { child, pid }),
        })
    }
}

/// Cap the child's address space before exec.
#[cfg(unix)]
fn apply_memory_limit(cmd: &mut Command, memory_limit_mb: u64) {
    if memory_limit_mb == 0 {
        return;
    }
    let bytes = memory_limit_mb.saturating_mul(1024 * 1024) as libc::rlim_t;
    // SAFETY: the closure only calls async-signal-safe setrlimit between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            let limit = libc::rlimit {
                rlim_cur: bytes,
                rlim_max: bytes,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

struct LocalWorker {
    child: Child,
    pid: Option<u32>,
}

#[async_trait::async_trait]
impl WorkerControl for LocalWorker {
    async fn wait(&mut self) -> Result<WorkerExit> {
        let status = self.child.wait().await?;
        Ok(WorkerExit::from_status(status))
    }

    async fn kill(&mut self) -> Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // The worker leads its own group; take its browser children too.
            // SAFETY: plain syscall on a pid we spawned.
            let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
            if rc != 0 {
                debug!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
            }
        }
        if let Err(e) = self.child.start_kill() {
            debug!(pid = self.pid, error = %e, "start_kill after group kill");
        }
        self.child.wait().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Remote agent
// ---------------------------------------------------------------------------

/// Delegates the run to the tenant's connected remote browser agent.
///
/// Login-only runs block on the hub's login rendezvous. Full runs send
/// `start_delivery` and finish on `delivery_complete`; progress messages
/// become output lines.
pub struct RemoteAgentLauncher {
    hub: Arc<RemoteSessionHub>,
    events: EventBus,
}

impl RemoteAgentLauncher {
    pub fn new(hub: Arc<RemoteSessionHub>, events: EventBus) -> Self {
        Self { hub, events }
    }
}

async fn emit(out: &mut DuplexStream, line: &str) {
    if let Err(e) = out.write_all(format!("{line}\n").as_bytes()).await {
        debug!(error = %e, "remote output reader gone");
    }
}

#[async_trait::async_trait]
impl WorkerLauncher for RemoteAgentLauncher {
    fn backend(&self) -> Backend {
        Backend::Remote
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorker> {
        let tenant = spec.tenant_id.clone();
        if !self.hub.is_online(&tenant) {
            return Err(LaunchError::AgentOffline(tenant));
        }

        let (mut out, reader) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();

        let driver: JoinHandle<()> = match spec.mode {
            RunMode::LoginOnly => {
                let hub = Arc::clone(&self.hub);
                let timeout = spec.timeout.min(hub.default_login_timeout());
                tokio::spawn(async move {
                    emit(&mut out, "requesting login from remote agent").await;
                    let outcome = hub.request_login(&tenant, timeout).await;
                    emit(&mut out, &format!("login outcome: {}", outcome.as_str())).await;
                    let exit = match outcome {
                        LoginOutcome::Succeeded => WorkerExit::success(),
                        LoginOutcome::Failed(reason) => {
                            WorkerExit::failed(FailureInfo::new("LoginFailed", reason))
                        }
                        LoginOutcome::Offline => WorkerExit::failed(FailureInfo::new(
                            "AgentOffline",
                            "remote agent went offline",
                        )),
                        LoginOutcome::TimedOut => WorkerExit::failed(FailureInfo::new(
                            "LoginTimeout",
                            format!("login not confirmed within {}s", timeout.as_secs()),
                        )),
                        LoginOutcome::Cancelled => WorkerExit::failed(FailureInfo::new(
                            "LoginCancelled",
                            "login withdrawn before the agent answered",
                        )),
                        LoginOutcome::Disconnected | LoginOutcome::Superseded => {
                            WorkerExit::failed(FailureInfo::new(
                                "AgentDisconnected",
                                format!("remote session ended during login ({})", outcome.as_str()),
                            ))
                        }
                    };
                    let _ = exit_tx.send(exit);
                })
            }
            RunMode::FullRun => {
                // Subscribe before dispatching so a fast completion is not missed.
                let rx = self.events.subscribe();
                self.hub
                    .send_delivery_command(&tenant, spec.delivery_config.clone())?;
                tokio::spawn(async move {
                    emit(&mut out, "start_delivery sent to remote agent").await;
                    let exit = follow_delivery(&tenant, rx, &mut out).await;
                    let _ = exit_tx.send(exit);
                })
            }
        };

        info!(tenant_id = %spec.tenant_id, task_id = %spec.task_id, mode = %spec.mode, "remote run dispatched");
        Ok(LaunchedWorker {
            stdout: Box::new(reader),
            stderr: Box::new(tokio::io::empty()),
            control: Box::new(RemoteWorker {
                tenant: spec.tenant_id.clone(),
                mode: spec.mode,
                hub: Arc::clone(&self.hub),
                exit: exit_rx,
                driver: Some(driver),
            }),
        })
    }
}

/// Relay one tenant's delivery events into output lines until it ends.
async fn follow_delivery(
    tenant: &TenantId,
    rx: flume::Receiver<Event>,
    out: &mut DuplexStream,
) -> WorkerExit {
    while let Ok(event) = rx.recv_async().await {
        if event.tenant_id() != tenant {
            continue;
        }
        match event {
            Event::DeliveryProgress { progress, .. } => {
                emit(out, &format!("progress: {progress}")).await;
            }
            Event::DeliveryComplete { summary, .. } => {
                emit(out, &format!("delivery complete: {summary}")).await;
                return WorkerExit::success();
            }
            Event::AgentDisconnected { .. } => {
                emit(out, "remote agent disconnected").await;
                return WorkerExit::failed(FailureInfo::new(
                    "AgentDisconnected",
                    "remote agent disconnected during delivery",
                ));
            }
            _ => {}
        }
    }
    WorkerExit::failed(FailureInfo::new("EventBusClosed", "event stream ended"))
}

struct RemoteWorker {
    tenant: TenantId,
    mode: RunMode,
    hub: Arc<RemoteSessionHub>,
    exit: oneshot::Receiver<WorkerExit>,
    driver: Option<JoinHandle<()>>,
}

#[async_trait::async_trait]
impl WorkerControl for RemoteWorker {
    async fn wait(&mut self) -> Result<WorkerExit> {
        match (&mut self.exit).await {
            Ok(exit) => Ok(exit),
            Err(_) => Ok(WorkerExit::failed(FailureInfo::new(
                "Aborted",
                "remote run driver stopped without a result",
            ))),
        }
    }

    async fn kill(&mut self) -> Result<()> {
        // Dropping the driver withdraws a pending login from the hub; wait
        // for it so the session is back to `Connected` when kill returns.
        if let Some(driver) = self.driver.take() {
            driver.abort();
            if let Err(e) = driver.await {
                if !e.is_cancelled() {
                    warn!(tenant_id = %self.tenant, error = %e, "remote run driver failed");
                }
            }
        }
        if self.mode == RunMode::FullRun {
            if let Err(e) = self.hub.stop_delivery(&self.tenant) {
                warn!(tenant_id = %self.tenant, error = %e, "stop_delivery not delivered");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_env_carries_tenant_and_mode() {
        let tenant = TenantId::parse("tenant-a").unwrap();
        let mut extra = BTreeMap::new();
        extra.insert("DRIVER_PATH".to_string(), "/opt/driver".to_string());
        extra.insert("AD_TENANT_ID".to_string(), "spoofed".to_string());
        let env = LaunchSpec::worker_env(
            &tenant,
            Uuid::nil(),
            RunMode::LoginOnly,
            std::path::Path::new("/tmp/s/tenant-tenant-a"),
            256,
            &extra,
        );
        assert_eq!(env["AD_TENANT_ID"], "tenant-a");
        assert_eq!(env["AD_RUN_MODE"], "login");
        assert_eq!(env["AD_SESSION_DIR"], "/tmp/s/tenant-tenant-a");
        assert_eq!(env["AD_MEMORY_LIMIT_MB"], "256");
        assert_eq!(env["DRIVER_PATH"], "/opt/driver");
    }

    #[test]
    fn exit_success_rules() {
        assert!(WorkerExit::success().is_success());
        assert!(!WorkerExit {
            code: Some(2),
            failure: None
        }
        .is_success());
        assert!(!WorkerExit::failed(FailureInfo::new("X", "y")).is_success());
    }

    #[test]
    fn launch_error_kinds() {
        let tenant = TenantId::parse("t").unwrap();
        assert_eq!(LaunchError::AgentOffline(tenant.clone()).kind(), "AgentOffline");
        assert_eq!(
            LaunchError::Hub(HubError::ChannelClosed(tenant)).kind(),
            "AgentDisconnected"
        );
    }
}
