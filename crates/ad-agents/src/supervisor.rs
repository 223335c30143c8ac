use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ad_core::config::WorkerConfig;
use ad_core::event_bus::{Event, EventBus};
use ad_core::isolation;
use ad_core::types::{Backend, FailureInfo, Outcome, RunMode, TaskState, TenantId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::hints::troubleshooting_hints;
use crate::launcher::{LaunchSpec, LaunchedWorker, OutputStream, WorkerExit, WorkerLauncher};
use crate::registry::{StartRejected, TaskHandle, TaskRegistry};
use crate::task_log::{LogHeader, Stream, TaskLog};

// ---------------------------------------------------------------------------
// Start options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub mode: RunMode,
    pub backend: Backend,
    /// Overrides the configured timeout for the mode.
    pub timeout: Option<Duration>,
    /// Forwarded to remote agents with `start_delivery`.
    pub delivery_config: serde_json::Value,
}

/// A run that has been handed to background execution.
pub struct RunningTask {
    pub handle: TaskHandle,
    join: JoinHandle<Outcome>,
}

impl RunningTask {
    pub fn task_id(&self) -> Uuid {
        self.handle.task_id
    }

    /// Wait for the terminal outcome.
    pub async fn outcome(self) -> Outcome {
        let handle = self.handle;
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::finished(
                handle.task_id,
                handle.tenant_id,
                TaskState::Failed,
                handle.started_at,
            )
            .with_failure(FailureInfo::new("Panic", e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Completion guard
// ---------------------------------------------------------------------------

/// Frees the registry slot however the run ends, including panics and
/// aborted futures.
struct CompletionGuard {
    registry: Arc<TaskRegistry>,
    handle: TaskHandle,
    outcome: Option<Outcome>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| {
            error!(
                tenant_id = %self.handle.tenant_id,
                task_id = %self.handle.task_id,
                "run ended without an outcome"
            );
            Outcome::finished(
                self.handle.task_id,
                self.handle.tenant_id.clone(),
                TaskState::Failed,
                self.handle.started_at,
            )
            .with_failure(FailureInfo::new(
                "Aborted",
                "supervisor stopped before the run finished",
            ))
        });
        self.registry
            .complete(&self.handle.tenant_id, self.handle.task_id, outcome);
    }
}

/// Counts a spawned run until its future finishes or is dropped.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// WorkerSupervisor
// ---------------------------------------------------------------------------

enum Ending {
    Exited(WorkerExit),
    WaitFailed(String),
    TimedOut,
    Cancelled,
}

pub struct WorkerSupervisor {
    registry: Arc<TaskRegistry>,
    config: WorkerConfig,
    local: Arc<dyn WorkerLauncher>,
    remote: Option<Arc<dyn WorkerLauncher>>,
    events: EventBus,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerSupervisor {
    pub fn new(
        registry: Arc<TaskRegistry>,
        config: WorkerConfig,
        local: Arc<dyn WorkerLauncher>,
        remote: Option<Arc<dyn WorkerLauncher>>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            config,
            local,
            remote,
            events,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Runs whose background future has not finished yet. Unlike
    /// [`TaskRegistry::running_count`] this includes cancelled runs that
    /// are still tearing down their worker.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no run is in flight. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let idle = async {
            while self.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    /// Claim the tenant's slot and run in the background.
    pub fn start(
        self: &Arc<Self>,
        tenant: &TenantId,
        options: StartOptions,
    ) -> Result<RunningTask, StartRejected> {
        let handle = self
            .registry
            .try_start(tenant, options.mode, options.backend)?;
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.config.timeout_for(options.mode));
        Ok(self.run(handle, timeout, options.delivery_config))
    }

    /// Drive an already-claimed task on a background task. Never blocks.
    pub fn run(
        self: &Arc<Self>,
        handle: TaskHandle,
        timeout: Duration,
        delivery_config: serde_json::Value,
    ) -> RunningTask {
        let this = Arc::clone(self);
        let task = handle.clone();
        let in_flight = InFlight::enter(&self.in_flight);
        let join = tokio::spawn(async move {
            let _in_flight = in_flight;
            let mut guard = CompletionGuard {
                registry: Arc::clone(&this.registry),
                handle: task.clone(),
                outcome: None,
            };
            let outcome = this.execute(&task, timeout, delivery_config).await;
            guard.outcome = Some(outcome.clone());
            drop(guard);

            this.events.publish(Event::TaskFinished {
                tenant_id: task.tenant_id.clone(),
                task_id: task.task_id,
                state: outcome.state,
                duration_ms: outcome.duration_ms,
            });
            outcome
        });
        RunningTask { handle, join }
    }

    fn launcher_for(&self, backend: Backend) -> Option<Arc<dyn WorkerLauncher>> {
        match backend {
            Backend::Local => Some(Arc::clone(&self.local)),
            Backend::Remote => self.remote.clone(),
        }
    }

    async fn execute(
        &self,
        task: &TaskHandle,
        timeout: Duration,
        delivery_config: serde_json::Value,
    ) -> Outcome {
        let tenant = &task.tenant_id;
        let session_dir = isolation::session_dir(&self.config.session_root, tenant);
        let finish = |state: TaskState| {
            Outcome::finished(task.task_id, tenant.clone(), state, task.started_at)
        };

        let log = match TaskLog::create(&self.config.log_dir, tenant, task.task_id, task.started_at)
            .await
        {
            Ok(log) => Arc::new(log),
            Err(e) => {
                error!(tenant_id = %tenant, task_id = %task.task_id, error = %e, "cannot open task log");
                return finish(TaskState::Failed).with_failure(failure("TaskLog", e.to_string()));
            }
        };
        let log_path = Some(log.path().to_path_buf());

        let header = LogHeader {
            tenant_id: tenant.clone(),
            task_id: task.task_id,
            mode: task.mode,
            backend: task.backend,
            started_at: task.started_at,
            working_dir: self.config.working_dir.clone(),
            session_dir: session_dir.clone(),
            memory_limit_mb: self.config.memory_limit_mb,
            timeout,
        };
        if let Err(e) = log.write_header(&header).await {
            warn!(tenant_id = %tenant, error = %e, "task log header not written");
        }

        let result = self
            .launch_and_wait(task, timeout, &session_dir, delivery_config, &log)
            .await;
        let outcome = match result {
            Ok((ending, exit_code)) => self.outcome_for(task, ending, timeout).with_exit_code(exit_code),
            Err(failure_info) => {
                note(&log, &format!("{}: {}", failure_info.kind, failure_info.message)).await;
                finish(TaskState::Failed).with_failure(failure_info)
            }
        }
        .with_log_path(log_path);

        if let Err(e) = log.write_footer(&outcome).await {
            warn!(tenant_id = %tenant, error = %e, "task log footer not written");
        }
        match outcome.state {
            TaskState::Completed => {
                info!(tenant_id = %tenant, task_id = %task.task_id, duration_ms = outcome.duration_ms, "run completed")
            }
            state => warn!(
                tenant_id = %tenant,
                task_id = %task.task_id,
                state = state.as_str(),
                failure = outcome.failure.as_ref().map(|f| f.message.as_str()).unwrap_or(""),
                "run did not complete"
            ),
        }
        outcome
    }

    /// Launch, capture output and wait. `Err` means the worker never started.
    async fn launch_and_wait(
        &self,
        task: &TaskHandle,
        timeout: Duration,
        session_dir: &std::path::Path,
        delivery_config: serde_json::Value,
        log: &Arc<TaskLog>,
    ) -> Result<(Ending, Option<i32>), FailureInfo> {
        let tenant = &task.tenant_id;
        if task.cancel.is_cancelled() {
            return Ok((Ending::Cancelled, None));
        }

        isolation::ensure_private_dir(session_dir)
            .map_err(|e| failure("SessionDir", format!("{}: {e}", session_dir.display())))?;

        let launcher = self
            .launcher_for(task.backend)
            .ok_or_else(|| failure("Unsupported", format!("no launcher for backend {}", task.backend)))?;

        let spec = LaunchSpec {
            tenant_id: tenant.clone(),
            task_id: task.task_id,
            mode: task.mode,
            session_dir: session_dir.to_path_buf(),
            working_dir: self.config.working_dir.clone(),
            memory_limit_mb: self.config.memory_limit_mb,
            timeout,
            env: LaunchSpec::worker_env(
                tenant,
                task.task_id,
                task.mode,
                session_dir,
                self.config.memory_limit_mb,
                &self.config.extra_env,
            ),
            delivery_config,
        };

        let LaunchedWorker {
            stdout,
            stderr,
            mut control,
        } = launcher.launch(&spec).await.map_err(|e| {
            error!(tenant_id = %tenant, task_id = %task.task_id, error = %e, "worker launch failed");
            failure(e.kind(), e.to_string())
        })?;

        self.registry.mark_running(tenant, task.task_id);
        self.events.publish(Event::TaskStarted {
            tenant_id: tenant.clone(),
            task_id: task.task_id,
            mode: task.mode,
            backend: task.backend,
        });

        let captures = [
            tokio::spawn(capture(Arc::clone(log), Stream::Stdout, stdout)),
            tokio::spawn(capture(Arc::clone(log), Stream::Stderr, stderr)),
        ];

        let ending = tokio::select! {
            res = control.wait() => match res {
                Ok(exit) => Ending::Exited(exit),
                Err(e) => Ending::WaitFailed(e.to_string()),
            },
            _ = tokio::time::sleep(timeout) => Ending::TimedOut,
            _ = task.cancel.cancelled() => Ending::Cancelled,
        };

        match &ending {
            Ending::TimedOut => {
                note(log, &format!("timeout after {}s, terminating worker", timeout.as_secs())).await;
                if let Err(e) = control.kill().await {
                    warn!(tenant_id = %tenant, error = %e, "kill after timeout failed");
                }
            }
            Ending::Cancelled => {
                note(log, "cancel requested, terminating worker").await;
                if let Err(e) = control.kill().await {
                    warn!(tenant_id = %tenant, error = %e, "kill after cancel failed");
                }
            }
            Ending::WaitFailed(_) => {
                if let Err(e) = control.kill().await {
                    warn!(tenant_id = %tenant, error = %e, "kill after wait failure failed");
                }
            }
            Ending::Exited(_) => {}
        }

        self.drain_captures(task, captures).await;
        let exit_code = match &ending {
            Ending::Exited(exit) => exit.code,
            _ => None,
        };
        Ok((ending, exit_code))
    }

    /// Give the capture loops a short grace period to flush, then move on.
    async fn drain_captures(&self, task: &TaskHandle, captures: [JoinHandle<u64>; 2]) {
        let aborts: Vec<_> = captures.iter().map(|h| h.abort_handle()).collect();
        let grace = self.config.output_grace();
        let [out, err] = captures;
        match tokio::time::timeout(grace, async { (out.await, err.await) }).await {
            Ok((out, err)) => {
                tracing::debug!(
                    tenant_id = %task.tenant_id,
                    stdout_lines = out.unwrap_or(0),
                    stderr_lines = err.unwrap_or(0),
                    "output captured"
                );
            }
            Err(_) => {
                warn!(
                    tenant_id = %task.tenant_id,
                    task_id = %task.task_id,
                    grace_secs = grace.as_secs(),
                    "output capture did not drain in time"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }

    fn outcome_for(&self, task: &TaskHandle, ending: Ending, timeout: Duration) -> Outcome {
        let base = |state| {
            Outcome::finished(task.task_id, task.tenant_id.clone(), state, task.started_at)
        };
        match ending {
            Ending::Exited(exit) if exit.is_success() => base(TaskState::Completed),
            Ending::Exited(WorkerExit {
                failure: Some(info),
                ..
            }) => {
                let mut info = info;
                info.hints = troubleshooting_hints(&info.message);
                base(TaskState::Failed).with_failure(info)
            }
            Ending::Exited(WorkerExit { code, .. }) => {
                let message = match code {
                    Some(code) => format!("worker exited with status {code}"),
                    None => "worker terminated by signal".to_string(),
                };
                base(TaskState::Failed).with_failure(FailureInfo::new("NonZeroExit", message))
            }
            Ending::WaitFailed(message) => base(TaskState::Failed).with_failure(failure("Io", message)),
            Ending::TimedOut => base(TaskState::TimedOut).with_failure(failure(
                "Timeout",
                format!("worker exceeded {}s timeout", timeout.as_secs()),
            )),
            Ending::Cancelled => base(TaskState::Cancelled),
        }
    }
}

fn failure(kind: &str, message: impl Into<String>) -> FailureInfo {
    let message = message.into();
    let mut info = FailureInfo::new(kind, message);
    info.hints = troubleshooting_hints(&format!("{kind} {}", info.message));
    info
}

async fn note(log: &TaskLog, text: &str) {
    if let Err(e) = log.append_line(Stream::Supervisor, text).await {
        warn!(error = %e, "task log note not written");
    }
}

/// Copy one output stream into the log, one timestamped line per line.
/// Bytes are logged verbatim; invalid UTF-8 is replaced, never fatal.
async fn capture(log: Arc<TaskLog>, stream: Stream, reader: OutputStream) -> u64 {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    let mut lines = 0u64;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf);
                if let Err(e) = log.append_line(stream, &line).await {
                    warn!(stream = stream.as_str(), error = %e, "log write failed, dropping capture");
                    break;
                }
                lines += 1;
            }
            Err(e) => {
                warn!(stream = stream.as_str(), error = %e, "worker stream read failed");
                break;
            }
        }
    }
    lines
}
