use std::collections::BTreeSet;

use ad_core::types::{Backend, Outcome, RunMode, TaskState, TaskStatus, TenantId};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A start request hit a tenant that already has an active task.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("tenant {tenant_id} already has a task {state:?} for {running_seconds}s")]
pub struct StartRejected {
    pub tenant_id: TenantId,
    pub task_id: Uuid,
    pub state: TaskState,
    pub running_seconds: u64,
}

impl StartRejected {
    pub fn reason(&self) -> String {
        format!("already running for {} seconds", self.running_seconds)
    }
}

// ---------------------------------------------------------------------------
// TaskHandle
// ---------------------------------------------------------------------------

/// What the supervisor needs to drive one run. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub task_id: Uuid,
    pub tenant_id: TenantId,
    pub mode: RunMode,
    pub backend: Backend,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl TaskHandle {
    pub fn elapsed_seconds(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}

struct TaskEntry {
    handle: TaskHandle,
    state: TaskState,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusReport {
    pub tenant_id: TenantId,
    pub status: TaskStatus,
    pub task_id: Option<Uuid>,
    pub running_seconds: Option<u64>,
    pub last_outcome: Option<Outcome>,
}

// ---------------------------------------------------------------------------
// TaskRegistry
// ---------------------------------------------------------------------------

/// In-memory map of tenant to its single active task.
///
/// Only active (`Starting` / `Running`) tasks live in the map; terminal
/// outcomes are kept separately as the tenant's last result.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<TenantId, TaskEntry>,
    last_outcomes: DashMap<TenantId, Outcome>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim the tenant's slot, or report how long the current
    /// task has been running.
    pub fn try_start(
        &self,
        tenant: &TenantId,
        mode: RunMode,
        backend: Backend,
    ) -> Result<TaskHandle, StartRejected> {
        match self.tasks.entry(tenant.clone()) {
            Entry::Occupied(existing) => {
                let entry = existing.get();
                let rejected = StartRejected {
                    tenant_id: tenant.clone(),
                    task_id: entry.handle.task_id,
                    state: entry.state,
                    running_seconds: entry.handle.elapsed_seconds(),
                };
                info!(
                    tenant_id = %tenant,
                    task_id = %rejected.task_id,
                    running_seconds = rejected.running_seconds,
                    "start rejected, task already active"
                );
                Err(rejected)
            }
            Entry::Vacant(slot) => {
                let handle = TaskHandle {
                    task_id: Uuid::new_v4(),
                    tenant_id: tenant.clone(),
                    mode,
                    backend,
                    started_at: Utc::now(),
                    cancel: CancellationToken::new(),
                };
                slot.insert(TaskEntry {
                    handle: handle.clone(),
                    state: TaskState::Starting,
                });
                info!(tenant_id = %tenant, task_id = %handle.task_id, %mode, %backend, "task slot claimed");
                Ok(handle)
            }
        }
    }

    /// `Starting -> Running` for the given run. Returns `false` if that run is
    /// no longer the tenant's active task.
    pub fn mark_running(&self, tenant: &TenantId, task_id: Uuid) -> bool {
        match self.tasks.get_mut(tenant) {
            Some(mut entry) if entry.handle.task_id == task_id => {
                if entry.state == TaskState::Starting {
                    entry.state = TaskState::Running;
                }
                true
            }
            _ => false,
        }
    }

    /// Record a terminal outcome and free the tenant's slot.
    ///
    /// Only the entry for `task_id` is removed, so a late completion from an
    /// older run never evicts a newer one. Calling it again is a no-op.
    pub fn complete(&self, tenant: &TenantId, task_id: Uuid, outcome: Outcome) -> bool {
        if !outcome.state.is_terminal() {
            warn!(tenant_id = %tenant, %task_id, state = outcome.state.as_str(), "complete called with non-terminal state");
        }
        let removed = self
            .tasks
            .remove_if(tenant, |_, entry| entry.handle.task_id == task_id)
            .is_some();

        self.last_outcomes
            .entry(tenant.clone())
            .and_modify(|last| {
                if last.started_at <= outcome.started_at {
                    *last = outcome.clone();
                }
            })
            .or_insert_with(|| outcome.clone());

        if removed {
            info!(tenant_id = %tenant, %task_id, state = outcome.state.as_str(), "task completed");
        } else {
            debug!(tenant_id = %tenant, %task_id, "completion for task no longer registered");
        }
        removed
    }

    /// Signal the task's cancel token and free the slot immediately.
    pub fn cancel(&self, tenant: &TenantId) -> bool {
        match self.tasks.remove(tenant) {
            Some((_, entry)) => {
                entry.handle.cancel.cancel();
                info!(
                    tenant_id = %tenant,
                    task_id = %entry.handle.task_id,
                    running_seconds = entry.handle.elapsed_seconds(),
                    "task cancelled"
                );
                true
            }
            None => false,
        }
    }

    /// Cancel every active task. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let tenants: Vec<TenantId> = self.tasks.iter().map(|e| e.key().clone()).collect();
        tenants.iter().filter(|t| self.cancel(t)).count()
    }

    pub fn get(&self, tenant: &TenantId) -> Option<TaskHandle> {
        self.tasks.get(tenant).map(|e| e.handle.clone())
    }

    pub fn status(&self, tenant: &TenantId) -> TaskStatusReport {
        let last_outcome = self.last_outcomes.get(tenant).map(|o| o.clone());
        if let Some(entry) = self.tasks.get(tenant) {
            return TaskStatusReport {
                tenant_id: tenant.clone(),
                status: entry.state.into(),
                task_id: Some(entry.handle.task_id),
                running_seconds: Some(entry.handle.elapsed_seconds()),
                last_outcome,
            };
        }
        TaskStatusReport {
            tenant_id: tenant.clone(),
            status: last_outcome
                .as_ref()
                .map(Outcome::status)
                .unwrap_or(TaskStatus::NotStarted),
            task_id: last_outcome.as_ref().map(|o| o.task_id),
            running_seconds: None,
            last_outcome,
        }
    }

    pub fn running_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn running_tenant_ids(&self) -> BTreeSet<TenantId> {
        self.tasks.iter().map(|e| e.key().clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(raw: &str) -> TenantId {
        TenantId::parse(raw).unwrap()
    }

    fn outcome(handle: &TaskHandle, state: TaskState) -> Outcome {
        Outcome::finished(handle.task_id, handle.tenant_id.clone(), state, handle.started_at)
    }

    #[test]
    fn second_start_is_rejected_with_elapsed() {
        let reg = TaskRegistry::new();
        let t = tenant("tenant-a");
        let first = reg.try_start(&t, RunMode::FullRun, Backend::Local).unwrap();
        let rejected = reg
            .try_start(&t, RunMode::FullRun, Backend::Local)
            .unwrap_err();
        assert_eq!(rejected.task_id, first.task_id);
        assert_eq!(rejected.state, TaskState::Starting);
        assert!(rejected.reason().contains("seconds"));
    }

    #[test]
    fn tenants_are_independent() {
        let reg = TaskRegistry::new();
        reg.try_start(&tenant("a"), RunMode::FullRun, Backend::Local).unwrap();
        reg.try_start(&tenant("b"), RunMode::LoginOnly, Backend::Remote).unwrap();
        assert_eq!(reg.running_count(), 2);
        let ids: Vec<String> = reg
            .running_tenant_ids()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn complete_frees_slot_and_is_idempotent() {
        let reg = TaskRegistry::new();
        let t = tenant("tenant-a");
        let h = reg.try_start(&t, RunMode::FullRun, Backend::Local).unwrap();
        assert!(reg.mark_running(&t, h.task_id));
        assert_eq!(reg.status(&t).status, TaskStatus::Running);

        assert!(reg.complete(&t, h.task_id, outcome(&h, TaskState::Completed)));
        assert!(!reg.complete(&t, h.task_id, outcome(&h, TaskState::Completed)));
        assert_eq!(reg.running_count(), 0);
        assert_eq!(reg.status(&t).status, TaskStatus::Succeeded);
        assert!(reg.try_start(&t, RunMode::FullRun, Backend::Local).is_ok());
    }

    #[test]
    fn stale_completion_keeps_newer_task() {
        let reg = TaskRegistry::new();
        let t = tenant("tenant-a");
        let old = reg.try_start(&t, RunMode::FullRun, Backend::Local).unwrap();
        assert!(reg.cancel(&t));
        let new = reg.try_start(&t, RunMode::FullRun, Backend::Local).unwrap();

        assert!(!reg.complete(&t, old.task_id, outcome(&old, TaskState::Cancelled)));
        assert_eq!(reg.get(&t).map(|h| h.task_id), Some(new.task_id));
        assert!(!reg.mark_running(&t, old.task_id));
    }

    #[test]
    fn cancel_signals_token() {
        let reg = TaskRegistry::new();
        let t = tenant("tenant-a");
        let h = reg.try_start(&t, RunMode::FullRun, Backend::Local).unwrap();
        assert!(reg.cancel(&t));
        assert!(h.cancel.is_cancelled());
        assert!(!reg.cancel(&t));
        assert_eq!(reg.status(&t).status, TaskStatus::NotStarted);
    }

    #[test]
    fn cancel_all_clears_registry() {
        let reg = TaskRegistry::new();
        let a = reg.try_start(&tenant("a"), RunMode::FullRun, Backend::Local).unwrap();
        let b = reg.try_start(&tenant("b"), RunMode::FullRun, Backend::Local).unwrap();
        assert_eq!(reg.cancel_all(), 2);
        assert!(a.cancel.is_cancelled() && b.cancel.is_cancelled());
        assert_eq!(reg.running_count(), 0);
    }
}
