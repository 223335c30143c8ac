//! Verification relay: a mailbox that pairs a worker's challenge with a
//! human's answer.
//!
//! A worker publishes a challenge (label + screenshot) and blocks in
//! [`VerificationRelay::await_answer`]. A human polls the request through a
//! different channel and submits the answer with [`VerificationRelay::answer`].
//! Expiry is a property of the request: it is checked on every read and the
//! periodic [`VerificationRelay::sweep_expired`] removes stale entries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ad_core::clock::{Clock, SystemClock};
use ad_core::config::VerificationConfig;
use ad_core::event_bus::{Event, EventBus};
use ad_core::isolation::{self, PathGuardError};
use ad_core::rendezvous::{Rendezvous, RendezvousError};
use ad_core::types::{validate_task_id, IdError, TenantId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    #[error("verification request {0} not found")]
    NotFound(String),

    #[error("verification request {0} has expired")]
    Expired(String),

    #[error("verification request {0} was already answered")]
    AlreadyAnswered(String),

    #[error("no answer within {0:?}")]
    Timeout(Duration),

    #[error("artifact rejected: {0}")]
    Artifact(#[from] PathGuardError),

    #[error("artifact directory: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

// ---------------------------------------------------------------------------
// VerificationRequest
// ---------------------------------------------------------------------------

/// One pending challenge. Snapshots handed out by the relay are clones.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationRequest {
    pub request_id: String,
    pub tenant_id: TenantId,
    pub task_id: String,
    pub challenge_label: String,
    pub artifact_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub answer: Option<String>,
    pub answered: bool,
}

impl VerificationRequest {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

struct Entry {
    request: VerificationRequest,
    answer: Rendezvous<String>,
}

type TaskKey = (TenantId, String);

// ---------------------------------------------------------------------------
// VerificationRelay
// ---------------------------------------------------------------------------

pub struct VerificationRelay {
    entries: DashMap<String, Entry>,
    by_task: DashMap<TaskKey, String>,
    /// Swept request ids and when they were swept.
    tombstones: DashMap<String, DateTime<Utc>>,
    artifact_dir: PathBuf,
    expiry: chrono::Duration,
    tombstone_ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

fn to_delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

impl VerificationRelay {
    pub fn new(config: &VerificationConfig, events: EventBus) -> Self {
        Self::with_clock(config, events, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &VerificationConfig,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            by_task: DashMap::new(),
            tombstones: DashMap::new(),
            artifact_dir: config.artifact_dir.clone(),
            expiry: to_delta(config.expiry()),
            tombstone_ttl: to_delta(config.tombstone_ttl()),
            clock,
            events,
        }
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// A fresh, namespaced screenshot path for a worker to write into.
    /// The tenant's artifact directory is created if missing.
    pub fn challenge_artifact_path(&self, tenant: &TenantId, task_id: &str) -> Result<PathBuf> {
        let path = isolation::challenge_artifact_path(&self.artifact_dir, tenant, task_id)?;
        if let Some(parent) = path.parent() {
            isolation::ensure_private_dir(parent)?;
        }
        Ok(path)
    }

    // -- Publish -------------------------------------------------------------

    /// Register a challenge and return its request id.
    ///
    /// A still-pending challenge for the same tenant and task is superseded:
    /// it is removed and its artifact deleted. A path inside another
    /// tenant's artifact directory is refused.
    pub fn publish(
        &self,
        tenant: &TenantId,
        task_id: &str,
        challenge_label: &str,
        artifact_path: impl Into<PathBuf>,
    ) -> Result<String> {
        validate_task_id(task_id)?;
        let artifact_path = artifact_path.into();
        self.check_artifact_owner(tenant, &artifact_path)?;
        let created_at = self.clock.now();
        let expires_at = created_at
            .checked_add_signed(self.expiry)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let suffix = Uuid::new_v4().simple().to_string();
        let request_id = format!(
            "{tenant}-{task_id}-{}-{}",
            created_at.timestamp_millis(),
            &suffix[..8]
        );

        let request = VerificationRequest {
            request_id: request_id.clone(),
            tenant_id: tenant.clone(),
            task_id: task_id.to_string(),
            challenge_label: challenge_label.to_string(),
            artifact_path,
            created_at,
            expires_at,
            answer: None,
            answered: false,
        };
        self.entries.insert(
            request_id.clone(),
            Entry {
                request,
                answer: Rendezvous::new(),
            },
        );

        let previous = self
            .by_task
            .insert((tenant.clone(), task_id.to_string()), request_id.clone());
        if let Some(old_id) = previous {
            if let Some((_, old)) = self.entries.remove(&old_id) {
                info!(
                    tenant_id = %tenant,
                    task_id,
                    superseded = %old_id,
                    "new challenge supersedes pending request"
                );
                self.delete_artifact(&old.request);
            }
        }

        info!(tenant_id = %tenant, task_id, request_id = %request_id, "challenge published");
        self.events.publish(Event::ChallengePublished {
            tenant_id: tenant.clone(),
            task_id: task_id.to_string(),
            request_id: request_id.clone(),
        });
        Ok(request_id)
    }

    // -- Lookup --------------------------------------------------------------

    pub fn lookup(&self, request_id: &str) -> Result<VerificationRequest> {
        let now = self.clock.now();
        match self.entries.get(request_id) {
            Some(entry) if entry.request.is_expired_at(now) => {
                Err(RelayError::Expired(request_id.to_string()))
            }
            Some(entry) => Ok(entry.request.clone()),
            None => Err(self.missing(request_id)),
        }
    }

    /// Worker-side lookup by the ids the worker already knows.
    pub fn lookup_by_tenant_and_task(
        &self,
        tenant: &TenantId,
        task_id: &str,
    ) -> Result<VerificationRequest> {
        let request_id = self.request_id_for(tenant, task_id)?;
        self.lookup(&request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// Unexpired, unanswered requests for one tenant.
    pub fn pending_for_tenant(&self, tenant: &TenantId) -> Vec<VerificationRequest> {
        let now = self.clock.now();
        let mut pending: Vec<VerificationRequest> = self
            .entries
            .iter()
            .filter(|e| {
                &e.request.tenant_id == tenant
                    && !e.request.answered
                    && !e.request.is_expired_at(now)
            })
            .map(|e| e.request.clone())
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    /// The artifact for `request_id`, confirmed to lie inside the publishing
    /// tenant's own artifact directory.
    pub fn resolve_artifact(&self, request_id: &str) -> Result<PathBuf> {
        let request = self.lookup(request_id)?;
        Ok(self.guard_artifact(&request)?)
    }

    // -- Answer --------------------------------------------------------------

    /// Record the human's answer and release any waiting worker.
    ///
    /// First writer wins: a second answer fails with `AlreadyAnswered`.
    pub fn answer(&self, request_id: &str, value: &str) -> Result<()> {
        let now = self.clock.now();
        let (tenant, task_id) = {
            let Some(mut entry) = self.entries.get_mut(request_id) else {
                let err = self.missing(request_id);
                warn!(request_id, error = %err, "answer rejected");
                return Err(err);
            };
            if entry.request.is_expired_at(now) {
                warn!(tenant_id = %entry.request.tenant_id, request_id, "answer to expired challenge");
                return Err(RelayError::Expired(request_id.to_string()));
            }
            if entry.request.answered {
                warn!(tenant_id = %entry.request.tenant_id, request_id, "challenge already answered");
                return Err(RelayError::AlreadyAnswered(request_id.to_string()));
            }
            entry.request.answer = Some(value.to_string());
            entry.request.answered = true;
            entry.answer.release(value.to_string());
            (entry.request.tenant_id.clone(), entry.request.task_id.clone())
        };

        info!(tenant_id = %tenant, task_id = %task_id, request_id, "challenge answered");
        self.events.publish(Event::ChallengeAnswered {
            tenant_id: tenant,
            request_id: request_id.to_string(),
        });
        Ok(())
    }

    /// Block until the challenge for (tenant, task) is answered or `timeout`
    /// elapses. A successful wait consumes the request. On timeout the request
    /// stays in place until its own expiry.
    pub async fn await_answer(
        &self,
        tenant: &TenantId,
        task_id: &str,
        timeout: Duration,
    ) -> Result<String> {
        // `None` means the deadline is beyond what `Instant` can represent.
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        loop {
            let request_id = self.request_id_for(tenant, task_id)?;
            let waiter = {
                let now = self.clock.now();
                let Some(entry) = self.entries.get(&request_id) else {
                    return Err(self.missing(&request_id));
                };
                if entry.request.is_expired_at(now) {
                    return Err(RelayError::Expired(request_id));
                }
                entry.answer.waiter()
            };

            let remaining = deadline
                .map(|d| d.saturating_duration_since(tokio::time::Instant::now()))
                .unwrap_or(timeout);
            match waiter.wait(remaining).await {
                Ok(answer) => {
                    self.consume(&request_id);
                    debug!(tenant_id = %tenant, task_id, request_id = %request_id, "answer consumed");
                    return Ok(answer);
                }
                Err(RendezvousError::Timeout(_)) => {
                    info!(tenant_id = %tenant, task_id, request_id = %request_id, "waiter gave up");
                    return Err(RelayError::Timeout(timeout));
                }
                Err(RendezvousError::Abandoned) => {
                    // Swept, superseded or consumed by another waiter.
                    if self.tombstones.contains_key(&request_id) {
                        return Err(RelayError::Expired(request_id));
                    }
                    if remaining.is_zero() {
                        return Err(RelayError::Timeout(timeout));
                    }
                }
            }
        }
    }

    // -- Maintenance ---------------------------------------------------------

    /// Remove expired requests, delete their artifacts and age out old
    /// tombstones. Returns the number of requests removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.request.is_expired_at(now))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for request_id in expired {
            let Some((_, entry)) = self
                .entries
                .remove_if(&request_id, |_, e| e.request.is_expired_at(now))
            else {
                continue;
            };
            let key = (entry.request.tenant_id.clone(), entry.request.task_id.clone());
            self.by_task.remove_if(&key, |_, id| id == &request_id);
            self.tombstones.insert(request_id.clone(), now);
            self.delete_artifact(&entry.request);
            debug!(tenant_id = %entry.request.tenant_id, request_id = %request_id, "expired challenge swept");
            removed += 1;
        }

        let ttl = self.tombstone_ttl;
        self.tombstones.retain(|_, swept_at| {
            swept_at
                .checked_add_signed(ttl)
                .map(|until| now < until)
                .unwrap_or(true)
        });

        if removed > 0 {
            info!(removed, remaining = self.entries.len(), "verification sweep");
        }
        removed
    }

    // -- Internals -----------------------------------------------------------

    fn request_id_for(&self, tenant: &TenantId, task_id: &str) -> Result<String> {
        self.by_task
            .get(&(tenant.clone(), task_id.to_string()))
            .map(|id| id.value().clone())
            .ok_or_else(|| RelayError::NotFound(format!("{tenant}/{task_id}")))
    }

    fn missing(&self, request_id: &str) -> RelayError {
        if self.tombstones.contains_key(request_id) {
            RelayError::Expired(request_id.to_string())
        } else {
            RelayError::NotFound(request_id.to_string())
        }
    }

    fn consume(&self, request_id: &str) {
        if let Some((_, entry)) = self.entries.remove(request_id) {
            let key = (entry.request.tenant_id.clone(), entry.request.task_id.clone());
            self.by_task.remove_if(&key, |_, id| id == request_id);
            self.delete_artifact(&entry.request);
        }
    }

    fn guard_artifact(
        &self,
        request: &VerificationRequest,
    ) -> std::result::Result<PathBuf, PathGuardError> {
        let own_dir = isolation::tenant_artifact_dir(&self.artifact_dir, &request.tenant_id);
        isolation::ensure_within(&own_dir, &request.artifact_path)
    }

    /// Refuse a screenshot path that resolves into another tenant's
    /// artifact directory. Paths outside the artifact dir are accepted but
    /// never served or deleted.
    fn check_artifact_owner(&self, tenant: &TenantId, path: &Path) -> Result<()> {
        let Ok(base) = self.artifact_dir.canonicalize() else {
            return Ok(());
        };
        let Some(resolved) = isolation::resolve_lenient(path) else {
            return Ok(());
        };
        let own_dir = isolation::tenant_artifact_dir(&base, tenant);
        if resolved.starts_with(&base) && !resolved.starts_with(&own_dir) {
            warn!(
                tenant_id = %tenant,
                path = %path.display(),
                "challenge artifact points into another tenant's directory"
            );
            return Err(RelayError::Artifact(PathGuardError::Outside(path.to_path_buf())));
        }
        Ok(())
    }

    /// Delete a challenge screenshot, but only from the publishing tenant's
    /// artifact directory.
    fn delete_artifact(&self, request: &VerificationRequest) {
        let path = match self.guard_artifact(request) {
            Ok(path) => path,
            Err(PathGuardError::Unresolvable { .. }) => return,
            Err(e) => {
                debug!(request_id = %request.request_id, error = %e, "artifact left in place");
                return;
            }
        };
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(
                tenant_id = %request.tenant_id,
                request_id = %request.request_id,
                path = %path.display(),
                error = %e,
                "failed to delete challenge artifact"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
