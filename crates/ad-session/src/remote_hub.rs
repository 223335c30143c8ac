//! Live channels to remote browser agents, one per tenant.
//!
//! Each tenant moves through `Disconnected -> Connected -> AwaitingLogin ->
//! Connected -> Disconnected`. All transitions go through the private
//! `enter_*` / `leave_*` helpers below; `AwaitingLogin` always carries the
//! rendezvous that the blocked `request_login` callers wait on, so leaving
//! that state always releases them. A caller that stops waiting early
//! withdraws its stake; the last one out cancels the login.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ad_core::event_bus::{Event, EventBus};
use ad_core::rendezvous::{Rendezvous, RendezvousError};
use ad_core::types::TenantId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::protocol::{AgentMessage, ServerCommand};

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("tenant {0} has no live remote session")]
    Offline(TenantId),

    #[error("channel to tenant {0} is closed")]
    ChannelClosed(TenantId),
}

pub type Result<T> = std::result::Result<T, HubError>;

/// Identifies one physical connection, so a late close of a replaced socket
/// cannot tear down its successor.
pub type ConnectionId = u64;

// ---------------------------------------------------------------------------
// Public state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    Disconnected,
    Connected,
    AwaitingLogin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum LoginOutcome {
    Succeeded,
    Failed(String),
    /// No live session when the login was requested.
    Offline,
    TimedOut,
    /// The session dropped while the login was pending.
    Disconnected,
    /// A new connection for the tenant replaced the one the login was sent on.
    Superseded,
    /// Every caller stopped waiting before the agent answered.
    Cancelled,
}

impl LoginOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, LoginOutcome::Succeeded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoginOutcome::Succeeded => "succeeded",
            LoginOutcome::Failed(_) => "failed",
            LoginOutcome::Offline => "offline",
            LoginOutcome::TimedOut => "timed_out",
            LoginOutcome::Disconnected => "disconnected",
            LoginOutcome::Superseded => "superseded",
            LoginOutcome::Cancelled => "cancelled",
        }
    }
}

// ---------------------------------------------------------------------------
// Session slot
// ---------------------------------------------------------------------------

enum Phase {
    Connected,
    AwaitingLogin {
        rv: Rendezvous<LoginOutcome>,
        /// `request_login` calls still waiting on `rv`.
        waiters: usize,
    },
}

struct RemoteSession {
    conn: ConnectionId,
    tx: flume::Sender<ServerCommand>,
    connected_at: DateTime<Utc>,
    phase: Phase,
}

impl RemoteSession {
    fn state(&self) -> RemoteState {
        match self.phase {
            Phase::Connected => RemoteState::Connected,
            Phase::AwaitingLogin { .. } => RemoteState::AwaitingLogin,
        }
    }

    /// Leave `AwaitingLogin`, releasing every waiter with `outcome`.
    fn leave_login(&mut self, outcome: LoginOutcome) -> bool {
        match std::mem::replace(&mut self.phase, Phase::Connected) {
            Phase::AwaitingLogin { rv, .. } => rv.release(outcome),
            Phase::Connected => false,
        }
    }
}

// ---------------------------------------------------------------------------
// RemoteSessionHub
// ---------------------------------------------------------------------------

pub struct RemoteSessionHub {
    sessions: DashMap<TenantId, RemoteSession>,
    next_conn: AtomicU64,
    default_login_timeout: Duration,
    events: EventBus,
}

impl RemoteSessionHub {
    pub fn new(default_login_timeout: Duration, events: EventBus) -> Self {
        Self {
            sessions: DashMap::new(),
            next_conn: AtomicU64::new(1),
            default_login_timeout,
            events,
        }
    }

    pub fn default_login_timeout(&self) -> Duration {
        self.default_login_timeout
    }

    // -- Connection lifecycle ------------------------------------------------

    /// Install `tx` as the tenant's channel, replacing any previous session.
    ///
    /// A login pending on the replaced session is released as `Superseded`,
    /// and the replaced session is reported as disconnected so work bound to
    /// it does not wait on the new agent.
    pub fn on_connect(&self, tenant: &TenantId, tx: flume::Sender<ServerCommand>) -> ConnectionId {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let session = RemoteSession {
            conn,
            tx,
            connected_at: Utc::now(),
            phase: Phase::Connected,
        };
        if let Some(mut old) = self.sessions.insert(tenant.clone(), session) {
            if old.leave_login(LoginOutcome::Superseded) {
                self.events.publish(Event::LoginResolved {
                    tenant_id: tenant.clone(),
                    success: false,
                });
            }
            info!(tenant_id = %tenant, old_conn = old.conn, conn, "remote session replaced");
            self.events.publish(Event::AgentDisconnected {
                tenant_id: tenant.clone(),
            });
        } else {
            info!(tenant_id = %tenant, conn, "remote agent connected");
        }
        self.events.publish(Event::AgentConnected {
            tenant_id: tenant.clone(),
        });
        conn
    }

    /// Drop the tenant's session if `conn` is still the current one.
    ///
    /// A pending login is released as `Disconnected`. Returns `false` for a
    /// stale connection id.
    pub fn on_disconnect(&self, tenant: &TenantId, conn: ConnectionId) -> bool {
        let Some((_, mut session)) = self.sessions.remove_if(tenant, |_, s| s.conn == conn) else {
            debug!(tenant_id = %tenant, conn, "stale disconnect ignored");
            return false;
        };
        if session.leave_login(LoginOutcome::Disconnected) {
            warn!(tenant_id = %tenant, conn, "agent disconnected during login");
            self.events.publish(Event::LoginResolved {
                tenant_id: tenant.clone(),
                success: false,
            });
        }
        let online_secs = (Utc::now() - session.connected_at).num_seconds();
        info!(tenant_id = %tenant, conn, online_secs, "remote agent disconnected");
        self.events.publish(Event::AgentDisconnected {
            tenant_id: tenant.clone(),
        });
        true
    }

    /// Dispatch one decoded agent message.
    pub fn on_message(&self, tenant: &TenantId, message: AgentMessage) {
        match message {
            AgentMessage::LoginComplete => {
                self.resolve_login(tenant, LoginOutcome::Succeeded);
            }
            AgentMessage::LoginFailed { reason } => {
                let reason = reason.unwrap_or_else(|| "login failed".to_string());
                self.resolve_login(tenant, LoginOutcome::Failed(reason));
            }
            AgentMessage::DeliveryProgress { progress } => {
                debug!(tenant_id = %tenant, %progress, "delivery progress");
                self.events.publish(Event::DeliveryProgress {
                    tenant_id: tenant.clone(),
                    progress,
                });
            }
            AgentMessage::DeliveryComplete { summary } => {
                info!(tenant_id = %tenant, %summary, "delivery complete");
                if let Err(e) = self.send(tenant, ServerCommand::DeliveryAck) {
                    warn!(tenant_id = %tenant, error = %e, "could not acknowledge delivery");
                }
                self.events.publish(Event::DeliveryComplete {
                    tenant_id: tenant.clone(),
                    summary,
                });
            }
            AgentMessage::Unknown { action } => {
                warn!(tenant_id = %tenant, action = %action, "ignoring unknown agent action");
            }
        }
    }

    // -- Commands ------------------------------------------------------------

    /// Ask the agent to log in and wait for the result.
    ///
    /// Returns `Offline` immediately when there is no session. A caller that
    /// arrives while a login is already pending joins it instead of sending a
    /// second `login` command.
    pub async fn request_login(&self, tenant: &TenantId, timeout: Duration) -> LoginOutcome {
        let (rv, fresh) = match self.enter_login(tenant) {
            Some(pair) => pair,
            None => {
                info!(tenant_id = %tenant, "login requested for offline tenant");
                return LoginOutcome::Offline;
            }
        };
        let _stake = LoginStake {
            hub: self,
            tenant,
            rv: rv.clone(),
        };

        if fresh {
            let command = ServerCommand::Login {
                timeout: timeout.as_secs(),
            };
            if let Err(e) = self.send(tenant, command) {
                warn!(tenant_id = %tenant, error = %e, "login command could not be sent");
                self.leave_login_if(tenant, &rv, LoginOutcome::Disconnected);
            } else {
                info!(tenant_id = %tenant, timeout_secs = timeout.as_secs(), "login command sent");
            }
        } else {
            debug!(tenant_id = %tenant, "joining pending login");
        }

        match rv.wait(timeout).await {
            Ok(outcome) => outcome,
            Err(RendezvousError::Timeout(_)) => {
                if self.leave_login_if(tenant, &rv, LoginOutcome::TimedOut) {
                    warn!(tenant_id = %tenant, ?timeout, "login timed out");
                }
                // A release that raced the timeout wins.
                rv.peek().unwrap_or(LoginOutcome::TimedOut)
            }
            Err(RendezvousError::Abandoned) => LoginOutcome::Disconnected,
        }
    }

    /// Fire-and-forget `start_delivery`.
    pub fn send_delivery_command(&self, tenant: &TenantId, config: Value) -> Result<()> {
        self.send(tenant, ServerCommand::StartDelivery { config })?;
        info!(tenant_id = %tenant, "start_delivery dispatched");
        Ok(())
    }

    /// Fire-and-forget `stop_delivery`.
    pub fn stop_delivery(&self, tenant: &TenantId) -> Result<()> {
        self.send(tenant, ServerCommand::StopDelivery)?;
        info!(tenant_id = %tenant, "stop_delivery dispatched");
        Ok(())
    }

    // -- Introspection -------------------------------------------------------

    pub fn is_online(&self, tenant: &TenantId) -> bool {
        self.sessions.contains_key(tenant)
    }

    pub fn state(&self, tenant: &TenantId) -> RemoteState {
        self.sessions
            .get(tenant)
            .map(|s| s.state())
            .unwrap_or(RemoteState::Disconnected)
    }

    pub fn online_tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self.sessions.iter().map(|s| s.key().clone()).collect();
        tenants.sort();
        tenants
    }

    pub fn online_count(&self) -> usize {
        self.sessions.len()
    }

    // -- Transitions ---------------------------------------------------------

    /// `Connected -> AwaitingLogin`, or join an existing `AwaitingLogin`.
    /// Returns the rendezvous and whether it was freshly created.
    fn enter_login(&self, tenant: &TenantId) -> Option<(Rendezvous<LoginOutcome>, bool)> {
        let mut session = self.sessions.get_mut(tenant)?;
        if let Phase::AwaitingLogin { rv, waiters } = &mut session.phase {
            *waiters += 1;
            return Some((rv.clone(), false));
        }
        let rv = Rendezvous::new();
        session.phase = Phase::AwaitingLogin {
            rv: rv.clone(),
            waiters: 1,
        };
        Some((rv, true))
    }

    /// One waiter on `rv` is gone. If it was the last and the login is still
    /// pending, `AwaitingLogin -> Connected` with `Cancelled`.
    fn withdraw_login(&self, tenant: &TenantId, rv: &Rendezvous<LoginOutcome>) {
        let Some(mut session) = self.sessions.get_mut(tenant) else {
            return;
        };
        let last = match &mut session.phase {
            Phase::AwaitingLogin { rv: current, waiters } if current.same_as(rv) => {
                *waiters = waiters.saturating_sub(1);
                *waiters == 0
            }
            _ => false,
        };
        let cancelled = last && session.leave_login(LoginOutcome::Cancelled);
        drop(session);
        if cancelled {
            warn!(tenant_id = %tenant, "login abandoned by every caller, cancelled");
            self.events.publish(Event::LoginResolved {
                tenant_id: tenant.clone(),
                success: false,
            });
        }
    }

    /// `AwaitingLogin -> Connected`, but only if the pending rendezvous is
    /// still `rv`.
    fn leave_login_if(
        &self,
        tenant: &TenantId,
        rv: &Rendezvous<LoginOutcome>,
        outcome: LoginOutcome,
    ) -> bool {
        let released = match self.sessions.get_mut(tenant) {
            Some(mut session) => {
                let pending =
                    matches!(&session.phase, Phase::AwaitingLogin { rv: current, .. } if current.same_as(rv));
                pending && session.leave_login(outcome.clone())
            }
            None => false,
        };
        // Session already gone: release the orphan so no caller keeps waiting.
        let released = released || rv.release(outcome.clone());
        if released {
            self.events.publish(Event::LoginResolved {
                tenant_id: tenant.clone(),
                success: outcome.is_success(),
            });
        }
        released
    }

    fn resolve_login(&self, tenant: &TenantId, outcome: LoginOutcome) {
        let success = outcome.is_success();
        let released = self
            .sessions
            .get_mut(tenant)
            .map(|mut s| s.leave_login(outcome))
            .unwrap_or(false);
        if released {
            info!(tenant_id = %tenant, success, "login resolved");
            self.events.publish(Event::LoginResolved {
                tenant_id: tenant.clone(),
                success,
            });
        } else {
            warn!(tenant_id = %tenant, success, "login result with no pending login");
        }
    }

    fn send(&self, tenant: &TenantId, command: ServerCommand) -> Result<()> {
        let tx = self
            .sessions
            .get(tenant)
            .map(|s| s.tx.clone())
            .ok_or_else(|| HubError::Offline(tenant.clone()))?;
        tx.send(command)
            .map_err(|_| HubError::ChannelClosed(tenant.clone()))
    }
}

/// One `request_login` caller's claim on a pending login. Dropped when the
/// call returns or its future is dropped mid-wait.
struct LoginStake<'a> {
    hub: &'a RemoteSessionHub,
    tenant: &'a TenantId,
    rv: Rendezvous<LoginOutcome>,
}

impl Drop for LoginStake<'_> {
    fn drop(&mut self) {
        self.hub.withdraw_login(self.tenant, &self.rv);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> RemoteSessionHub {
        RemoteSessionHub::new(Duration::from_secs(300), EventBus::new())
    }

    fn tenant(raw: &str) -> TenantId {
        TenantId::parse(raw).unwrap()
    }

    #[test]
    fn state_follows_connection() {
        let hub = hub();
        let t = tenant("tenant-a");
        assert_eq!(hub.state(&t), RemoteState::Disconnected);
        let (tx, _rx) = flume::unbounded();
        let conn = hub.on_connect(&t, tx);
        assert_eq!(hub.state(&t), RemoteState::Connected);
        assert!(hub.is_online(&t));
        assert!(hub.on_disconnect(&t, conn));
        assert_eq!(hub.state(&t), RemoteState::Disconnected);
    }

    #[test]
    fn stale_disconnect_is_ignored() {
        let hub = hub();
        let t = tenant("tenant-a");
        let (tx1, _rx1) = flume::unbounded();
        let (tx2, _rx2) = flume::unbounded();
        let first = hub.on_connect(&t, tx1);
        let second = hub.on_connect(&t, tx2);
        assert_ne!(first, second);
        assert!(!hub.on_disconnect(&t, first));
        assert!(hub.is_online(&t));
        assert_eq!(hub.online_tenants(), vec![t]);
    }

    #[test]
    fn delivery_complete_is_acknowledged() {
        let hub = hub();
        let t = tenant("tenant-a");
        let (tx, rx) = flume::unbounded();
        hub.on_connect(&t, tx);
        hub.on_message(
            &t,
            AgentMessage::DeliveryComplete {
                summary: serde_json::json!({"sent": 12}),
            },
        );
        assert_eq!(rx.try_recv().unwrap(), ServerCommand::DeliveryAck);
    }

    #[test]
    fn commands_to_offline_tenant_fail() {
        let hub = hub();
        let t = tenant("ghost");
        assert!(matches!(
            hub.send_delivery_command(&t, Value::Null),
            Err(HubError::Offline(_))
        ));
        assert!(matches!(hub.stop_delivery(&t), Err(HubError::Offline(_))));
    }

    #[test]
    fn closed_channel_is_reported() {
        let hub = hub();
        let t = tenant("tenant-a");
        let (tx, rx) = flume::unbounded();
        hub.on_connect(&t, tx);
        drop(rx);
        assert!(matches!(
            hub.stop_delivery(&t),
            Err(HubError::ChannelClosed(_))
        ));
    }

    #[test]
    fn login_outcome_serializes() {
        let v = serde_json::to_value(LoginOutcome::Failed("captcha".into())).unwrap();
        assert_eq!(v["outcome"], "failed");
        assert_eq!(v["reason"], "captcha");
        let v = serde_json::to_value(LoginOutcome::Succeeded).unwrap();
        assert_eq!(v["outcome"], "succeeded");
    }
}
