use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::types::{Backend, RunMode, TaskState, TenantId};

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Something observable happened in the orchestration layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    TaskStarted {
        tenant_id: TenantId,
        task_id: Uuid,
        mode: RunMode,
        backend: Backend,
    },
    TaskFinished {
        tenant_id: TenantId,
        task_id: Uuid,
        state: TaskState,
        duration_ms: u64,
    },
    ChallengePublished {
        tenant_id: TenantId,
        task_id: String,
        request_id: String,
    },
    ChallengeAnswered {
        tenant_id: TenantId,
        request_id: String,
    },
    AgentConnected {
        tenant_id: TenantId,
    },
    AgentDisconnected {
        tenant_id: TenantId,
    },
    LoginResolved {
        tenant_id: TenantId,
        success: bool,
    },
    DeliveryProgress {
        tenant_id: TenantId,
        progress: serde_json::Value,
    },
    DeliveryComplete {
        tenant_id: TenantId,
        summary: serde_json::Value,
    },
}

impl Event {
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            Event::TaskStarted { tenant_id, .. }
            | Event::TaskFinished { tenant_id, .. }
            | Event::ChallengePublished { tenant_id, .. }
            | Event::ChallengeAnswered { tenant_id, .. }
            | Event::AgentConnected { tenant_id }
            | Event::AgentDisconnected { tenant_id }
            | Event::LoginResolved { tenant_id, .. }
            | Event::DeliveryProgress { tenant_id, .. }
            | Event::DeliveryComplete { tenant_id, .. } => tenant_id,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`EventBus::subscribe`] creates a receiver that sees every
/// event published after the subscription. Cloning the bus is cheap.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> flume::Receiver<Event> {
        let (tx, rx) = flume::unbounded();
        self.senders().push(tx);
        rx
    }

    /// Publish to all current subscribers, pruning dropped receivers.
    pub fn publish(&self, event: Event) {
        self.senders().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders().len()
    }

    fn senders(&self) -> MutexGuard<'_, Vec<flume::Sender<Event>>> {
        self.inner.lock().unwrap_or_else(|e| {
            warn!("event bus lock was poisoned, recovering");
            e.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::parse("tenant-a").unwrap()
    }

    #[test]
    fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        bus.publish(Event::AgentConnected { tenant_id: tenant() });
        assert!(matches!(rx1.try_recv(), Ok(Event::AgentConnected { .. })));
        assert!(matches!(rx2.try_recv(), Ok(Event::AgentConnected { .. })));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(Event::AgentDisconnected { tenant_id: tenant() });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::LoginResolved {
            tenant_id: tenant(),
            success: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "login_resolved");
        assert_eq!(json["payload"]["tenant_id"], "tenant-a");
        assert_eq!(event.tenant_id().as_str(), "tenant-a");
    }
}
