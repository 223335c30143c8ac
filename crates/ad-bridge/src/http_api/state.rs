use std::sync::Arc;
use std::time::Instant;

use ad_agents::launcher::{LocalProcessLauncher, RemoteAgentLauncher, WorkerLauncher};
use ad_agents::registry::TaskRegistry;
use ad_agents::supervisor::WorkerSupervisor;
use ad_core::config::{Config, RemoteConfig, VerificationConfig};
use ad_core::event_bus::EventBus;
use ad_session::remote_hub::RemoteSessionHub;
use ad_session::verification::VerificationRelay;
use ad_telemetry::metrics::MetricsCollector;

/// Shared application state for all HTTP/WS handlers.
///
/// Owns the orchestration core; nothing here is global.
pub struct ApiState {
    pub supervisor: Arc<WorkerSupervisor>,
    pub registry: Arc<TaskRegistry>,
    pub relay: Arc<VerificationRelay>,
    pub hub: Arc<RemoteSessionHub>,
    pub events: EventBus,
    pub metrics: Arc<MetricsCollector>,
    pub verification: VerificationConfig,
    pub remote: RemoteConfig,
    pub start_time: Instant,
}

impl ApiState {
    /// Wire the core components from configuration.
    pub fn new(config: &Config, events: EventBus, metrics: Arc<MetricsCollector>) -> Self {
        let registry = Arc::new(TaskRegistry::new());
        let relay = Arc::new(VerificationRelay::new(&config.verification, events.clone()));
        let hub = Arc::new(RemoteSessionHub::new(
            config.remote.login_timeout(),
            events.clone(),
        ));

        let local: Arc<dyn WorkerLauncher> = Arc::new(LocalProcessLauncher::new(
            config.worker.program.clone(),
            config.worker.args.clone(),
        ));
        let remote: Arc<dyn WorkerLauncher> =
            Arc::new(RemoteAgentLauncher::new(Arc::clone(&hub), events.clone()));
        let supervisor = Arc::new(WorkerSupervisor::new(
            Arc::clone(&registry),
            config.worker.clone(),
            local,
            Some(remote),
            events.clone(),
        ));

        Self {
            supervisor,
            registry,
            relay,
            hub,
            events,
            metrics,
            verification: config.verification.clone(),
            remote: config.remote.clone(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Bring the point-in-time gauges up to date.
    pub fn refresh_gauges(&self) {
        self.metrics
            .set_gauge("tasks_running", self.registry.running_count() as i64);
        self.metrics
            .set_gauge("remote_agents_online", self.hub.online_count() as i64);
        self.metrics
            .set_gauge("verification_pending", self.relay.pending_count() as i64);
    }
}
