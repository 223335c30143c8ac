use std::sync::Arc;
use std::time::Duration;

use ad_bridge::http_api::{api_router_with_auth, ApiState};
use ad_core::config::Config;
use ad_core::event_bus::{Event, EventBus};
use ad_telemetry::metrics::MetricsCollector;
use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::event_metrics::record_event;
use crate::shutdown::ShutdownSignal;

/// Loops spawned by [`Daemon::run_with_listener`], each holding a guard.
const BACKGROUND_LOOPS: usize = 2;

/// The top-level daemon: owns the orchestration core, the HTTP server and
/// the maintenance loops.
pub struct Daemon {
    config: Config,
    shutdown: ShutdownSignal,
    events: EventBus,
    api_state: Arc<ApiState>,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        let events = EventBus::new();
        let metrics = Arc::new(MetricsCollector::with_defaults());
        let api_state = Arc::new(ApiState::new(&config, events.clone(), metrics));
        Self {
            config,
            shutdown: ShutdownSignal::new(),
            events,
            api_state,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A handle that can trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn api_state(&self) -> Arc<ApiState> {
        Arc::clone(&self.api_state)
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    /// Bind `daemon.host:daemon.port` and run until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = self.config.daemon.bind_addr();
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already-bound listener (tests pass `127.0.0.1:0`).
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let api_key = self.config.daemon.api_key();
        if api_key.is_some() {
            info!(env = %self.config.daemon.api_key_env, "API key authentication enabled");
        } else {
            warn!(
                env = %self.config.daemon.api_key_env,
                "no API key set, the API is unauthenticated"
            );
        }
        let router = api_router_with_auth(self.api_state(), api_key);
        let bind_addr = listener
            .local_addr()
            .context("listener has no local address")?;

        tokio::spawn(Self::sweep_loop(
            self.api_state(),
            Duration::from_secs(self.config.verification.sweep_interval_secs),
            self.shutdown.clone(),
        ));
        tokio::spawn(Self::metrics_loop(
            self.events.subscribe(),
            self.api_state(),
            self.shutdown.clone(),
        ));

        let signal = self.shutdown.clone();
        let mut server: JoinHandle<std::io::Result<()>> = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { signal.triggered().await })
                .await
        });
        info!(
            %bind_addr,
            sweep_interval_secs = self.config.verification.sweep_interval_secs,
            "API server listening"
        );

        let early_exit = tokio::select! {
            res = &mut server => Some(res),
            _ = self.shutdown.triggered() => None,
        };
        // An early server exit is fatal; stop the loops and tasks with it.
        self.shutdown.trigger();

        let grace = self.grace();
        let server_stopped = async {
            match early_exit {
                Some(res) => flatten(res),
                None => {
                    let waited = tokio::time::timeout(grace, &mut server).await;
                    match waited {
                        Ok(res) => flatten(res),
                        Err(_) => {
                            warn!(
                                grace_secs = grace.as_secs(),
                                "open connections outlived the grace period, closing them"
                            );
                            server.abort();
                            Ok(())
                        }
                    }
                }
            }
        };
        let (served, ()) = tokio::join!(server_stopped, self.drain());

        if let Err(e) = &served {
            error!(error = %e, "API server error");
        }
        info!("daemon stopped");
        served
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.config.daemon.shutdown_grace_secs)
    }

    /// Cancel every running task and wait for workers and loops to stop.
    async fn drain(&self) {
        let grace = self.grace();
        let cancelled = self.api_state.registry.cancel_all();
        if cancelled > 0 {
            info!(cancelled, "cancelling running tasks");
        }
        if !self.api_state.supervisor.wait_idle(grace).await {
            warn!(
                in_flight = self.api_state.supervisor.in_flight(),
                grace_secs = grace.as_secs(),
                "tasks still tearing down after the grace period"
            );
        }
        self.shutdown.wait_for_drain(BACKGROUND_LOOPS, grace).await;
        self.api_state.refresh_gauges();
    }

    // -----------------------------------------------------------------------
    // Background loops
    // -----------------------------------------------------------------------

    async fn sweep_loop(state: Arc<ApiState>, every: Duration, shutdown: ShutdownSignal) {
        let _guard = shutdown.guard();
        let mut ticker = tokio::time::interval(every);
        // Consume the immediate first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = state.relay.sweep_expired();
                    if removed > 0 {
                        info!(removed, "expired verification requests swept");
                    }
                    state.refresh_gauges();
                }
                _ = shutdown.triggered() => {
                    debug!("sweep loop stopping");
                    break;
                }
            }
        }
    }

    async fn metrics_loop(
        events: flume::Receiver<Event>,
        state: Arc<ApiState>,
        shutdown: ShutdownSignal,
    ) {
        let _guard = shutdown.guard();
        loop {
            tokio::select! {
                received = events.recv_async() => {
                    let Ok(event) = received else { break };
                    record_event(&state.metrics, &event);
                    if matches!(
                        event,
                        Event::TaskFinished { .. }
                            | Event::AgentConnected { .. }
                            | Event::AgentDisconnected { .. }
                    ) {
                        state.refresh_gauges();
                    }
                }
                _ = shutdown.triggered() => {
                    debug!("metrics loop stopping");
                    break;
                }
            }
        }
    }
}

fn flatten(res: std::result::Result<std::io::Result<()>, tokio::task::JoinError>) -> Result<()> {
    res.context("API server task panicked")?
        .context("API server failed")
}
