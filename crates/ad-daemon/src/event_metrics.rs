//! Bus events folded into the metrics collector.
//!
//! HTTP handlers count what they decide (starts, rejections, answers);
//! everything that happens off the request path is counted here.

use ad_core::event_bus::Event;
use ad_telemetry::metrics::MetricsCollector;

pub fn record_event(metrics: &MetricsCollector, event: &Event) {
    match event {
        Event::TaskStarted { backend, mode, .. } => metrics.increment_counter(
            "worker_launches_total",
            &[("backend", backend.as_str()), ("mode", mode.as_env())],
        ),
        Event::TaskFinished {
            state, duration_ms, ..
        } => {
            metrics.increment_counter("tasks_finished_total", &[("outcome", state.as_str())]);
            metrics.record_histogram("task_duration_seconds", *duration_ms as f64 / 1000.0);
        }
        Event::ChallengePublished { .. } => {
            metrics.increment_counter("verification_published_total", &[]);
        }
        Event::LoginResolved { success, .. } => metrics.increment_counter(
            "remote_login_resolved_total",
            &[("success", if *success { "true" } else { "false" })],
        ),
        Event::DeliveryComplete { .. } => {
            metrics.increment_counter("deliveries_completed_total", &[]);
        }
        Event::AgentConnected { .. } => {
            metrics.increment_counter("remote_agent_connections_total", &[]);
        }
        Event::ChallengeAnswered { .. }
        | Event::AgentDisconnected { .. }
        | Event::DeliveryProgress { .. } => {}
    }
}
