//! Observability for auto-deliver services.
//!
//! - **Logging**: human-readable and JSON output via `tracing-subscriber`
//! - **Metrics**: counters, gauges and histograms with Prometheus export
//! - **Middleware**: axum layers for request ids and request metrics

pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod tracing_setup;
