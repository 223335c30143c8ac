pub mod daemon;
pub mod event_metrics;
pub mod shutdown;
