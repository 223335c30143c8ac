//! HTTP and WebSocket surface of auto-deliver.
//!
//! - [`http_api`]: axum router for task triggers, the verification relay,
//!   remote-agent control, events and metrics
//! - [`agent_ws`]: the remote browser agent WebSocket
//! - [`auth`]: API key middleware
//! - [`api_error`]: error-to-response mapping

pub mod agent_ws;
pub mod api_error;
pub mod auth;
pub mod http_api;
