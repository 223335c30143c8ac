//! Task execution for auto-deliver tenants.
//!
//! [`registry::TaskRegistry`] enforces one active run per tenant,
//! [`supervisor::WorkerSupervisor`] drives a run to a terminal
//! [`ad_core::types::Outcome`] through a [`launcher::WorkerLauncher`].

pub mod hints;
pub mod launcher;
pub mod registry;
pub mod supervisor;
pub mod task_log;
