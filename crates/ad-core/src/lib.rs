//! Core domain types shared by every auto-deliver crate.
//!
//! - [`types`]: tenant identifiers, task states, run modes and outcomes
//! - [`config`]: TOML configuration loaded from `~/.auto-deliver/config.toml`
//! - [`rendezvous`]: single-fire release/wait primitive with timeouts
//! - [`clock`]: injectable wall clock (manual clock for tests)
//! - [`isolation`]: tenant-scoped path derivation and traversal guard
//! - [`event_bus`]: fan-out of orchestration events to observers

pub mod clock;
pub mod config;
pub mod event_bus;
pub mod isolation;
pub mod rendezvous;
pub mod types;
