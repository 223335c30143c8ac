//! Interactive handshakes between workers, humans and remote browser agents.
//!
//! - [`verification`]: challenge mailbox with per-request expiry
//! - [`remote_hub`]: live remote-agent channels and the login rendezvous
//! - [`protocol`]: JSON wire messages exchanged with remote agents

pub mod protocol;
pub mod remote_hub;
pub mod verification;
