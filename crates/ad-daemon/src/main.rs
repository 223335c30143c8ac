//! auto-deliver daemon: wires the orchestration core and serves the API.
//!
//! Usage: `ad-daemon [CONFIG_PATH]`. Without a path the config comes from
//! `$AD_CONFIG` or `~/.auto-deliver/config.toml`, falling back to defaults.

use ad_core::config::Config;
use ad_daemon::daemon::Daemon;
use anyhow::{Context, Result};
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    dotenv::dotenv().ok();

    let config = match std::env::args_os().nth(1) {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    ad_telemetry::logging::init(
        "ad-daemon",
        &config.general.log_level,
        config.general.json_logs(),
    );
    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_addr = %config.daemon.bind_addr(),
        "auto-deliver daemon starting"
    );

    let daemon = Daemon::new(config);
    let shutdown = daemon.shutdown_handle();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}
