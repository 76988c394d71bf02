//! Save Sync Server
//!
//! Serves save sessions over WebSocket. Configuration comes from `SYNC_*`
//! environment variables, log filtering from `RUST_LOG`.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use save_sync::{GameServer, ServerConfig, SessionHooks, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::from_env().context("reading SYNC_* configuration")?;

    info!("Save Sync Server v{}", VERSION);
    info!("Tick Rate: {} Hz, Push Rate: {} Hz", config.tick_rate, config.push_rate);
    info!("Push Mode: {:?}", config.session.push_mode);

    let server = GameServer::new(config, SessionHooks::default());

    tokio::select! {
        result = server.run() => {
            result.context("server stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            server.shutdown();
        }
    }

    Ok(())
}
