//! Drop Relay Server
//!
//! Process entry point: logging, configuration from the environment,
//! and the relay server with a ctrl-c shutdown hook.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use drop_relay::{RelayConfig, RelayServer, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let config = RelayConfig::from_env();
    info!("Drop Relay v{}", VERSION);
    info!("Max message size: {} bytes", config.max_message_bytes);
    info!("Idle timeout: {:?}", config.health.idle_timeout);

    let server = Arc::new(RelayServer::new(config));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            signal_server.shutdown();
        }
    });

    server.run().await.context("relay server failed")?;
    Ok(())
}
