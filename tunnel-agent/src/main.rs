//! ModelPort tunnel agent - connects a local model runtime to the backend
//! over an outbound persistent tunnel.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod runtime;
mod tunnel;

use config::Config;
use runtime::HttpRuntime;
use tunnel::TunnelClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load().map_err(|e| {
        format!(
            "Failed to load configuration: {}. \
             Make sure config.toml exists or set AGENT__TUNNEL__WS_URL.",
            e
        )
    })?;

    let identity = config
        .agent
        .identity
        .clone()
        .unwrap_or_else(tunnel_common::guest_identity);
    tracing::info!(
        "Starting modelport-agent as {} (runtime at {})",
        identity,
        config.runtime.base_url
    );

    let runtime = Arc::new(HttpRuntime::new(&config.runtime.base_url));
    let client = TunnelClient::new(config, identity, runtime);
    client.run().await;

    Ok(())
}
