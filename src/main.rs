//! Edge trust gateway - Main executable
//!
//! This is the entry point for the edge relay that mints short-lived,
//! IP-bound session tokens and proxies the upstream market-data socket
//! under per-IP rate limiting.
use anyhow::Context;
use dotenv::dotenv;
use log::{info, warn};
use solana_swap_terminal::{serve, GatewayConfig, GatewayState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio;

/// Application entry point
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Initialize logging with default level of "info"
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    info!(
        "Starting edge trust gateway v{}",
        solana_swap_terminal::VERSION
    );

    let config = GatewayConfig::from_env();

    if config.session_secret.is_none() {
        warn!("SESSION_TOKEN_SECRET is not set; token minting will answer 500");
    }

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .context("GATEWAY_BIND must be a valid socket address")?;

    let state = Arc::new(GatewayState::new(&config));

    info!(
        "Gateway listening on {} (upstream: {})",
        addr, config.upstream_feed_url
    );
    serve(state, addr).await.context("gateway server failed")?;

    info!("Gateway stopped.");
    Ok(())
}
