use std::env;

/// Client-side configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// URL of the trading backend's message channel
    pub channel_url: String,

    /// URL of the public RPC endpoint
    pub rpc_url: String,

    /// Overall deadline for background confirmation, in milliseconds
    pub confirm_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel_url: "wss://trade.example.com/channel".to_string(),
            rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
            confirm_timeout_ms: 60_000,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            channel_url: env::var("TRADING_CHANNEL_URL").unwrap_or(defaults.channel_url),
            rpc_url: env::var("SOLANA_RPC_URL").unwrap_or(defaults.rpc_url),
            confirm_timeout_ms: env::var("CONFIRM_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.confirm_timeout_ms),
        }
    }
}

/// Edge gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bind address of the gateway listener
    pub bind_addr: String,

    /// Secret for session-token signing; token minting answers 500
    /// without it
    pub session_secret: Option<String>,

    /// Fixed upstream market-data socket
    pub upstream_feed_url: String,

    /// Public host for the strict same-host Origin check; falls back to
    /// the request's Host header when unset
    pub public_host: Option<String>,

    /// Concurrent relay sockets allowed per client IP
    pub max_sockets_per_ip: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            session_secret: None,
            upstream_feed_url: "wss://pumpportal.fun/api/data".to_string(),
            public_host: None,
            max_sockets_per_ip: 2,
        }
    }
}

impl GatewayConfig {
    /// Creates a configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: env::var("GATEWAY_BIND").unwrap_or(defaults.bind_addr),
            session_secret: env::var("SESSION_TOKEN_SECRET").ok().filter(|s| !s.is_empty()),
            upstream_feed_url: env::var("UPSTREAM_FEED_URL").unwrap_or(defaults.upstream_feed_url),
            public_host: env::var("GATEWAY_PUBLIC_HOST").ok().filter(|s| !s.is_empty()),
            max_sockets_per_ip: env::var("MAX_SOCKETS_PER_IP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_sockets_per_ip),
        }
    }
}
