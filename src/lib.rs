pub mod channel;
pub mod config;
pub mod entity;
pub mod gateway;
pub mod pipeline;
pub mod ratio;
pub mod session;
pub mod solana;

// Re-export commonly used items
pub use channel::{AuthCredentials, ChallengeSigner, TradingChannel};
pub use config::{ClientConfig, GatewayConfig};
pub use entity::{
    ChannelError, ConfirmOutcome, ConfirmationState, PipelineError, Quote, SessionError,
    TradeDirection, TradeIntent,
};
pub use gateway::{serve, GatewayState};
pub use pipeline::{ExecutionPipeline, SubmittedTrade, SwapBackend, TxSubmitter, WalletSigner};
pub use ratio::{growth_bps, growth_percent, ScaledRatio};
pub use session::{DelegatedFastSession, SessionPhase};
pub use solana::create_rpc_client;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
