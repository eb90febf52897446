pub mod auth;
pub mod client;
pub mod messages;

pub use auth::{AuthCredentials, ChallengeSigner, LocalChallengeSigner};
pub use client::{ChannelStats, TradingChannel, DEFAULT_REQUEST_TIMEOUT_MS};
pub use messages::{
    BuildSwapParams, BuildSwapTxResultData, ClientMessage, QuoteParams, QuoteResultData,
    RouteEcho, ServerMessage,
};
