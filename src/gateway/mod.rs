pub mod rate;
pub mod relay;
pub mod server;
pub mod token;

pub use rate::{BucketPolicy, RateBucketStore, MINT_POLICY, UPGRADE_POLICY};
pub use relay::{run_relay, PENDING_BUFFER_LIMIT, UPSTREAM_CLOSED_REASON};
pub use server::{handle_request, serve, GatewayState, FEED_PATH, SESSION_TOKEN_PATH};
pub use token::{
    mint_session_token, verify_session_token, MintedToken, TokenError, TOKEN_MAX_AGE_SECS,
    TOKEN_SKEW_SECS, TOKEN_TTL_SECS,
};
