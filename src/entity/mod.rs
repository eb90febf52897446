mod confirm;
mod error;
mod quote;
mod trade;

pub use confirm::{ConfirmOutcome, ConfirmationState};
pub use error::{ChannelError, PipelineError, SessionError, RATE_LIMIT_CODE_PREFIX};
pub use quote::{Quote, QuoteRoute, UnsignedSwapTransaction};
pub use trade::{TradeDirection, TradeIntent, MAX_SLIPPAGE_BPS};
