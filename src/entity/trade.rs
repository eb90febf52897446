use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;

use crate::entity::error::PipelineError;

/// Maximum tolerated slippage, in basis points (500%).
pub const MAX_SLIPPAGE_BPS: u16 = 50_000;

/// Direction of a swap relative to the native token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeDirection {
    /// Spend SOL, receive the token.
    Buy,
    /// Spend the token, receive SOL.
    Sell,
}

/// A user's swap intent. Immutable for the lifetime of one attempt;
/// a retry gets a fresh intent.
#[derive(Debug, Clone)]
pub struct TradeIntent {
    pub direction: TradeDirection,
    pub token_mint: Pubkey,
    /// Input amount in base units (lamports for buys, token units for sells).
    pub amount_in: u64,
    pub slippage_bps: u16,
}

impl TradeIntent {
    pub fn new(
        direction: TradeDirection,
        token_mint: Pubkey,
        amount_in: u64,
        slippage_bps: u16,
    ) -> Result<Self, PipelineError> {
        if amount_in == 0 {
            return Err(PipelineError::InvalidIntent(
                "amount must be greater than zero".to_string(),
            ));
        }

        if slippage_bps > MAX_SLIPPAGE_BPS {
            return Err(PipelineError::InvalidIntent(format!(
                "slippage {} bps exceeds maximum {}",
                slippage_bps, MAX_SLIPPAGE_BPS
            )));
        }

        Ok(Self {
            direction,
            token_mint,
            amount_in,
            slippage_bps,
        })
    }

    /// Builds an intent from a base58 mint string, as the UI hands it in.
    pub fn parse(
        direction: TradeDirection,
        token_mint: &str,
        amount_in: u64,
        slippage_bps: u16,
    ) -> Result<Self, PipelineError> {
        let mint = crate::solana::wallet::parse_pubkey(token_mint)
            .map_err(|e| PipelineError::InvalidIntent(e.to_string()))?;
        Self::new(direction, mint, amount_in, slippage_bps)
    }

    /// Input mint for the swap route.
    pub fn input_mint(&self) -> Pubkey {
        match self.direction {
            TradeDirection::Buy => spl_token::native_mint::id(),
            TradeDirection::Sell => self.token_mint,
        }
    }

    /// Output mint for the swap route.
    pub fn output_mint(&self) -> Pubkey {
        match self.direction {
            TradeDirection::Buy => self.token_mint,
            TradeDirection::Sell => spl_token::native_mint::id(),
        }
    }
}
