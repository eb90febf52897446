use serde::{Deserialize, Serialize};

use crate::ratio::ScaledRatio;

/// The backend's chosen execution route. `serialized_quote` is an opaque
/// backend-defined token that must be echoed back verbatim to the build
/// step; it is never inspected client-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRoute {
    pub provider: String,
    #[serde(default)]
    pub hops: Option<u32>,
    pub serialized_quote: String,
}

/// A validated quote for one trade attempt. All amounts are integer base
/// units.
#[derive(Debug, Clone)]
pub struct Quote {
    pub amount_in: u64,
    pub amount_out: u64,
    pub min_out: u64,
    pub price_impact_bps: i64,
    pub route: QuoteRoute,
}

impl Quote {
    /// Out/in price ratio, for growth tracking between quotes.
    pub fn execution_ratio(&self) -> Option<ScaledRatio> {
        ScaledRatio::compute(self.amount_in, self.amount_out)
    }
}

/// An unsigned transaction produced by the backend's build step. Opaque
/// bytes plus a blockhash validity window; consumed exactly once by a
/// signer and never persisted.
#[derive(Debug, Clone)]
pub struct UnsignedSwapTransaction {
    pub bytes: Vec<u8>,
    pub recent_blockhash: Option<String>,
    pub last_valid_block_height: Option<u64>,
}
