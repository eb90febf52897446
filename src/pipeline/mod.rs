pub mod confirm;
pub mod delegate_rewrite;
pub mod executor;

pub use confirm::{
    confirm_with_fallback, spawn_confirmation, ConfirmTiming, StatusSource,
    DEFAULT_CONFIRM_TIMEOUT_MS, NATIVE_CONFIRM_LEASH_MS, POLL_INTERVAL_MS,
};
pub use delegate_rewrite::rewrite_for_delegate;
pub use executor::{
    ExecutionPipeline, LocalWalletSigner, PipelineState, SubmittedTrade, SwapBackend,
    TxSubmitter, WalletSigner,
};
