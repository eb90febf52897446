use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, info, warn};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_sdk::{
    hash::Hash,
    pubkey::Pubkey,
    signature::{Keypair, Signature},
    signer::Signer,
    transaction::VersionedTransaction,
};
use spl_associated_token_account::get_associated_token_address;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::channel::messages::{
    BuildSwapParams, BuildSwapTxResultData, QuoteParams, QuoteResultData, RouteEcho,
};
use crate::entity::{
    ChannelError, ConfirmationState, PipelineError, Quote, QuoteRoute, TradeDirection,
    TradeIntent, UnsignedSwapTransaction,
};
use crate::pipeline::confirm::{spawn_confirmation, ConfirmTiming, StatusSource};
use crate::pipeline::delegate_rewrite::rewrite_for_delegate;
use crate::session::DelegatedFastSession;

/// Starting backoff after a rate-limit response; doubles per attempt.
const RATE_LIMIT_BACKOFF_START_MS: u64 = 500;
const RATE_LIMIT_BACKOFF_CAP_MS: u64 = 8_000;
const RATE_LIMIT_MAX_RETRIES: u32 = 2;

/// Foreground pipeline states. Confirmation runs detached and is not a
/// foreground state; its progress is published on the trade's watch
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Quoting,
    Building,
    Signing,
    Submitting,
}

/// The trading backend as the pipeline consumes it. `TradingChannel` is
/// the production implementation; tests script their own.
#[async_trait]
pub trait SwapBackend: Send + Sync {
    async fn fetch_quote(&self, params: QuoteParams) -> Result<QuoteResultData, ChannelError>;

    async fn build_swap_tx(
        &self,
        params: BuildSwapParams,
    ) -> Result<BuildSwapTxResultData, ChannelError>;

    /// Forces a fresh connection; used for the retry-once-on-transport
    /// policy.
    async fn reconnect(&self) -> Result<(), ChannelError>;
}

/// Holds signing authority for the user's wallet. The pipeline hands a
/// transaction across this boundary and gets a signed one back; the key
/// never crosses it. Wallet approval is human-in-the-loop and unbounded
/// in latency.
#[async_trait]
pub trait WalletSigner: Send + Sync {
    fn pubkey(&self) -> Pubkey;

    async fn sign_transaction(
        &self,
        transaction: VersionedTransaction,
    ) -> Result<VersionedTransaction, PipelineError>;
}

/// In-process wallet over a local keypair, for tooling and tests.
pub struct LocalWalletSigner {
    keypair: Keypair,
}

impl LocalWalletSigner {
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }

    pub fn from_base58(keypair_base58: &str) -> anyhow::Result<Self> {
        Ok(Self::new(crate::solana::wallet::keypair_from_base58(
            keypair_base58,
        )?))
    }
}

#[async_trait]
impl WalletSigner for LocalWalletSigner {
    fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    async fn sign_transaction(
        &self,
        transaction: VersionedTransaction,
    ) -> Result<VersionedTransaction, PipelineError> {
        VersionedTransaction::try_new(transaction.message, &[&self.keypair])
            .map_err(|e| PipelineError::Signing(e.to_string()))
    }
}

/// Submits raw transactions to the chain.
#[async_trait]
pub trait TxSubmitter: Send + Sync {
    async fn submit(&self, transaction: &VersionedTransaction) -> Result<Signature, PipelineError>;

    async fn latest_blockhash(&self) -> Result<Hash, PipelineError>;
}

#[async_trait]
impl TxSubmitter for RpcClient {
    async fn submit(&self, transaction: &VersionedTransaction) -> Result<Signature, PipelineError> {
        self.send_transaction_with_config(
            transaction,
            RpcSendTransactionConfig {
                skip_preflight: true,
                ..RpcSendTransactionConfig::default()
            },
        )
        .await
        .map_err(|e| PipelineError::Submission(e.to_string()))
    }

    async fn latest_blockhash(&self) -> Result<Hash, PipelineError> {
        self.get_latest_blockhash()
            .await
            .map_err(|e| PipelineError::Rpc(e.to_string()))
    }
}

/// Handle for a submitted trade. The foreground flow is already back at
/// idle when this exists; `confirmation` publishes the background
/// confirmation states.
pub struct SubmittedTrade {
    pub signature: Signature,
    pub quote: Quote,
    pub confirmation: watch::Receiver<ConfirmationState>,
}

/// The quote → build → sign → submit state machine for a single swap.
///
/// Submission is optimistic: once the RPC returns a signature, the
/// foreground flow returns and confirmation continues detached.
pub struct ExecutionPipeline {
    backend: Arc<dyn SwapBackend>,
    submitter: Arc<dyn TxSubmitter>,
    status_source: Arc<dyn StatusSource>,
    confirm_timeout: Duration,
    confirm_timing: ConfirmTiming,
    state_tx: watch::Sender<PipelineState>,
}

impl ExecutionPipeline {
    pub fn new(
        backend: Arc<dyn SwapBackend>,
        submitter: Arc<dyn TxSubmitter>,
        status_source: Arc<dyn StatusSource>,
        confirm_timeout: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(PipelineState::Idle);
        Self {
            backend,
            submitter,
            status_source,
            confirm_timeout,
            confirm_timing: ConfirmTiming::default(),
            state_tx,
        }
    }

    /// Wires the pipeline from configuration. One RPC client serves as
    /// both submitter and confirmation source.
    pub fn from_config(
        config: &crate::config::ClientConfig,
        backend: Arc<dyn SwapBackend>,
    ) -> anyhow::Result<Self> {
        let rpc = crate::solana::create_rpc_client(&config.rpc_url)?;
        Ok(Self::new(
            backend,
            Arc::clone(&rpc) as Arc<dyn TxSubmitter>,
            rpc as Arc<dyn StatusSource>,
            Duration::from_millis(config.confirm_timeout_ms),
        ))
    }

    /// Overrides confirmation timings; used by tests to run the same
    /// machine in milliseconds.
    pub fn with_confirm_timing(mut self, timing: ConfirmTiming) -> Self {
        self.confirm_timing = timing;
        self
    }

    /// Subscribe to foreground state transitions.
    pub fn state_watch(&self) -> watch::Receiver<PipelineState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: PipelineState) {
        debug!("pipeline state -> {:?}", state);
        let _ = self.state_tx.send(state);
    }

    /// Runs the full flow with the user's wallet as signer.
    pub async fn execute(
        &self,
        intent: &TradeIntent,
        wallet: &dyn WalletSigner,
    ) -> Result<SubmittedTrade, PipelineError> {
        let result = self.execute_inner(intent, wallet).await;
        self.set_state(PipelineState::Idle);
        result
    }

    async fn execute_inner(
        &self,
        intent: &TradeIntent,
        wallet: &dyn WalletSigner,
    ) -> Result<SubmittedTrade, PipelineError> {
        let owner = wallet.pubkey();

        self.set_state(PipelineState::Quoting);
        let quote = self.fetch_quote(intent, &owner).await?;

        self.set_state(PipelineState::Building);
        let unsigned = self.build_swap(&owner, &quote, Some(true), None, None).await?;
        let transaction = decode_transaction(&unsigned)?;

        self.set_state(PipelineState::Signing);
        let signed = wallet.sign_transaction(transaction).await?;

        self.set_state(PipelineState::Submitting);
        let signature = self.submitter.submit(&signed).await?;
        info!("swap submitted: {}", signature);

        Ok(self.submitted(signature, quote))
    }

    /// Runs the delegated buy flow: the backend builds for the session's
    /// ephemeral key, the transaction is rewritten around the capped
    /// delegate transfer, and the session signs. Requires an armed
    /// session and an explicit opt-in by calling this method.
    pub async fn execute_delegated(
        &self,
        intent: &TradeIntent,
        session: &DelegatedFastSession,
    ) -> Result<SubmittedTrade, PipelineError> {
        let result = self.execute_delegated_inner(intent, session).await;
        self.set_state(PipelineState::Idle);
        result
    }

    async fn execute_delegated_inner(
        &self,
        intent: &TradeIntent,
        session: &DelegatedFastSession,
    ) -> Result<SubmittedTrade, PipelineError> {
        if intent.direction != TradeDirection::Buy {
            return Err(PipelineError::Delegated(
                "only buys may use the fast session".to_string(),
            ));
        }

        let status = session.status();
        let (owner, delegate, cap) = match (status.owner, status.delegate, status.cap_lamports) {
            (Some(owner), Some(delegate), Some(cap)) if session.is_active() => {
                (owner, delegate, cap)
            }
            _ => {
                return Err(PipelineError::Delegated(
                    "no active fast session".to_string(),
                ))
            }
        };

        let budget = intent.amount_in.min(cap);
        if budget < intent.amount_in {
            warn!(
                "delegated buy capped at {} SOL of {} SOL requested",
                crate::solana::lamports_to_sol(budget),
                crate::solana::lamports_to_sol(intent.amount_in)
            );
        }

        self.set_state(PipelineState::Quoting);
        let quote = self.fetch_quote(intent, &delegate).await?;

        self.set_state(PipelineState::Building);
        let destination = get_associated_token_address(&owner, &intent.token_mint);
        let unsigned = self
            .build_swap(
                &delegate,
                &quote,
                Some(false),
                Some(true),
                Some(destination.to_string()),
            )
            .await?;
        let transaction = decode_transaction(&unsigned)?;

        self.set_state(PipelineState::Signing);
        let (instructions, blockhash) =
            rewrite_for_delegate(&transaction, &owner, &delegate, &intent.token_mint, budget)?;
        let signed = session
            .sign_delegate_transaction(&instructions, blockhash)
            .map_err(|e| PipelineError::Delegated(e.to_string()))?;

        self.set_state(PipelineState::Submitting);
        let signature = self
            .submitter
            .submit(&VersionedTransaction::from(signed))
            .await?;
        info!("delegated swap submitted: {}", signature);

        Ok(self.submitted(signature, quote))
    }

    fn submitted(&self, signature: Signature, quote: Quote) -> SubmittedTrade {
        let confirmation = spawn_confirmation(
            Arc::clone(&self.status_source),
            signature,
            self.confirm_timeout,
            self.confirm_timing,
        );
        SubmittedTrade {
            signature,
            quote,
            confirmation,
        }
    }

    async fn fetch_quote(
        &self,
        intent: &TradeIntent,
        user: &Pubkey,
    ) -> Result<Quote, PipelineError> {
        let params = QuoteParams {
            user_pubkey: user.to_string(),
            input_mint: intent.input_mint().to_string(),
            output_mint: intent.output_mint().to_string(),
            amount_in: intent.amount_in,
            slippage_bps: intent.slippage_bps,
        };

        let data = call_with_recovery(self.backend.as_ref(), BackendCall::Quote(params))
            .await
            .map_err(channel_error)?;
        let data = match data {
            BackendReply::Quote(data) => data,
            BackendReply::Build(_) => unreachable!("quote call returns quote data"),
        };

        let quote = validate_quote(data)?;
        if let Some(ratio) = quote.execution_ratio() {
            debug!(
                "quote: {} in, {} out, ratio {}",
                quote.amount_in, quote.amount_out, ratio
            );
        }
        Ok(quote)
    }

    async fn build_swap(
        &self,
        user: &Pubkey,
        quote: &Quote,
        wrap_and_unwrap_sol: Option<bool>,
        as_legacy: Option<bool>,
        destination_token_account: Option<String>,
    ) -> Result<UnsignedSwapTransaction, PipelineError> {
        let params = BuildSwapParams {
            user_pubkey: user.to_string(),
            quote: RouteEcho {
                provider: quote.route.provider.clone(),
                // Echoed back verbatim; never rewritten.
                serialized_quote: quote.route.serialized_quote.clone(),
            },
            wrap_and_unwrap_sol,
            as_legacy_transaction: as_legacy,
            destination_token_account,
        };

        let data = call_with_recovery(self.backend.as_ref(), BackendCall::Build(params))
            .await
            .map_err(channel_error)?;
        let data = match data {
            BackendReply::Build(data) => data,
            BackendReply::Quote(_) => unreachable!("build call returns build data"),
        };

        validate_build(data)
    }
}

enum BackendCall {
    Quote(QuoteParams),
    Build(BuildSwapParams),
}

enum BackendReply {
    Quote(QuoteResultData),
    Build(BuildSwapTxResultData),
}

/// Runs one backend call under the recovery policy: transport
/// failures retried exactly once after a forced reconnect; rate limits
/// retried under exponential backoff; everything else surfaced as-is.
async fn call_with_recovery(
    backend: &dyn SwapBackend,
    call: BackendCall,
) -> Result<BackendReply, ChannelError> {
    let mut transport_retried = false;
    let mut rate_limit_retries = 0u32;
    let mut backoff_ms = RATE_LIMIT_BACKOFF_START_MS;

    loop {
        let result = match &call {
            BackendCall::Quote(params) => backend
                .fetch_quote(params.clone())
                .await
                .map(BackendReply::Quote),
            BackendCall::Build(params) => backend
                .build_swap_tx(params.clone())
                .await
                .map(BackendReply::Build),
        };

        match result {
            Ok(reply) => return Ok(reply),
            Err(e) if e.is_transport() && !transport_retried => {
                warn!("transport failure ({}); reconnecting once", e);
                transport_retried = true;
                backend.reconnect().await?;
            }
            Err(e) if e.is_rate_limit() && rate_limit_retries < RATE_LIMIT_MAX_RETRIES => {
                warn!(
                    "rate limited by backend ({}); backing off {} ms",
                    e.code(),
                    backoff_ms
                );
                rate_limit_retries += 1;
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(RATE_LIMIT_BACKOFF_CAP_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

fn channel_error(e: ChannelError) -> PipelineError {
    match e {
        // A message that parses but omits contract-required content is a
        // contract violation, not a transport problem.
        ChannelError::Malformed(detail) => PipelineError::ContractViolation(detail),
        other => PipelineError::Channel(other),
    }
}

fn validate_quote(data: QuoteResultData) -> Result<Quote, PipelineError> {
    let route = data.route.ok_or_else(|| {
        PipelineError::ContractViolation("quote_result carries no route".to_string())
    })?;

    let serialized_quote = route
        .serialized_quote
        .filter(|blob| !blob.is_empty())
        .ok_or_else(|| {
            PipelineError::ContractViolation(
                "backend omitted route.serializedQuote".to_string(),
            )
        })?;

    Ok(Quote {
        amount_in: data.amount_in,
        amount_out: data.amount_out,
        min_out: data.min_out,
        price_impact_bps: data.price_impact_bps,
        route: QuoteRoute {
            provider: route.provider,
            hops: route.hops,
            serialized_quote,
        },
    })
}

fn validate_build(data: BuildSwapTxResultData) -> Result<UnsignedSwapTransaction, PipelineError> {
    let blob = data.transaction_blob().ok_or_else(|| {
        PipelineError::ContractViolation(
            "build_swap_tx_result carries no transaction".to_string(),
        )
    })?;

    let bytes = STANDARD.decode(blob).map_err(|e| {
        PipelineError::ContractViolation(format!("transaction blob is not base64: {}", e))
    })?;

    Ok(UnsignedSwapTransaction {
        bytes,
        recent_blockhash: data.recent_blockhash,
        last_valid_block_height: data.last_valid_block_height,
    })
}

fn decode_transaction(
    unsigned: &UnsignedSwapTransaction,
) -> Result<VersionedTransaction, PipelineError> {
    bincode::deserialize(&unsigned.bytes).map_err(|e| {
        PipelineError::ContractViolation(format!("undecodable built transaction: {}", e))
    })
}
