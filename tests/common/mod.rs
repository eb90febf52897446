//! Shared test doubles for the pipeline and session scenarios.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use solana_sdk::{
    hash::Hash,
    message::{Message, VersionedMessage},
    pubkey::Pubkey,
    signature::Signature,
    system_instruction,
    transaction::VersionedTransaction,
};
use solana_transaction_status::{TransactionConfirmationStatus, TransactionStatus};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use solana_swap_terminal::channel::messages::{
    BuildSwapParams, BuildSwapTxResultData, QuoteParams, QuoteResultData,
};
use solana_swap_terminal::entity::{ChannelError, PipelineError};
use solana_swap_terminal::pipeline::{StatusSource, SwapBackend, TxSubmitter, WalletSigner};

pub const ROUTE_BLOB: &str = "route-blob-7f3a";

/// Serializes a minimal legacy transaction the way the backend's build
/// step would, with `user` as fee payer.
pub fn unsigned_transaction_base64(user: &Pubkey) -> String {
    let instruction = system_instruction::transfer(user, &Pubkey::new_unique(), 1);
    let message = Message::new_with_blockhash(&[instruction], Some(user), &Hash::new_unique());
    let transaction = VersionedTransaction {
        signatures: vec![Signature::default(); message.header.num_required_signatures as usize],
        message: VersionedMessage::Legacy(message),
    };
    STANDARD.encode(bincode::serialize(&transaction).expect("serializable test transaction"))
}

pub fn quote_result() -> QuoteResultData {
    serde_json::from_value(serde_json::json!({
        "amountIn": 10_000_000u64,
        "amountOut": 123_456_789u64,
        "minOut": 122_222_221u64,
        "priceImpactBps": 35,
        "route": {
            "provider": "jupiter",
            "hops": 2,
            "serializedQuote": ROUTE_BLOB,
        }
    }))
    .expect("valid quote fixture")
}

pub fn quote_result_without_route_blob() -> QuoteResultData {
    serde_json::from_value(serde_json::json!({
        "amountIn": 10_000_000u64,
        "amountOut": 123_456_789u64,
        "minOut": 122_222_221u64,
        "route": {"provider": "jupiter"}
    }))
    .expect("valid quote fixture")
}

/// Scripted backend. Quote errors are served (and consumed) before the
/// canned quote; the build step echoes a transaction for the requested
/// user unless `omit_build_blob` is set.
#[derive(Default)]
pub struct MockBackend {
    pub quote_errors: Mutex<VecDeque<ChannelError>>,
    pub omit_route_blob: bool,
    pub omit_build_blob: bool,
    pub quote_calls: AtomicUsize,
    pub build_calls: AtomicUsize,
    pub reconnects: AtomicUsize,
    pub last_build_params: Mutex<Option<BuildSwapParams>>,
}

#[async_trait]
impl SwapBackend for MockBackend {
    async fn fetch_quote(&self, _params: QuoteParams) -> Result<QuoteResultData, ChannelError> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.quote_errors.lock().unwrap().pop_front() {
            return Err(error);
        }

        if self.omit_route_blob {
            Ok(quote_result_without_route_blob())
        } else {
            Ok(quote_result())
        }
    }

    async fn build_swap_tx(
        &self,
        params: BuildSwapParams,
    ) -> Result<BuildSwapTxResultData, ChannelError> {
        self.build_calls.fetch_add(1, Ordering::SeqCst);

        let user = Pubkey::from_str(&params.user_pubkey).expect("pubkey in build params");
        *self.last_build_params.lock().unwrap() = Some(params);

        if self.omit_build_blob {
            return Ok(BuildSwapTxResultData {
                transaction_base64: None,
                swap_transaction: None,
                recent_blockhash: None,
                last_valid_block_height: None,
            });
        }

        Ok(BuildSwapTxResultData {
            transaction_base64: Some(unsigned_transaction_base64(&user)),
            swap_transaction: None,
            recent_blockhash: None,
            last_valid_block_height: Some(250_000_000),
        })
    }

    async fn reconnect(&self) -> Result<(), ChannelError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Captures submitted transactions and hands out fresh signatures.
#[derive(Default)]
pub struct MockSubmitter {
    pub submissions: AtomicUsize,
    pub last_transaction: Mutex<Option<VersionedTransaction>>,
}

#[async_trait]
impl TxSubmitter for MockSubmitter {
    async fn submit(&self, transaction: &VersionedTransaction) -> Result<Signature, PipelineError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        *self.last_transaction.lock().unwrap() = Some(transaction.clone());
        Ok(Signature::new_unique())
    }

    async fn latest_blockhash(&self) -> Result<Hash, PipelineError> {
        Ok(Hash::new_unique())
    }
}

/// Status source whose native tier always misses and whose polls pop a
/// scripted queue, repeating the final entry.
pub struct PollingSource {
    polls: Mutex<VecDeque<Option<TransactionStatus>>>,
}

impl PollingSource {
    pub fn new(polls: Vec<Option<TransactionStatus>>) -> Self {
        Self {
            polls: Mutex::new(polls.into()),
        }
    }

    pub fn eventually_confirmed() -> Self {
        Self::new(vec![None, Some(pending_status()), Some(confirmed_status())])
    }
}

#[async_trait]
impl StatusSource for PollingSource {
    async fn confirm_native(&self, _signature: &Signature) -> Result<bool, String> {
        Err("native confirmation unavailable".to_string())
    }

    async fn signature_status(
        &self,
        _signature: &Signature,
    ) -> Result<Option<TransactionStatus>, String> {
        let mut polls = self.polls.lock().unwrap();
        if polls.len() > 1 {
            Ok(polls.pop_front().unwrap())
        } else {
            Ok(polls.front().cloned().unwrap_or(None))
        }
    }
}

pub fn pending_status() -> TransactionStatus {
    TransactionStatus {
        slot: 250_000_100,
        confirmations: Some(0),
        status: Ok(()),
        err: None,
        confirmation_status: Some(TransactionConfirmationStatus::Processed),
    }
}

pub fn confirmed_status() -> TransactionStatus {
    TransactionStatus {
        slot: 250_000_101,
        confirmations: Some(16),
        status: Ok(()),
        err: None,
        confirmation_status: Some(TransactionConfirmationStatus::Confirmed),
    }
}

/// Wallet wrapper that counts signing attempts.
pub struct CountingWallet<W> {
    pub inner: W,
    pub signing_attempts: AtomicUsize,
}

impl<W> CountingWallet<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            signing_attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl<W: WalletSigner> WalletSigner for CountingWallet<W> {
    fn pubkey(&self) -> Pubkey {
        self.inner.pubkey()
    }

    async fn sign_transaction(
        &self,
        transaction: VersionedTransaction,
    ) -> Result<VersionedTransaction, PipelineError> {
        self.signing_attempts.fetch_add(1, Ordering::SeqCst);
        self.inner.sign_transaction(transaction).await
    }
}
