use async_trait::async_trait;
use log::{debug, info, warn};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{commitment_config::CommitmentConfig, signature::Signature};
use solana_transaction_status::{TransactionConfirmationStatus, TransactionStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::entity::{ConfirmOutcome, ConfirmationState};

/// Leash on the RPC's native confirmation wait before falling back to
/// history polling.
pub const NATIVE_CONFIRM_LEASH_MS: u64 = 8_000;

/// Interval between fallback status polls.
pub const POLL_INTERVAL_MS: u64 = 1_200;

/// Default overall confirmation deadline.
pub const DEFAULT_CONFIRM_TIMEOUT_MS: u64 = 60_000;

/// Tunable timings so tests can run the same state machine in
/// milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmTiming {
    pub native_leash: Duration,
    pub poll_interval: Duration,
}

impl Default for ConfirmTiming {
    fn default() -> Self {
        Self {
            native_leash: Duration::from_millis(NATIVE_CONFIRM_LEASH_MS),
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
        }
    }
}

/// Source of signature confirmation data. `RpcClient` is the production
/// implementation; tests script their own.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// The RPC's native confirmation wait. The caller leashes it.
    async fn confirm_native(&self, signature: &Signature) -> Result<bool, String>;

    /// One status poll with transaction-history search enabled.
    async fn signature_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<TransactionStatus>, String>;
}

#[async_trait]
impl StatusSource for RpcClient {
    async fn confirm_native(&self, signature: &Signature) -> Result<bool, String> {
        self.confirm_transaction_with_commitment(signature, CommitmentConfig::confirmed())
            .await
            .map(|response| response.value)
            .map_err(|e| e.to_string())
    }

    async fn signature_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<TransactionStatus>, String> {
        let response = self
            .get_signature_statuses_with_history(&[*signature])
            .await
            .map_err(|e| e.to_string())?;
        Ok(response.value.into_iter().next().flatten())
    }
}

/// Confirms a submitted signature with the two-tier strategy: a leashed
/// native confirmation wait, then history polling until `overall_timeout`.
///
/// The three non-success terminal outcomes stay distinct: an on-chain
/// error is `Failed`, a signature observed but never confirmed is
/// `Timeout`, and one never observed at all is `NotFound`.
pub async fn confirm_with_fallback(
    source: &dyn StatusSource,
    signature: &Signature,
    overall_timeout: Duration,
    timing: ConfirmTiming,
) -> ConfirmOutcome {
    let deadline = tokio::time::Instant::now() + overall_timeout;

    match tokio::time::timeout(timing.native_leash, source.confirm_native(signature)).await {
        Ok(Ok(true)) => return ConfirmOutcome::Confirmed { slot: None },
        Ok(Ok(false)) => debug!("native confirm returned unconfirmed for {}", signature),
        Ok(Err(e)) => debug!("native confirm failed for {}: {}", signature, e),
        Err(_) => debug!("native confirm leash expired for {}", signature),
    }

    let mut seen = false;

    while tokio::time::Instant::now() < deadline {
        match source.signature_status(signature).await {
            Ok(Some(status)) => {
                if let Some(err) = &status.err {
                    return ConfirmOutcome::Failed {
                        error: err.to_string(),
                    };
                }

                seen = true;
                if matches!(
                    status.confirmation_status,
                    Some(TransactionConfirmationStatus::Confirmed)
                        | Some(TransactionConfirmationStatus::Finalized)
                ) {
                    return ConfirmOutcome::Confirmed {
                        slot: Some(status.slot),
                    };
                }
            }
            Ok(None) => {}
            // Best-effort diagnostic; a flaky poll must not decide the
            // outcome.
            Err(e) => debug!("status poll failed for {}: {}", signature, e),
        }

        tokio::time::sleep(timing.poll_interval).await;
    }

    if seen {
        ConfirmOutcome::Timeout
    } else {
        ConfirmOutcome::NotFound
    }
}

/// Spawns the background confirmation task and hands back the watch
/// channel it publishes on. The foreground flow returns immediately; the
/// UI renders the watch states.
pub fn spawn_confirmation(
    source: Arc<dyn StatusSource>,
    signature: Signature,
    overall_timeout: Duration,
    timing: ConfirmTiming,
) -> watch::Receiver<ConfirmationState> {
    let (tx, rx) = watch::channel(ConfirmationState::Confirming);

    tokio::spawn(async move {
        let outcome = confirm_with_fallback(source.as_ref(), &signature, overall_timeout, timing).await;

        match &outcome {
            ConfirmOutcome::Confirmed { slot } => {
                info!("transaction {} confirmed (slot {:?})", signature, slot)
            }
            ConfirmOutcome::Failed { error } => {
                warn!("transaction {} failed on chain: {}", signature, error)
            }
            ConfirmOutcome::Timeout => {
                warn!("transaction {} unresolved: seen but not confirmed", signature)
            }
            ConfirmOutcome::NotFound => {
                warn!("transaction {} unresolved: never observed", signature)
            }
        }

        let _ = tx.send(ConfirmationState::Done(outcome));
    });

    rx
}
