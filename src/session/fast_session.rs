use chrono::{DateTime, Utc};
use log::{info, warn};
use solana_sdk::{
    hash::Hash,
    instruction::Instruction,
    message::{Message, VersionedMessage},
    pubkey::Pubkey,
    signature::{Keypair, Signature},
    signer::Signer,
    system_instruction,
    transaction::{Transaction, VersionedTransaction},
};
use spl_associated_token_account::get_associated_token_address;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::entity::{ConfirmOutcome, SessionError};
use crate::pipeline::confirm::{confirm_with_fallback, ConfirmTiming, StatusSource};
use crate::pipeline::executor::{TxSubmitter, WalletSigner};

/// Soft session lifetime. After this the client stops using the session;
/// the on-chain delegation persists until an explicit revoke lands.
pub const SESSION_SOFT_TTL_SECS: i64 = 30 * 60;

/// Interval of the client-side expiry check.
pub const EXPIRY_TICK_MS: u64 = 500;

/// Observable lifecycle of the fast session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Inactive,
    /// Waiting on the wallet to approve the arm transaction. External,
    /// human-in-the-loop, unbounded latency.
    AwaitingApproval,
    /// Arm transaction submitted, awaiting confirmation.
    Arming,
    Active,
    /// Client-side expiry. No automatic on-chain revoke is attempted;
    /// funds remain at risk under the original cap until an explicit
    /// revoke lands.
    SoftExpired,
    Revoking,
}

/// Snapshot of the session for the UI.
#[derive(Debug, Clone, Copy)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub owner: Option<Pubkey>,
    pub delegate: Option<Pubkey>,
    pub cap_lamports: Option<u64>,
    pub armed_at_ms: Option<i64>,
    pub expires_at_ms: Option<i64>,
}

struct ArmedSession {
    /// Owned exclusively by this process; never transmitted.
    keypair: Keypair,
    owner: Pubkey,
    cap_lamports: u64,
    armed_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Arms and revokes the capped, time-limited delegate signing session
/// that lets automated buys skip per-transaction wallet prompts.
pub struct DelegatedFastSession {
    submitter: Arc<dyn TxSubmitter>,
    status_source: Arc<dyn StatusSource>,
    confirm_timeout: Duration,
    confirm_timing: ConfirmTiming,
    ttl: chrono::Duration,
    inner: Arc<Mutex<Option<ArmedSession>>>,
    phase_tx: Arc<watch::Sender<SessionPhase>>,
    expiry_task: Mutex<Option<JoinHandle<()>>>,
}

impl DelegatedFastSession {
    pub fn new(submitter: Arc<dyn TxSubmitter>, status_source: Arc<dyn StatusSource>) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::Inactive);
        Self {
            submitter,
            status_source,
            confirm_timeout: Duration::from_millis(
                crate::pipeline::confirm::DEFAULT_CONFIRM_TIMEOUT_MS,
            ),
            confirm_timing: ConfirmTiming::default(),
            ttl: chrono::Duration::seconds(SESSION_SOFT_TTL_SECS),
            inner: Arc::new(Mutex::new(None)),
            phase_tx: Arc::new(phase_tx),
            expiry_task: Mutex::new(None),
        }
    }

    /// Overrides the soft lifetime; used by tests.
    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Overrides confirmation timings; used by tests.
    pub fn with_confirm_timing(mut self, timing: ConfirmTiming) -> Self {
        self.confirm_timing = timing;
        self
    }

    pub fn is_active(&self) -> bool {
        *self.phase_tx.borrow() == SessionPhase::Active
            && self.inner.lock().unwrap().is_some()
    }

    pub fn phase_watch(&self) -> watch::Receiver<SessionPhase> {
        self.phase_tx.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        let phase = *self.phase_tx.borrow();
        let guard = self.inner.lock().unwrap();
        match guard.as_ref() {
            Some(session) => SessionStatus {
                phase,
                owner: Some(session.owner),
                delegate: Some(session.keypair.pubkey()),
                cap_lamports: Some(session.cap_lamports),
                armed_at_ms: Some(session.armed_at.timestamp_millis()),
                expires_at_ms: Some(session.expires_at.timestamp_millis()),
            },
            None => SessionStatus {
                phase,
                owner: None,
                delegate: None,
                cap_lamports: None,
                armed_at_ms: None,
                expires_at_ms: None,
            },
        }
    }

    /// Arms a new session: one wallet-signed transaction granting the
    /// fresh ephemeral key delegate authority over `cap_lamports` of the
    /// owner's wrapped-SOL account and topping up its fee balance. Marks
    /// the session armed only after on-chain confirmation.
    pub async fn arm(
        &self,
        wallet: &dyn WalletSigner,
        cap_lamports: u64,
        fee_topup_lamports: u64,
    ) -> Result<Signature, SessionError> {
        if self.is_active() {
            return Err(SessionError::AlreadyActive);
        }

        let result = self.arm_inner(wallet, cap_lamports, fee_topup_lamports).await;
        if result.is_err() {
            self.set_phase(SessionPhase::Inactive);
        }
        result
    }

    async fn arm_inner(
        &self,
        wallet: &dyn WalletSigner,
        cap_lamports: u64,
        fee_topup_lamports: u64,
    ) -> Result<Signature, SessionError> {
        self.set_phase(SessionPhase::AwaitingApproval);

        let owner = wallet.pubkey();
        let ephemeral = Keypair::new();
        let delegate = ephemeral.pubkey();
        let owner_wsol = get_associated_token_address(&owner, &spl_token::native_mint::id());

        let approve = spl_token::instruction::approve(
            &spl_token::ID,
            &owner_wsol,
            &delegate,
            &owner,
            &[],
            cap_lamports,
        )
        .map_err(|e| SessionError::ArmFailed(format!("approve instruction: {}", e)))?;
        let fee_topup = system_instruction::transfer(&owner, &delegate, fee_topup_lamports);

        let blockhash = self.submitter.latest_blockhash().await?;
        let message =
            Message::new_with_blockhash(&[approve, fee_topup], Some(&owner), &blockhash);
        let unsigned = VersionedTransaction {
            signatures: vec![
                Signature::default();
                message.header.num_required_signatures as usize
            ],
            message: VersionedMessage::Legacy(message),
        };

        // Wallet approval is external and unbounded; the AwaitingApproval
        // phase stays visible for as long as the user deliberates.
        let signed = wallet
            .sign_transaction(unsigned)
            .await
            .map_err(|e| SessionError::WalletSigning(e.to_string()))?;

        self.set_phase(SessionPhase::Arming);
        let signature = self.submitter.submit(&signed).await?;

        let outcome = confirm_with_fallback(
            self.status_source.as_ref(),
            &signature,
            self.confirm_timeout,
            self.confirm_timing,
        )
        .await;

        match outcome {
            ConfirmOutcome::Confirmed { .. } => {
                let now = Utc::now();
                *self.inner.lock().unwrap() = Some(ArmedSession {
                    keypair: ephemeral,
                    owner,
                    cap_lamports,
                    armed_at: now,
                    expires_at: now + self.ttl,
                });
                self.set_phase(SessionPhase::Active);
                self.spawn_expiry_watch();
                info!(
                    "fast session armed: delegate {} capped at {} SOL",
                    delegate,
                    crate::solana::lamports_to_sol(cap_lamports)
                );
                Ok(signature)
            }
            other => Err(SessionError::ArmFailed(describe_outcome(&other))),
        }
    }

    /// Revokes the delegate authority on chain. Local session state is
    /// cleared on every outcome, success or failure: stopping *use* of
    /// the delegate is local, while the authoritative on-chain state is
    /// whatever the revoke transaction achieved.
    pub async fn revoke(&self, wallet: &dyn WalletSigner) -> Result<Signature, SessionError> {
        self.set_phase(SessionPhase::Revoking);
        let result = self.revoke_inner(wallet).await;
        self.clear_local();
        result
    }

    async fn revoke_inner(&self, wallet: &dyn WalletSigner) -> Result<Signature, SessionError> {
        let owner = wallet.pubkey();
        let owner_wsol = get_associated_token_address(&owner, &spl_token::native_mint::id());

        let revoke = spl_token::instruction::revoke(&spl_token::ID, &owner_wsol, &owner, &[])
            .map_err(|e| SessionError::RevokeFailed(format!("revoke instruction: {}", e)))?;

        let blockhash = self.submitter.latest_blockhash().await?;
        let message = Message::new_with_blockhash(&[revoke], Some(&owner), &blockhash);
        let unsigned = VersionedTransaction {
            signatures: vec![
                Signature::default();
                message.header.num_required_signatures as usize
            ],
            message: VersionedMessage::Legacy(message),
        };

        let signed = wallet
            .sign_transaction(unsigned)
            .await
            .map_err(|e| SessionError::WalletSigning(e.to_string()))?;

        let signature = self.submitter.submit(&signed).await?;

        let outcome = confirm_with_fallback(
            self.status_source.as_ref(),
            &signature,
            self.confirm_timeout,
            self.confirm_timing,
        )
        .await;

        match outcome {
            ConfirmOutcome::Confirmed { .. } => {
                info!("fast session delegate revoked on chain");
                Ok(signature)
            }
            other => Err(SessionError::RevokeFailed(describe_outcome(&other))),
        }
    }

    /// Signs a delegated transaction with the ephemeral key as fee payer
    /// and sole signer. The keypair never leaves this module.
    pub fn sign_delegate_transaction(
        &self,
        instructions: &[Instruction],
        blockhash: Hash,
    ) -> Result<Transaction, SessionError> {
        let guard = self.inner.lock().unwrap();
        let session = guard.as_ref().ok_or(SessionError::NotActive)?;

        if Utc::now() >= session.expires_at {
            return Err(SessionError::NotActive);
        }

        Ok(Transaction::new_signed_with_payer(
            instructions,
            Some(&session.keypair.pubkey()),
            &[&session.keypair],
            blockhash,
        ))
    }

    fn set_phase(&self, phase: SessionPhase) {
        let _ = self.phase_tx.send(phase);
    }

    fn clear_local(&self) {
        *self.inner.lock().unwrap() = None;
        if let Some(handle) = self.expiry_task.lock().unwrap().take() {
            handle.abort();
        }
        self.set_phase(SessionPhase::Inactive);
    }

    fn spawn_expiry_watch(&self) {
        let inner = Arc::clone(&self.inner);
        let phase_tx = Arc::clone(&self.phase_tx);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(EXPIRY_TICK_MS));
            loop {
                ticker.tick().await;

                let expired = {
                    let mut guard = inner.lock().unwrap();
                    match guard.as_ref() {
                        Some(session) if Utc::now() >= session.expires_at => {
                            *guard = None;
                            true
                        }
                        Some(_) => continue,
                        None => break,
                    }
                };

                if expired {
                    // Soft expiry only. The delegation itself stays live
                    // on chain until an explicit revoke transaction lands.
                    warn!("fast session soft-expired; delegate authority persists until revoked");
                    let _ = phase_tx.send(SessionPhase::SoftExpired);
                    break;
                }
            }
        });

        *self.expiry_task.lock().unwrap() = Some(handle);
    }
}

fn describe_outcome(outcome: &ConfirmOutcome) -> String {
    match outcome {
        ConfirmOutcome::Confirmed { .. } => "confirmed".to_string(),
        ConfirmOutcome::Failed { error } => format!("failed on chain: {}", error),
        ConfirmOutcome::Timeout => "confirmation timed out; check the signature".to_string(),
        ConfirmOutcome::NotFound => "transaction never observed; likely dropped".to_string(),
    }
}
