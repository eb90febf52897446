use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use solana_sdk::{
    pubkey::Pubkey,
    signature::Keypair,
    signer::Signer,
};
use std::sync::Arc;

use crate::channel::messages::{AuthPayload, HelloAuth};
use crate::entity::ChannelError;

/// Signs a server-issued challenge with the wallet's key. The key itself
/// never crosses this trait boundary; implementations hand back only the
/// detached signature.
#[async_trait]
pub trait ChallengeSigner: Send + Sync {
    fn wallet_pubkey(&self) -> Pubkey;

    async fn sign_challenge(&self, challenge: &str) -> Result<Vec<u8>, ChannelError>;
}

/// In-process signer over a locally held keypair. Used by tooling and
/// tests; a browser deployment would put the wallet adapter behind the
/// same trait.
pub struct LocalChallengeSigner {
    keypair: Keypair,
}

impl LocalChallengeSigner {
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
impl ChallengeSigner for LocalChallengeSigner {
    fn wallet_pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    async fn sign_challenge(&self, challenge: &str) -> Result<Vec<u8>, ChannelError> {
        let signature = self.keypair.sign_message(challenge.as_bytes());
        Ok(signature.as_ref().to_vec())
    }
}

/// One of the three authentication modes the backend accepts.
#[derive(Clone)]
pub enum AuthCredentials {
    /// Shared-secret key.
    ApiKey(String),
    /// Pre-minted bearer token.
    BearerToken(String),
    /// Wallet-signature challenge/response.
    WalletSignature(Arc<dyn ChallengeSigner>),
}

impl AuthCredentials {
    /// Builds the auth reply for a server hello. Wallet-signature mode
    /// requires the hello to carry a challenge.
    pub(crate) async fn build_reply(
        &self,
        hello_auth: &Option<HelloAuth>,
    ) -> Result<AuthPayload, ChannelError> {
        match self {
            AuthCredentials::ApiKey(key) => Ok(AuthPayload {
                api_key: Some(key.clone()),
                ..AuthPayload::default()
            }),
            AuthCredentials::BearerToken(token) => Ok(AuthPayload {
                jwt: Some(token.clone()),
                ..AuthPayload::default()
            }),
            AuthCredentials::WalletSignature(signer) => {
                let challenge = hello_auth
                    .as_ref()
                    .and_then(|auth| auth.wallet_sig.as_ref())
                    .map(|sig| sig.challenge.as_str())
                    .ok_or_else(|| {
                        ChannelError::Auth(
                            "server offered no wallet-signature challenge".to_string(),
                        )
                    })?;

                let signature = signer.sign_challenge(challenge).await?;

                Ok(AuthPayload {
                    wallet: Some(signer.wallet_pubkey().to_string()),
                    signature_base64: Some(STANDARD.encode(signature)),
                    ..AuthPayload::default()
                })
            }
        }
    }
}
