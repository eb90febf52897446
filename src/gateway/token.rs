use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

/// Minted token lifetime, minus a safety skew so a token never outlives
/// its advertised expiry on a slow clock.
pub const TOKEN_TTL_SECS: i64 = 120;
pub const TOKEN_SKEW_SECS: i64 = 5;

/// Hard ceiling on any presented token's remaining lifetime. A token
/// claiming to live longer was not minted here.
pub const TOKEN_MAX_AGE_SECS: i64 = 600;

const TOKEN_VERSION: &str = "v1";

type HmacSha256 = Hmac<Sha256>;

/// A freshly minted session token and its expiry for the client.
#[derive(Debug, Clone)]
pub struct MintedToken {
    pub token: String,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,

    #[error("unsupported token version")]
    UnknownVersion,

    #[error("token expired")]
    Expired,

    #[error("token lifetime exceeds the maximum")]
    TooLongLived,

    #[error("token signature mismatch")]
    BadSignature,
}

/// Mints `v1.<expSec>.<nonce>.<sigBase64url>`, signed over
/// `"<expSec>.<nonce>.<clientIp>"`. Stateless: verification needs only
/// the secret, the token, and the presenting IP.
pub fn mint_session_token(secret: &[u8], client_ip: &str, now_ms: i64) -> MintedToken {
    let exp_sec = now_ms / 1000 + TOKEN_TTL_SECS - TOKEN_SKEW_SECS;
    let nonce = Uuid::new_v4().simple().to_string();
    let signature = sign_payload(secret, exp_sec, &nonce, client_ip);

    MintedToken {
        token: format!(
            "{}.{}.{}.{}",
            TOKEN_VERSION,
            exp_sec,
            nonce,
            URL_SAFE_NO_PAD.encode(signature)
        ),
        expires_at_ms: exp_sec * 1000,
    }
}

/// Verifies a presented token against the presenting IP. Signature
/// comparison is constant-time.
pub fn verify_session_token(
    secret: &[u8],
    token: &str,
    client_ip: &str,
    now_ms: i64,
) -> Result<(), TokenError> {
    let mut parts = token.split('.');
    let (version, exp, nonce, signature) = match (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) {
        (Some(version), Some(exp), Some(nonce), Some(signature), None) => {
            (version, exp, nonce, signature)
        }
        _ => return Err(TokenError::Malformed),
    };

    if version != TOKEN_VERSION {
        return Err(TokenError::UnknownVersion);
    }

    let exp_sec: i64 = exp.parse().map_err(|_| TokenError::Malformed)?;
    let now_sec = now_ms / 1000;
    if exp_sec <= now_sec {
        return Err(TokenError::Expired);
    }
    if exp_sec - now_sec > TOKEN_MAX_AGE_SECS {
        return Err(TokenError::TooLongLived);
    }

    let presented = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| TokenError::Malformed)?;

    let mut mac = hmac_for(secret);
    mac.update(payload(exp_sec, nonce, client_ip).as_bytes());
    mac.verify_slice(&presented)
        .map_err(|_| TokenError::BadSignature)
}

fn sign_payload(secret: &[u8], exp_sec: i64, nonce: &str, client_ip: &str) -> Vec<u8> {
    let mut mac = hmac_for(secret);
    mac.update(payload(exp_sec, nonce, client_ip).as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn payload(exp_sec: i64, nonce: &str, client_ip: &str) -> String {
    format!("{}.{}.{}", exp_sec, nonce, client_ip)
}

fn hmac_for(secret: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length.
    HmacSha256::new_from_slice(secret).expect("hmac key")
}
