use anyhow::{anyhow, Result};
use solana_sdk::{pubkey::Pubkey, signature::Keypair};
use std::str::FromStr;

/// Serialize Keypair (64 bytes) to base58.
pub fn keypair_to_base58(keypair: &Keypair) -> Result<String> {
    let keypair_bytes = keypair.to_bytes();
    Ok(bs58::encode(keypair_bytes).into_string())
}

/// Restore Keypair from base58 string (64 bytes).
pub fn keypair_from_base58(keypair_base58: &str) -> Result<Keypair> {
    let keypair_bytes = bs58::decode(keypair_base58)
        .into_vec()
        .map_err(|e| anyhow!("Failed to decode base58 keypair: {}", e))?;

    if keypair_bytes.len() != 64 {
        return Err(anyhow!("Invalid keypair length: {}", keypair_bytes.len()));
    }

    let keypair = Keypair::from_bytes(&keypair_bytes)
        .map_err(|e| anyhow!("Failed to create keypair from bytes: {}", e))?;

    Ok(keypair)
}

/// Convert base58 string to Solana `Pubkey`.
pub fn parse_pubkey(address: &str) -> Result<Pubkey> {
    Pubkey::from_str(address).map_err(|e| anyhow!("Invalid Solana address: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_round_trips_through_base58() {
        let keypair = Keypair::new();
        let encoded = keypair_to_base58(&keypair).unwrap();
        let restored = keypair_from_base58(&encoded).unwrap();
        assert_eq!(keypair.to_bytes(), restored.to_bytes());
    }

    #[test]
    fn rejects_short_keypair() {
        let encoded = bs58::encode([0u8; 12]).into_string();
        assert!(keypair_from_base58(&encoded).is_err());
    }
}
