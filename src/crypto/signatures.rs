use crate::{CoinError, Result};
use secp256k1::ecdsa::Signature as Secp256k1Signature;
use serde::{Deserialize, Serialize};

/// Compact secp256k1 ECDSA signature split into its two scalars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    r: [u8; 32],
    s: [u8; 32],
}

impl Signature {
    /// Placeholder used while the signable content of a transaction is built.
    pub fn empty() -> Self {
        Self { r: [0u8; 32], s: [0u8; 32] }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 64 {
            return Err(CoinError::Crypto("Invalid signature length".to_string()));
        }

        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[0..32]);
        s.copy_from_slice(&bytes[32..64]);

        Ok(Self { r, s })
    }

    pub fn to_compact(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..].copy_from_slice(&self.s);
        bytes
    }

    pub fn from_secp256k1(signature: Secp256k1Signature) -> Self {
        let compact = signature.serialize_compact();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&compact[0..32]);
        s.copy_from_slice(&compact[32..64]);
        Self { r, s }
    }

    pub fn to_secp256k1(&self) -> Result<Secp256k1Signature> {
        Secp256k1Signature::from_compact(&self.to_compact())
            .map_err(|e| CoinError::Crypto(format!("Invalid signature: {}", e)))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_compact())
    }
}
