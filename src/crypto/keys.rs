use crate::crypto::hash::{Hash160, Hash256};
use crate::crypto::signatures::Signature;
use crate::{CoinError, Result};
use rand::{rngs::OsRng, RngCore};
use secp256k1::{Message, PublicKey as Secp256k1PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const ADDRESS_PREFIX: &str = "mc";
const ADDRESS_VERSION: u8 = 0x00;

#[derive(Clone)]
pub struct PrivateKey {
    key: SecretKey,
}

/// Compressed secp256k1 public key as carried in transaction inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    key: Vec<u8>,
}

#[derive(Clone)]
pub struct KeyPair {
    pub private_key: PrivateKey,
    pub public_key: PublicKey,
}

impl PrivateKey {
    pub fn new() -> Result<Self> {
        let mut secret_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut secret_bytes);
        Self::from_bytes(&secret_bytes)
    }

    /// Deterministic key derived from a seed phrase. Used for well-known
    /// keys such as the genesis recipient and for reproducible test fixtures.
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        Self::from_bytes(Hash256::hash(seed).as_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key = SecretKey::from_slice(bytes)
            .map_err(|e| CoinError::Crypto(format!("Invalid private key: {}", e)))?;
        Ok(Self { key })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.secret_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        let secp = Secp256k1::signing_only();
        let public_key = Secp256k1PublicKey::from_secret_key(&secp, &self.key);
        PublicKey {
            key: public_key.serialize().to_vec(),
        }
    }

    pub fn sign(&self, message: &Hash256) -> Result<Signature> {
        let secp = Secp256k1::signing_only();
        let message = Message::from_digest_slice(message.as_bytes())
            .map_err(|e| CoinError::Crypto(format!("Invalid message: {}", e)))?;

        let signature = secp.sign_ecdsa(&message, &self.key);
        Ok(Signature::from_secp256k1(signature))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey(..)")
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 33 {
            return Err(CoinError::Crypto("Public key must be 33 bytes".to_string()));
        }
        Secp256k1PublicKey::from_slice(bytes)
            .map_err(|e| CoinError::Crypto(format!("Invalid public key: {}", e)))?;

        Ok(Self {
            key: bytes.to_vec(),
        })
    }

    pub fn to_bytes(&self) -> &[u8] {
        &self.key
    }

    pub fn hash160(&self) -> Hash160 {
        Hash160::hash_sha256(&self.key)
    }

    pub fn to_address(&self) -> String {
        derive_address(self)
    }

    /// Returns false for malformed keys or signatures as well as for a
    /// well-formed signature that does not match.
    pub fn verify(&self, message: &Hash256, signature: &Signature) -> bool {
        verify_signature(self, message, signature)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.key))
    }
}

impl KeyPair {
    pub fn new() -> Result<Self> {
        Ok(Self::from_private_key(PrivateKey::new()?))
    }

    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        Ok(Self::from_private_key(PrivateKey::from_seed(seed)?))
    }

    pub fn from_private_key(private_key: PrivateKey) -> Self {
        let public_key = private_key.public_key();
        Self {
            private_key,
            public_key,
        }
    }

    pub fn address(&self) -> String {
        self.public_key.to_address()
    }

    pub fn sign(&self, message: &Hash256) -> Result<Signature> {
        self.private_key.sign(message)
    }
}

/// `mc` followed by Base58Check(version ‖ hash160(pubkey) ‖ checksum).
pub fn derive_address(public_key: &PublicKey) -> String {
    let mut data = Vec::with_capacity(25);
    data.push(ADDRESS_VERSION);
    data.extend_from_slice(public_key.hash160().as_bytes());

    let checksum = Hash256::double_hash(&data);
    data.extend_from_slice(&checksum.as_bytes()[0..4]);

    format!("{}{}", ADDRESS_PREFIX, bs58::encode(data).into_string())
}

pub fn verify_signature(public_key: &PublicKey, message: &Hash256, signature: &Signature) -> bool {
    let secp = Secp256k1::verification_only();

    let Ok(key) = Secp256k1PublicKey::from_slice(public_key.to_bytes()) else {
        return false;
    };
    let Ok(message) = Message::from_digest_slice(message.as_bytes()) else {
        return false;
    };
    let Ok(signature) = signature.to_secp256k1() else {
        return false;
    };

    secp.verify_ecdsa(&message, &signature, &key).is_ok()
}

pub fn address_to_hash160(address: &str) -> Result<Hash160> {
    let encoded = address
        .strip_prefix(ADDRESS_PREFIX)
        .ok_or_else(|| CoinError::InvalidInput(format!("Address missing prefix: {}", address)))?;

    let decoded = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| CoinError::InvalidInput(format!("Invalid address encoding: {}", e)))?;

    if decoded.len() != 25 || decoded[0] != ADDRESS_VERSION {
        return Err(CoinError::InvalidInput("Invalid address payload".to_string()));
    }

    let checksum = Hash256::double_hash(&decoded[0..21]);
    if checksum.as_bytes()[0..4] != decoded[21..25] {
        return Err(CoinError::InvalidInput("Invalid address checksum".to_string()));
    }

    let mut hash = [0u8; 20];
    hash.copy_from_slice(&decoded[1..21]);
    Ok(Hash160::new(hash))
}

pub fn is_valid_address(address: &str) -> bool {
    address_to_hash160(address).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() -> Result<()> {
        let keypair = KeyPair::new()?;
        let message = Hash256::hash(b"spend");
        let signature = keypair.sign(&message)?;

        assert!(keypair.public_key.verify(&message, &signature));
        assert!(!keypair.public_key.verify(&Hash256::hash(b"other"), &signature));

        let other = KeyPair::new()?;
        assert!(!other.public_key.verify(&message, &signature));
        Ok(())
    }

    #[test]
    fn test_address_roundtrip() -> Result<()> {
        let keypair = KeyPair::from_seed(b"alice")?;
        let address = keypair.address();

        assert!(address.starts_with(ADDRESS_PREFIX));
        assert!(is_valid_address(&address));
        assert_eq!(address_to_hash160(&address)?, keypair.public_key.hash160());
        Ok(())
    }

    #[test]
    fn test_seeded_keys_are_deterministic() -> Result<()> {
        let a = KeyPair::from_seed(b"genesis")?;
        let b = KeyPair::from_seed(b"genesis")?;
        assert_eq!(a.address(), b.address());
        assert_ne!(a.address(), KeyPair::from_seed(b"other")?.address());
        Ok(())
    }

    #[test]
    fn test_invalid_addresses() -> Result<()> {
        let address = KeyPair::from_seed(b"bob")?.address();

        let mut corrupted = address.clone();
        let last = corrupted.pop().unwrap();
        corrupted.push(if last == '1' { '2' } else { '1' });

        assert!(!is_valid_address(&corrupted));
        assert!(!is_valid_address(&address[2..]));
        assert!(!is_valid_address("mc"));
        assert!(!is_valid_address(""));
        Ok(())
    }

    #[test]
    fn test_rejects_malformed_public_key() {
        assert!(PublicKey::from_bytes(&[2u8; 32]).is_err());
        assert!(PublicKey::from_bytes(&[9u8; 33]).is_err());
    }
}
