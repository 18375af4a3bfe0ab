use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 digest. Ordering compares the bytes big-endian, so `a <= b` is the
/// 256-bit unsigned comparison used for proof-of-work targets.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash256([u8; 32]);

impl Hash256 {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn double_hash(data: &[u8]) -> Self {
        Self::hash(Self::hash(data).as_bytes())
    }

    /// Hash of the concatenation of two digests, used for merkle nodes.
    pub fn combine(left: &Hash256, right: &Hash256) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(left.0);
        hasher.update(right.0);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let array: [u8; 32] = slice.try_into().ok()?;
        Some(Self(array))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

pub trait Hashable {
    fn hash(&self) -> Hash256;
}

/// RIPEMD-160 over SHA-256, the payload of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash160([u8; 20]);

impl Hash160 {
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn hash_sha256(data: &[u8]) -> Self {
        let mut hasher = Ripemd160::new();
        hasher.update(Hash256::hash(data).as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
