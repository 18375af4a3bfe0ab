//! Cryptographic primitives: SHA-256 / RIPEMD-160 hashing, secp256k1 keys and
//! signatures, and Base58Check addresses.

pub mod hash;
pub mod keys;
pub mod signatures;

pub use hash::{Hash160, Hash256, Hashable};
pub use keys::{derive_address, is_valid_address, verify_signature, KeyPair, PrivateKey, PublicKey};
pub use signatures::Signature;
