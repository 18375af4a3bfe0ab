//! minicoin - a minimal proof-of-work cryptocurrency node
//!
//! This library implements:
//! - UTXO-based transactions signed with secp256k1
//! - SHA-256 proof-of-work mining with integer difficulty retargeting
//! - Longest-chain fork choice with atomic reorganization
//! - Peer synchronization over a framed TCP protocol
//! - sled-backed persistence and a node CLI

pub mod cli;
pub mod config;
pub mod consensus;
pub mod core;
pub mod crypto;
pub mod error;
pub mod mining;
pub mod network;
pub mod node;
pub mod storage;

pub use error::{CoinError, Result, ValidationError};
