use crate::crypto::hash::Hash256;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoinError>;
pub type ValidationResult<T> = std::result::Result<T, ValidationError>;

/// Consensus rule violations. Returned as values, never raised as panics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Malformed transaction: {0}")]
    MalformedTransaction(String),

    #[error("Unknown input {txid}:{vout}")]
    UnknownInput { txid: Hash256, vout: u32 },

    #[error("Invalid signature on input {0}")]
    InvalidSignature(usize),

    #[error("Overspend: outputs {outputs} exceed inputs {inputs}")]
    Overspend { inputs: u64, outputs: u64 },

    #[error("Output {txid}:{vout} spent twice within block")]
    DoubleSpendWithinBlock { txid: Hash256, vout: u32 },

    #[error("Duplicate transaction {0} in block")]
    DuplicateTransaction(Hash256),

    #[error("Transaction {0} is not final at this height")]
    NonFinalTransaction(Hash256),

    #[error("Coinbase output {txid}:{vout} spent before maturity")]
    ImmatureCoinbase { txid: Hash256, vout: u32 },

    #[error("Block does not link to parent: expected {expected}, got {actual}")]
    BrokenLink { expected: Hash256, actual: Hash256 },

    #[error("Unexpected block height: expected {expected}, got {actual}")]
    UnexpectedHeight { expected: u64, actual: u64 },

    #[error("Block hash {0} does not meet its target")]
    InsufficientWork(Hash256),

    #[error("Bad difficulty: expected {expected} bits, got {actual}")]
    BadDifficulty { expected: u32, actual: u32 },

    #[error("Bad timestamp: {0}")]
    BadTimestamp(String),

    #[error("Merkle root mismatch")]
    BadMerkleRoot,

    #[error("Block size {size} exceeds limit {limit}")]
    Oversized { size: usize, limit: usize },

    #[error("Block has no coinbase transaction")]
    MissingCoinbase,

    #[error("Coinbase transaction at position {0}")]
    ExtraCoinbase(usize),

    #[error("Bad coinbase value: expected {expected}, got {actual}")]
    BadCoinbaseValue { expected: u64, actual: u64 },

    #[error("Already known: {0}")]
    AlreadyKnown(Hash256),

    #[error("Chain of height {offered} is not longer than local height {local}")]
    NotLonger { local: u64, offered: u64 },

    #[error("Chain does not connect to the active chain at {0}")]
    UnknownAncestor(Hash256),
}

#[derive(Error, Debug)]
pub enum CoinError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Peer {0} unreachable")]
    PeerUnreachable(String),

    #[error("Peer {peer} gave invalid chain: {reason}")]
    PeerGaveInvalidChain { peer: String, reason: ValidationError },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Mining error: {0}")]
    Mining(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoinError {
    /// Storage failures leave the node unable to make progress durably.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoinError::Storage(_) | CoinError::Database(_))
    }

    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            CoinError::Validation(e) => Some(e),
            CoinError::PeerGaveInvalidChain { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CoinError {
    fn from(err: serde_json::Error) -> Self {
        CoinError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for CoinError {
    fn from(err: bincode::Error) -> Self {
        CoinError::Serialization(err.to_string())
    }
}
