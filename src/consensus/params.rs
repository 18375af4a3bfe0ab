use serde::{Deserialize, Serialize};

/// Seed of the well-known key that receives the genesis subsidy.
pub const GENESIS_SEED: &[u8] = b"minicoin genesis";

/// Chain-wide rules every node must agree on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Leading zero bits required at genesis. The target is `2^(256 - bits) - 1`.
    pub initial_target_bits: u32,
    pub min_target_bits: u32,
    pub max_target_bits: u32,
    pub target_block_time: u64, // seconds
    pub adjustment_interval: u64, // blocks
    pub initial_subsidy: u64,
    pub halving_interval: u64, // blocks
    pub coinbase_maturity: u64,
    pub max_block_size: usize, // bytes
    pub max_future_drift: u64, // seconds
    pub median_time_span: usize,
    pub genesis_timestamp: u64,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            initial_target_bits: 16,
            min_target_bits: 8,
            max_target_bits: 64,
            target_block_time: 30,
            adjustment_interval: 10,
            initial_subsidy: 50_0000_0000,
            halving_interval: 210_000,
            coinbase_maturity: 100,
            max_block_size: 1024 * 1024,
            max_future_drift: 2 * 60 * 60,
            median_time_span: 11,
            genesis_timestamp: 1_735_689_600, // 2025-01-01T00:00:00Z
        }
    }
}

impl ConsensusParams {
    /// Trivial work and immediate coinbase maturity for local networks and tests.
    pub fn regtest() -> Self {
        Self {
            initial_target_bits: 4,
            min_target_bits: 1,
            max_target_bits: 8,
            target_block_time: 1,
            adjustment_interval: 1_000_000,
            halving_interval: 150,
            coinbase_maturity: 0,
            ..Self::default()
        }
    }
}
