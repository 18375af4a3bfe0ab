//! Proof-of-work search and difficulty retargeting

pub mod difficulty;
pub mod miner;

pub use difficulty::{hash_meets_target, target_from_bits, DifficultyCalculator};
pub use miner::{BlockTemplate, Miner, MinerConfig, MiningStats, SearchOutcome};
