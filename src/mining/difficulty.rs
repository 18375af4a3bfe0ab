use crate::consensus::params::ConsensusParams;
use crate::crypto::hash::Hash256;

/// Largest hash accepted for `bits` leading zero bits, i.e. `2^(256 - bits) - 1`.
pub fn target_from_bits(bits: u32) -> Hash256 {
    let mut target = [0xFFu8; 32];

    let zero_bytes = (bits / 8) as usize;
    let remaining_bits = bits % 8;

    for byte in target.iter_mut().take(zero_bytes.min(32)) {
        *byte = 0x00;
    }
    if zero_bytes < 32 && remaining_bits > 0 {
        target[zero_bytes] = 0xFF >> remaining_bits;
    }

    Hash256::new(target)
}

pub fn hash_meets_target(hash: &Hash256, bits: u32) -> bool {
    *hash <= target_from_bits(bits)
}

/// Integer retargeting in whole bits: at most two bits (factor 4) per period.
#[derive(Debug, Clone)]
pub struct DifficultyCalculator {
    pub target_block_time: u64, // seconds
    pub adjustment_interval: u64, // blocks
    pub min_bits: u32,
    pub max_bits: u32,
}

impl DifficultyCalculator {
    pub fn new(params: &ConsensusParams) -> Self {
        Self {
            target_block_time: params.target_block_time,
            adjustment_interval: params.adjustment_interval,
            min_bits: params.min_target_bits,
            max_bits: params.max_target_bits,
        }
    }

    pub fn should_adjust(&self, height: u64) -> bool {
        height > 0 && self.adjustment_interval > 0 && height % self.adjustment_interval == 0
    }

    /// First height of the timestamp window used when retargeting at `height`.
    /// Genesis is excluded because its timestamp is fixed.
    pub fn window_start(&self, height: u64) -> u64 {
        height.saturating_sub(self.adjustment_interval).max(1)
    }

    /// `timestamps` are the headers `window_start(height)..height` in chain order.
    pub fn next_target_bits(&self, parent_bits: u32, height: u64, timestamps: &[u64]) -> u32 {
        if !self.should_adjust(height) || timestamps.len() < 2 {
            return parent_bits;
        }

        let first = timestamps[0];
        let last = timestamps[timestamps.len() - 1];
        let actual = last.saturating_sub(first);
        let expected = self
            .target_block_time
            .saturating_mul(timestamps.len() as u64 - 1);

        let shift: i64 = if actual.saturating_mul(4) <= expected {
            2
        } else if actual.saturating_mul(2) <= expected {
            1
        } else if actual >= expected.saturating_mul(4) {
            -2
        } else if actual >= expected.saturating_mul(2) {
            -1
        } else {
            0
        };

        let next = (parent_bits as i64 + shift)
            .clamp(self.min_bits as i64, self.max_bits as i64) as u32;

        if next != parent_bits {
            log::debug!(
                "Difficulty adjustment at {}: {} -> {} bits (actual {}s, expected {}s)",
                height,
                parent_bits,
                next,
                actual,
                expected
            );
        }

        next
    }
}
