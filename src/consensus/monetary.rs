use crate::consensus::params::ConsensusParams;
use serde::{Deserialize, Serialize};

/// Halving subsidy schedule. Supply is a pure function of height.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonetaryPolicy {
    pub initial_subsidy: u64,
    pub halving_interval: u64,
}

impl MonetaryPolicy {
    pub fn new(params: &ConsensusParams) -> Self {
        Self {
            initial_subsidy: params.initial_subsidy,
            halving_interval: params.halving_interval.max(1),
        }
    }

    /// Newly minted value allowed in the coinbase at `height`.
    pub fn subsidy(&self, height: u64) -> u64 {
        let halvings = height / self.halving_interval;
        if halvings >= 64 {
            return 0;
        }
        self.initial_subsidy >> halvings
    }

    /// Sum of subsidies of blocks `0..=height`, genesis included.
    pub fn total_supply_at_height(&self, height: u64) -> u64 {
        let mut total = 0u64;
        let mut start = 0u64;

        while start <= height {
            let subsidy = self.subsidy(start);
            if subsidy == 0 {
                break;
            }
            let epoch_end = (start / self.halving_interval + 1) * self.halving_interval - 1;
            let end = epoch_end.min(height);
            total = total.saturating_add(subsidy.saturating_mul(end - start + 1));
            start = end + 1;
        }

        total
    }

    /// The coinbase must claim exactly the subsidy plus the block's fees.
    pub fn expected_coinbase_value(&self, height: u64, fees: u64) -> Option<u64> {
        self.subsidy(height).checked_add(fees)
    }
}
