use crate::consensus::monetary::MonetaryPolicy;
use crate::consensus::params::ConsensusParams;
use crate::core::transaction::OutPoint;
use crate::core::{Block, Transaction, UtxoSet};
use crate::crypto::hash::{Hash256, Hashable};
use crate::crypto::keys::{derive_address, is_valid_address};
use crate::error::{ValidationError, ValidationResult};
use std::collections::HashSet;

/// What a candidate block is checked against: its parent and the state as of
/// the parent.
#[derive(Debug, Clone, Copy)]
pub struct ParentContext<'a> {
    pub hash: Hash256,
    pub height: u64,
    pub expected_bits: u32,
    pub median_time_past: u64,
    pub now: u64,
    pub utxos: &'a UtxoSet,
}

#[derive(Debug, Clone)]
pub struct BlockValidator {
    params: ConsensusParams,
    monetary: MonetaryPolicy,
}

impl BlockValidator {
    pub fn new(params: &ConsensusParams) -> Self {
        Self {
            params: params.clone(),
            monetary: MonetaryPolicy::new(params),
        }
    }

    pub fn monetary(&self) -> &MonetaryPolicy {
        &self.monetary
    }

    /// Checks a block against its parent and returns the fees it collects.
    /// Pure: the UTXO set in `parent` is only read.
    pub fn validate_block(&self, block: &Block, parent: &ParentContext<'_>) -> ValidationResult<u64> {
        let header = &block.header;
        log::debug!("Validating block at height {}", header.height);

        if header.height != parent.height + 1 {
            return Err(ValidationError::UnexpectedHeight {
                expected: parent.height + 1,
                actual: header.height,
            });
        }
        if header.previous_hash != parent.hash {
            return Err(ValidationError::BrokenLink {
                expected: parent.hash,
                actual: header.previous_hash,
            });
        }

        if !header.meets_target() {
            return Err(ValidationError::InsufficientWork(header.hash()));
        }
        if header.target_bits != parent.expected_bits {
            return Err(ValidationError::BadDifficulty {
                expected: parent.expected_bits,
                actual: header.target_bits,
            });
        }

        self.validate_timestamp(header.timestamp, parent)?;

        if header.merkle_root != Block::calculate_merkle_root(&block.transactions) {
            return Err(ValidationError::BadMerkleRoot);
        }
        let size = block.size();
        if size > self.params.max_block_size {
            return Err(ValidationError::Oversized {
                size,
                limit: self.params.max_block_size,
            });
        }

        let coinbase = self.validate_coinbase_structure(block)?;

        Self::check_unique_spends(block)?;

        let mut fees = 0u64;
        for tx in block.transactions.iter().skip(1) {
            if tx.lock_time > header.height {
                return Err(ValidationError::NonFinalTransaction(tx.id()));
            }
            let fee = self.validate_transaction(tx, parent.utxos, header.height)?;
            fees = fees
                .checked_add(fee)
                .ok_or_else(|| ValidationError::MalformedTransaction("fee total overflows".to_string()))?;
        }

        let expected = self
            .monetary
            .expected_coinbase_value(header.height, fees)
            .ok_or_else(|| ValidationError::MalformedTransaction("coinbase value overflows".to_string()))?;
        let actual = coinbase.outputs[0].value;
        if actual != expected {
            return Err(ValidationError::BadCoinbaseValue { expected, actual });
        }

        log::debug!("✅ Block {} validation successful", header.height);
        Ok(fees)
    }

    /// Checks a non-coinbase transaction against `utxos` for inclusion in a
    /// block at `spend_height` and returns its fee.
    pub fn validate_transaction(
        &self,
        tx: &Transaction,
        utxos: &UtxoSet,
        spend_height: u64,
    ) -> ValidationResult<u64> {
        Self::check_structure(tx)?;

        let mut resolved = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            let outpoint = input.previous_output;
            let entry = utxos.get(&outpoint).ok_or(ValidationError::UnknownInput {
                txid: outpoint.txid,
                vout: outpoint.vout,
            })?;
            resolved.push(entry);
        }

        for (input, entry) in tx.inputs.iter().zip(&resolved) {
            if entry.is_coinbase && spend_height < entry.height + self.params.coinbase_maturity {
                return Err(ValidationError::ImmatureCoinbase {
                    txid: input.previous_output.txid,
                    vout: input.previous_output.vout,
                });
            }
        }

        let sighash = tx.signature_hash();
        for (index, (input, entry)) in tx.inputs.iter().zip(&resolved).enumerate() {
            if derive_address(&input.public_key) != entry.address
                || !input.public_key.verify(&sighash, &input.signature)
            {
                return Err(ValidationError::InvalidSignature(index));
            }
        }

        let inputs = resolved
            .iter()
            .try_fold(0u64, |acc, entry| acc.checked_add(entry.value))
            .ok_or_else(|| ValidationError::MalformedTransaction("input total overflows".to_string()))?;
        let outputs = tx
            .total_output_value()
            .ok_or_else(|| ValidationError::MalformedTransaction("output total overflows".to_string()))?;

        if outputs > inputs {
            return Err(ValidationError::Overspend { inputs, outputs });
        }

        Ok(inputs - outputs)
    }

    /// Context-free shape checks for a spend.
    fn check_structure(tx: &Transaction) -> ValidationResult<()> {
        if tx.is_coinbase() {
            return Err(ValidationError::MalformedTransaction(
                "coinbase outside first block position".to_string(),
            ));
        }
        if tx.outputs.is_empty() {
            return Err(ValidationError::MalformedTransaction("no outputs".to_string()));
        }
        if let Some(output) = tx.outputs.iter().find(|o| !is_valid_address(&o.address)) {
            return Err(ValidationError::MalformedTransaction(format!(
                "invalid output address {}",
                output.address
            )));
        }
        if tx.total_output_value().is_none() {
            return Err(ValidationError::MalformedTransaction("output total overflows".to_string()));
        }

        let mut seen = HashSet::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            if !seen.insert(input.previous_output) {
                return Err(ValidationError::MalformedTransaction(format!(
                    "input {} referenced twice",
                    input.previous_output
                )));
            }
        }

        Ok(())
    }

    fn validate_timestamp(&self, timestamp: u64, parent: &ParentContext<'_>) -> ValidationResult<()> {
        if timestamp <= parent.median_time_past {
            return Err(ValidationError::BadTimestamp(format!(
                "{} not after median time past {}",
                timestamp, parent.median_time_past
            )));
        }
        if timestamp > parent.now.saturating_add(self.params.max_future_drift) {
            return Err(ValidationError::BadTimestamp(format!(
                "{} too far in the future",
                timestamp
            )));
        }
        Ok(())
    }

    fn validate_coinbase_structure<'b>(&self, block: &'b Block) -> ValidationResult<&'b Transaction> {
        let coinbase = block.coinbase().ok_or(ValidationError::MissingCoinbase)?;

        if let Some(position) = block
            .transactions
            .iter()
            .skip(1)
            .position(|tx| tx.is_coinbase())
        {
            return Err(ValidationError::ExtraCoinbase(position + 1));
        }

        if coinbase.outputs.len() != 1 {
            return Err(ValidationError::MalformedTransaction(
                "coinbase must have exactly one output".to_string(),
            ));
        }
        if coinbase.lock_time != block.header.height {
            return Err(ValidationError::MalformedTransaction(
                "coinbase does not commit to block height".to_string(),
            ));
        }
        if !is_valid_address(&coinbase.outputs[0].address) {
            return Err(ValidationError::MalformedTransaction(format!(
                "invalid coinbase address {}",
                coinbase.outputs[0].address
            )));
        }

        Ok(coinbase)
    }

    /// No transaction id appears twice and no outpoint is consumed twice.
    fn check_unique_spends(block: &Block) -> ValidationResult<()> {
        let mut spent: HashSet<OutPoint> = HashSet::new();
        for tx in &block.transactions {
            for input in &tx.inputs {
                if !spent.insert(input.previous_output) {
                    return Err(ValidationError::DoubleSpendWithinBlock {
                        txid: input.previous_output.txid,
                        vout: input.previous_output.vout,
                    });
                }
            }
        }

        let mut ids = HashSet::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            let id = tx.id();
            if !ids.insert(id) {
                return Err(ValidationError::DuplicateTransaction(id));
            }
        }

        Ok(())
    }
}

/// Median of the given timestamps, or zero when there are none.
pub fn median_timestamp(timestamps: &[u64]) -> u64 {
    if timestamps.is_empty() {
        return 0;
    }
    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();
    sorted[sorted.len() / 2]
}
