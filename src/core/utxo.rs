use crate::core::transaction::OutPoint;
use crate::core::Block;
use crate::error::ValidationError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub value: u64,
    pub address: String,
    pub height: u64,
    pub is_coinbase: bool,
}

/// Entries a block consumed, kept so the block can be rolled back exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    pub spent: Vec<(OutPoint, UtxoEntry)>,
}

/// Unspent outputs of the active chain. Derived state: replaying the chain
/// from genesis into an empty set reproduces it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoSet {
    entries: HashMap<OutPoint, UtxoEntry>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (OutPoint, UtxoEntry)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.entries.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.entries.contains_key(outpoint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &UtxoEntry)> {
        self.entries.iter()
    }

    /// Spends every input and creates every output of `block`. Inputs may only
    /// reference outputs that existed before the block; nothing is changed on
    /// failure.
    pub fn apply_block(&mut self, block: &Block) -> Result<BlockUndo> {
        let undo = self.spent_by(block)?;

        for (outpoint, _) in &undo.spent {
            self.entries.remove(outpoint);
        }

        for tx in &block.transactions {
            let txid = tx.id();
            for (vout, output) in tx.outputs.iter().enumerate() {
                self.entries.insert(
                    OutPoint::new(txid, vout as u32),
                    UtxoEntry {
                        value: output.value,
                        address: output.address.clone(),
                        height: block.header.height,
                        is_coinbase: tx.is_coinbase(),
                    },
                );
            }
        }

        Ok(undo)
    }

    /// Undo data `block` would produce, without changing the set.
    pub fn spent_by(&self, block: &Block) -> Result<BlockUndo> {
        let mut undo = BlockUndo::default();

        for tx in &block.transactions {
            for input in &tx.inputs {
                let outpoint = input.previous_output;
                let entry = self.entries.get(&outpoint).ok_or(ValidationError::UnknownInput {
                    txid: outpoint.txid,
                    vout: outpoint.vout,
                })?;
                if undo.spent.iter().any(|(spent, _)| *spent == outpoint) {
                    return Err(ValidationError::DoubleSpendWithinBlock {
                        txid: outpoint.txid,
                        vout: outpoint.vout,
                    }
                    .into());
                }
                undo.spent.push((outpoint, entry.clone()));
            }
        }

        Ok(undo)
    }

    /// Inverse of `apply_block`: removes the block's outputs and reinstates
    /// what it spent.
    pub fn rollback_block(&mut self, block: &Block, undo: &BlockUndo) {
        for tx in block.transactions.iter().rev() {
            let txid = tx.id();
            for vout in 0..tx.outputs.len() {
                self.entries.remove(&OutPoint::new(txid, vout as u32));
            }
        }

        for (outpoint, entry) in &undo.spent {
            self.entries.insert(*outpoint, entry.clone());
        }
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.entries
            .values()
            .filter(|entry| entry.address == address)
            .map(|entry| entry.value)
            .sum()
    }

    /// Outputs owned by `address`, ordered by outpoint.
    pub fn utxos_for(&self, address: &str) -> Vec<(OutPoint, UtxoEntry)> {
        let mut utxos: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.address == address)
            .map(|(outpoint, entry)| (*outpoint, entry.clone()))
            .collect();
        utxos.sort_by(|a, b| a.0.cmp(&b.0));
        utxos
    }

    pub fn total_value(&self) -> u64 {
        self.entries.values().map(|entry| entry.value).sum()
    }
}
