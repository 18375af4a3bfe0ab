use crate::core::blockchain::{Blockchain, ChainUpdate};
use crate::core::Transaction;
use crate::crypto::hash::Hash256;
use crate::error::{ValidationError, ValidationResult};
use std::collections::HashMap;

pub const DEFAULT_MAX_PENDING: usize = 5_000;

#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub tx: Transaction,
    pub txid: Hash256,
    /// Arrival order, used for greedy selection.
    pub sequence: u64,
}

/// Transactions accepted for mining but not yet confirmed. Entries may
/// conflict with each other; conflicts are resolved when a block is built.
#[derive(Debug)]
pub struct Mempool {
    entries: HashMap<Hash256, PendingTransaction>,
    next_sequence: u64,
    max_size: usize,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

impl Mempool {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            next_sequence: 0,
            max_size: max_size.max(1),
        }
    }

    /// Validates `tx` against the chain's current UTXO set and queues it.
    pub fn submit(&mut self, tx: Transaction, chain: &Blockchain) -> ValidationResult<Hash256> {
        let txid = tx.id();
        if self.entries.contains_key(&txid) {
            return Err(ValidationError::AlreadyKnown(txid));
        }

        chain
            .validator()
            .validate_transaction(&tx, chain.utxo_set(), chain.height() + 1)?;

        self.insert(tx, txid);
        log::debug!("📥 Transaction {} entered the pending pool", txid);
        Ok(txid)
    }

    /// Queues without validation. Used for transactions returned by a
    /// reorganization; they are revalidated when a block is built.
    pub fn requeue(&mut self, tx: Transaction) {
        if tx.is_coinbase() {
            return;
        }
        let txid = tx.id();
        if !self.entries.contains_key(&txid) {
            self.insert(tx, txid);
        }
    }

    fn insert(&mut self, tx: Transaction, txid: Hash256) {
        if self.entries.len() >= self.max_size {
            if let Some(oldest) = self.entries.values().min_by_key(|p| p.sequence).map(|p| p.txid) {
                log::warn!("⚠️ Pending pool full, dropping {}", oldest);
                self.entries.remove(&oldest);
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.insert(txid, PendingTransaction { tx, txid, sequence });
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<Transaction> {
        self.entries.remove(txid).map(|pending| pending.tx)
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot in arrival order.
    pub fn pending(&self) -> Vec<PendingTransaction> {
        let mut pending: Vec<_> = self.entries.values().cloned().collect();
        pending.sort_by_key(|p| p.sequence);
        pending
    }

    /// Drops confirmed transactions and takes back those from detached blocks.
    pub fn apply_update(&mut self, update: &ChainUpdate) {
        for block in &update.detached {
            for tx in block.transactions.iter().skip(1) {
                self.requeue(tx.clone());
            }
        }
        for block in &update.attached {
            for tx in &block.transactions {
                self.entries.remove(&tx.id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::params::{ConsensusParams, GENESIS_SEED};
    use crate::core::transaction::{OutPoint, TxOutput};
    use crate::crypto::keys::KeyPair;
    use crate::storage::Database;
    use crate::Result;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> Result<(Blockchain, KeyPair, OutPoint)> {
        let chain = Blockchain::open(Database::open(dir.path())?, ConsensusParams::regtest(), false)?;
        let owner = KeyPair::from_seed(GENESIS_SEED)?;
        let funding = OutPoint::new(chain.block_at(0).expect("genesis").transactions[0].id(), 0);
        Ok((chain, owner, funding))
    }

    #[test]
    fn test_submit_and_duplicate() -> Result<()> {
        let dir = TempDir::new()?;
        let (chain, owner, funding) = setup(&dir)?;
        let mut pool = Mempool::default();

        let tx = Transaction::new_signed(&[(funding, &owner)], vec![TxOutput::new(10, owner.address())])?;
        let txid = pool.submit(tx.clone(), &chain)?;
        assert!(pool.contains(&txid));
        assert_eq!(pool.submit(tx, &chain), Err(ValidationError::AlreadyKnown(txid)));
        Ok(())
    }

    #[test]
    fn test_conflicting_spends_both_pending() -> Result<()> {
        let dir = TempDir::new()?;
        let (chain, owner, funding) = setup(&dir)?;
        let mut pool = Mempool::default();

        let a = Transaction::new_signed(&[(funding, &owner)], vec![TxOutput::new(10, owner.address())])?;
        let b = Transaction::new_signed(&[(funding, &owner)], vec![TxOutput::new(20, owner.address())])?;
        let first = pool.submit(a, &chain)?;
        let second = pool.submit(b, &chain)?;

        let order: Vec<_> = pool.pending().into_iter().map(|p| p.txid).collect();
        assert_eq!(order, vec![first, second]);
        Ok(())
    }

    #[test]
    fn test_rejects_invalid() -> Result<()> {
        let dir = TempDir::new()?;
        let (chain, owner, _) = setup(&dir)?;
        let mut pool = Mempool::default();

        let coinbase = Transaction::new_coinbase(owner.address(), 1, 1);
        assert!(matches!(
            pool.submit(coinbase, &chain),
            Err(ValidationError::MalformedTransaction(_))
        ));

        let missing = OutPoint::new(Hash256::hash(b"missing"), 0);
        let tx = Transaction::new_signed(&[(missing, &owner)], vec![TxOutput::new(1, owner.address())])?;
        assert!(matches!(pool.submit(tx, &chain), Err(ValidationError::UnknownInput { .. })));
        assert!(pool.is_empty());
        Ok(())
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut pool = Mempool::new(2);
        let txs: Vec<_> = (1..=3)
            .map(|i| {
                let mut tx = Transaction::new_coinbase("mcx", i, 0);
                tx.inputs.push(crate::core::TxInput {
                    previous_output: OutPoint::new(Hash256::hash(&[i as u8]), 0),
                    signature: crate::crypto::Signature::empty(),
                    public_key: KeyPair::from_seed(b"k").expect("key").public_key,
                });
                tx
            })
            .collect();

        for tx in &txs {
            pool.requeue(tx.clone());
        }
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&txs[0].id()));
        assert!(pool.contains(&txs[2].id()));
    }
}
