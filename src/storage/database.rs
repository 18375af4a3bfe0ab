use crate::core::blockchain::ChainState;
use crate::core::transaction::OutPoint;
use crate::core::utxo::{BlockUndo, UtxoEntry, UtxoSet};
use crate::core::Block;
use crate::crypto::hash::{Hash256, Hashable};
use crate::{CoinError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::TransactionError;
use sled::{Batch, Db, Transactional, Tree};
use std::path::Path;

// Database tree names
const TREE_BLOCKS: &str = "blocks";
const TREE_BLOCK_INDEX: &str = "block_index";
const TREE_UNDO: &str = "undo";
const TREE_UTXOS: &str = "utxos";
const TREE_CHAIN_STATE: &str = "chain_state";

const CURRENT_STATE_KEY: &[u8] = b"current";

/// Change to the active chain, written as one transaction.
/// `detached` is in rollback order (tip first); `attached` in chain order.
#[derive(Debug)]
pub struct ChainCommit<'a> {
    pub detached: Vec<(&'a Block, &'a BlockUndo)>,
    pub attached: Vec<(&'a Block, &'a BlockUndo)>,
    pub state: ChainState,
}

/// Everything needed to rebuild the in-memory chain.
#[derive(Debug)]
pub struct StoredChain {
    pub state: ChainState,
    pub blocks: Vec<(Block, BlockUndo)>,
    pub utxos: UtxoSet,
}

#[derive(Debug, Clone)]
pub struct Database {
    db: Db,
    blocks: Tree,
    block_index: Tree,
    undo: Tree,
    utxos: Tree,
    chain_state: Tree,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| CoinError::Storage(format!("Failed to open database: {}", e)))?;

        Ok(Self {
            blocks: Self::open_tree(&db, TREE_BLOCKS)?,
            block_index: Self::open_tree(&db, TREE_BLOCK_INDEX)?,
            undo: Self::open_tree(&db, TREE_UNDO)?,
            utxos: Self::open_tree(&db, TREE_UTXOS)?,
            chain_state: Self::open_tree(&db, TREE_CHAIN_STATE)?,
            db,
        })
    }

    fn open_tree(db: &Db, name: &str) -> Result<Tree> {
        db.open_tree(name)
            .map_err(|e| CoinError::Storage(format!("Failed to open tree {}: {}", name, e)))
    }

    /// Applies a chain change atomically across all trees and flushes it.
    pub fn commit(&self, commit: &ChainCommit<'_>) -> Result<()> {
        let mut blocks = Batch::default();
        let mut index = Batch::default();
        let mut undo = Batch::default();
        let mut utxos = Batch::default();
        let mut state = Batch::default();

        for (block, block_undo) in &commit.detached {
            index.remove(height_key(block.header.height).to_vec());
            for tx in &block.transactions {
                let txid = tx.id();
                for vout in 0..tx.outputs.len() {
                    utxos.remove(OutPoint::new(txid, vout as u32).to_key().to_vec());
                }
            }
            for (outpoint, entry) in &block_undo.spent {
                utxos.insert(outpoint.to_key().to_vec(), encode(entry)?);
            }
        }

        for (block, block_undo) in &commit.attached {
            let hash = block.hash();
            blocks.insert(hash.as_bytes().to_vec(), encode(*block)?);
            undo.insert(hash.as_bytes().to_vec(), encode(*block_undo)?);
            index.insert(height_key(block.header.height).to_vec(), hash.as_bytes().to_vec());

            for (outpoint, _) in &block_undo.spent {
                utxos.remove(outpoint.to_key().to_vec());
            }
            for tx in &block.transactions {
                let txid = tx.id();
                for (vout, output) in tx.outputs.iter().enumerate() {
                    let entry = UtxoEntry {
                        value: output.value,
                        address: output.address.clone(),
                        height: block.header.height,
                        is_coinbase: tx.is_coinbase(),
                    };
                    utxos.insert(OutPoint::new(txid, vout as u32).to_key().to_vec(), encode(&entry)?);
                }
            }
        }

        state.insert(CURRENT_STATE_KEY, encode(&commit.state)?);

        (&self.blocks, &self.block_index, &self.undo, &self.utxos, &self.chain_state)
            .transaction(|(tx_blocks, tx_index, tx_undo, tx_utxos, tx_state)| {
                tx_blocks.apply_batch(&blocks)?;
                tx_index.apply_batch(&index)?;
                tx_undo.apply_batch(&undo)?;
                tx_utxos.apply_batch(&utxos)?;
                tx_state.apply_batch(&state)?;
                Ok(())
            })
            .map_err(|e: TransactionError<()>| {
                CoinError::Storage(format!("Failed to commit chain update: {:?}", e))
            })?;

        self.flush()?;

        log::debug!(
            "💾 Committed chain update: -{} +{} blocks, tip {} at height {}",
            commit.detached.len(),
            commit.attached.len(),
            commit.state.tip,
            commit.state.height
        );
        Ok(())
    }

    /// Replaces the stored UTXO snapshot with `utxo_set`.
    pub fn rewrite_utxos(&self, utxo_set: &UtxoSet) -> Result<()> {
        let mut batch = Batch::default();
        for item in self.utxos.iter().keys() {
            let key = item.map_err(|e| CoinError::Storage(format!("Failed to scan utxos: {}", e)))?;
            batch.remove(key);
        }
        for (outpoint, entry) in utxo_set.iter() {
            batch.insert(outpoint.to_key().to_vec(), encode(entry)?);
        }

        self.utxos
            .apply_batch(batch)
            .map_err(|e| CoinError::Storage(format!("Failed to rewrite utxos: {}", e)))?;
        self.flush()
    }

    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| CoinError::Storage(format!("Failed to flush database: {}", e)))?;
        Ok(())
    }

    pub fn chain_state(&self) -> Result<Option<ChainState>> {
        self.read(&self.chain_state, CURRENT_STATE_KEY)
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>> {
        self.read(&self.blocks, hash.as_bytes())
    }

    pub fn get_block_hash(&self, height: u64) -> Result<Option<Hash256>> {
        let value = self
            .block_index
            .get(height_key(height))
            .map_err(|e| CoinError::Storage(format!("Failed to get block index: {}", e)))?;

        match value {
            Some(bytes) => Hash256::from_slice(&bytes)
                .map(Some)
                .ok_or_else(|| CoinError::Storage("Invalid block hash length".to_string())),
            None => Ok(None),
        }
    }

    /// Loads the active chain, its undo data and the UTXO snapshot.
    /// Returns `None` for an empty database.
    pub fn load_chain(&self) -> Result<Option<StoredChain>> {
        let Some(state) = self.chain_state()? else {
            return Ok(None);
        };

        let mut blocks = Vec::with_capacity(state.height as usize + 1);
        for height in 0..=state.height {
            let hash = self
                .get_block_hash(height)?
                .ok_or_else(|| CoinError::Storage(format!("Missing index entry at height {}", height)))?;
            let block = self
                .get_block(&hash)?
                .ok_or_else(|| CoinError::Storage(format!("Missing block {}", hash)))?;
            let undo: BlockUndo = self
                .read(&self.undo, hash.as_bytes())?
                .ok_or_else(|| CoinError::Storage(format!("Missing undo data for {}", hash)))?;
            blocks.push((block, undo));
        }

        let mut entries = Vec::new();
        for item in self.utxos.iter() {
            let (key, value) =
                item.map_err(|e| CoinError::Storage(format!("Failed to scan utxos: {}", e)))?;
            let outpoint = OutPoint::from_key(&key)
                .ok_or_else(|| CoinError::Storage("Invalid utxo key".to_string()))?;
            entries.push((outpoint, decode::<UtxoEntry>(&value)?));
        }

        log::info!(
            "📂 Loaded {} blocks and {} unspent outputs from storage",
            blocks.len(),
            entries.len()
        );

        Ok(Some(StoredChain {
            state,
            blocks,
            utxos: UtxoSet::from_entries(entries),
        }))
    }

    fn read<T: DeserializeOwned>(&self, tree: &Tree, key: &[u8]) -> Result<Option<T>> {
        match tree
            .get(key)
            .map_err(|e| CoinError::Storage(format!("Failed to read: {}", e)))?
        {
            Some(data) => Ok(Some(decode(&data)?)),
            None => Ok(None),
        }
    }
}

/// Big-endian so the index iterates in height order.
fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| CoinError::Storage(format!("Failed to serialize: {}", e)))
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| CoinError::Storage(format!("Failed to deserialize: {}", e)))
}
