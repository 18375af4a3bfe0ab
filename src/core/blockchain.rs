use crate::consensus::monetary::MonetaryPolicy;
use crate::consensus::params::ConsensusParams;
use crate::consensus::validation::{median_timestamp, BlockValidator, ParentContext};
use crate::core::utxo::{BlockUndo, UtxoSet};
use crate::core::{Block, BlockHeader};
use crate::crypto::hash::{Hash256, Hashable};
use crate::error::ValidationError;
use crate::mining::difficulty::DifficultyCalculator;
use crate::storage::{ChainCommit, Database};
use crate::{CoinError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::watch;

/// Persisted pointer to the active tip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub tip: Hash256,
    pub height: u64,
}

/// Published on every tip change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub height: u64,
    pub hash: Hash256,
}

/// Result of a successful change to the active chain. A plain extension has
/// no detached blocks.
#[derive(Debug, Clone)]
pub struct ChainUpdate {
    pub fork_height: u64,
    pub detached: Vec<Block>,
    pub attached: Vec<Block>,
}

impl ChainUpdate {
    pub fn is_reorg(&self) -> bool {
        !self.detached.is_empty()
    }
}

/// Parameters a miner needs to build a child of the current tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextBlock {
    pub parent_hash: Hash256,
    pub height: u64,
    pub target_bits: u32,
    pub median_time_past: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderSummary {
    pub height: u64,
    pub hash: Hash256,
    pub previous_hash: Hash256,
    pub timestamp: u64,
    pub target_bits: u32,
    pub nonce: u64,
    pub transaction_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSummary {
    pub height: u64,
    pub tip: Hash256,
    pub total_supply: u64,
    pub next_target_bits: u32,
    pub utxo_count: usize,
    pub headers: Vec<HeaderSummary>,
}

#[derive(Debug, Clone)]
struct ChainEntry {
    block: Block,
    hash: Hash256,
    undo: BlockUndo,
}

/// The active chain and the UTXO set derived from it. All mutation goes
/// through `add_block` and `accept_chain`, and storage is committed before
/// any in-memory state changes.
#[derive(Debug)]
pub struct Blockchain {
    params: ConsensusParams,
    validator: BlockValidator,
    difficulty: DifficultyCalculator,
    entries: Vec<ChainEntry>,
    headers: Vec<BlockHeader>,
    by_hash: HashMap<Hash256, u64>,
    utxo_set: UtxoSet,
    db: Database,
    tip_tx: watch::Sender<ChainTip>,
}

pub(crate) fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

impl Blockchain {
    /// Opens the chain stored in `db`, creating genesis on first use. With
    /// `verify`, the stored chain is replayed from genesis under full
    /// validation and the UTXO snapshot is rebuilt if it disagrees.
    pub fn open(db: Database, params: ConsensusParams, verify: bool) -> Result<Self> {
        let genesis = Block::genesis(&params)?;
        let genesis_hash = genesis.hash();

        let (entries, utxo_set) = match db.load_chain()? {
            Some(stored) => {
                let stored_genesis = stored.blocks.first().map(|(block, _)| block.hash());
                if stored_genesis != Some(genesis_hash) {
                    return Err(CoinError::Config(format!(
                        "Stored chain does not start at genesis {}",
                        genesis_hash
                    )));
                }

                let entries: Vec<ChainEntry> = stored
                    .blocks
                    .into_iter()
                    .map(|(block, undo)| ChainEntry {
                        hash: block.hash(),
                        block,
                        undo,
                    })
                    .collect();
                (entries, stored.utxos)
            }
            None => {
                let mut utxo_set = UtxoSet::new();
                let undo = utxo_set.apply_block(&genesis)?;
                db.commit(&ChainCommit {
                    detached: vec![],
                    attached: vec![(&genesis, &undo)],
                    state: ChainState {
                        tip: genesis_hash,
                        height: 0,
                    },
                })?;
                log::info!("🌱 Created genesis block {}", genesis_hash);

                let entry = ChainEntry {
                    block: genesis,
                    hash: genesis_hash,
                    undo,
                };
                (vec![entry], utxo_set)
            }
        };

        let tip = entries
            .last()
            .map(|entry| ChainTip {
                height: entry.block.header.height,
                hash: entry.hash,
            })
            .ok_or_else(|| CoinError::Storage("Stored chain is empty".to_string()))?;
        let (tip_tx, _) = watch::channel(tip);

        let mut chain = Self {
            validator: BlockValidator::new(&params),
            difficulty: DifficultyCalculator::new(&params),
            headers: entries.iter().map(|entry| entry.block.header.clone()).collect(),
            by_hash: entries
                .iter()
                .map(|entry| (entry.hash, entry.block.header.height))
                .collect(),
            entries,
            utxo_set,
            db,
            tip_tx,
            params,
        };

        if verify {
            let replayed = chain.replay()?;
            if replayed != chain.utxo_set {
                log::warn!("⚠️ Stored UTXO snapshot disagrees with replay, rebuilding");
                chain.db.rewrite_utxos(&replayed)?;
                chain.utxo_set = replayed;
            }
        }

        log::info!("⛓️ Chain ready at height {} (tip {})", chain.height(), chain.tip_hash());
        Ok(chain)
    }

    /// Rebuilds the UTXO set from genesis, validating every block.
    pub fn replay(&self) -> Result<UtxoSet> {
        let mut utxos = UtxoSet::new();
        let now = unix_now();

        for (height, entry) in self.entries.iter().enumerate() {
            if height > 0 {
                let context = self.parent_context(&self.headers[..height], &utxos, now);
                self.validator
                    .validate_block(&entry.block, &context)
                    .map_err(|e| {
                        CoinError::Storage(format!("Stored block {} is invalid: {}", height, e))
                    })?;
            }
            utxos.apply_block(&entry.block)?;
        }

        Ok(utxos)
    }

    pub fn subscribe(&self) -> watch::Receiver<ChainTip> {
        self.tip_tx.subscribe()
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn monetary(&self) -> &MonetaryPolicy {
        self.validator.monetary()
    }

    pub fn validator(&self) -> &BlockValidator {
        &self.validator
    }

    pub fn height(&self) -> u64 {
        self.entries.len() as u64 - 1
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.entries
            .last()
            .map(|entry| entry.hash)
            .unwrap_or_else(Hash256::zero)
    }

    pub fn tip(&self) -> ChainTip {
        ChainTip {
            height: self.height(),
            hash: self.tip_hash(),
        }
    }

    pub fn utxo_set(&self) -> &UtxoSet {
        &self.utxo_set
    }

    pub fn total_supply(&self) -> u64 {
        self.monetary().total_supply_at_height(self.height())
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn height_of(&self, hash: &Hash256) -> Option<u64> {
        self.by_hash.get(hash).copied()
    }

    pub fn block_at(&self, height: u64) -> Option<&Block> {
        self.entries.get(height as usize).map(|entry| &entry.block)
    }

    pub fn hash_at(&self, height: u64) -> Option<Hash256> {
        self.entries.get(height as usize).map(|entry| entry.hash)
    }

    pub fn block_by_hash(&self, hash: &Hash256) -> Option<&Block> {
        self.height_of(hash).and_then(|height| self.block_at(height))
    }

    /// Looks up any block ever accepted, including ones a reorganization detached.
    pub fn find_block(&self, hash: &Hash256) -> Result<Option<Block>> {
        match self.block_by_hash(hash) {
            Some(block) => Ok(Some(block.clone())),
            None => self.db.get_block(hash),
        }
    }

    pub fn headers(&self, from_height: u64, count: usize) -> Vec<BlockHeader> {
        self.headers
            .iter()
            .skip(from_height as usize)
            .take(count)
            .cloned()
            .collect()
    }

    pub fn blocks_from(&self, from_height: u64, limit: usize) -> Vec<Block> {
        self.entries
            .iter()
            .skip(from_height as usize)
            .take(limit)
            .map(|entry| entry.block.clone())
            .collect()
    }

    pub fn next_block(&self) -> NextBlock {
        let context = self.parent_context(&self.headers, &self.utxo_set, unix_now());
        NextBlock {
            parent_hash: context.hash,
            height: context.height + 1,
            target_bits: context.expected_bits,
            median_time_past: context.median_time_past,
        }
    }

    pub fn summary(&self, max_headers: usize) -> ChainSummary {
        let start = self.entries.len().saturating_sub(max_headers);
        let headers = self.entries[start..]
            .iter()
            .rev()
            .map(|entry| HeaderSummary {
                height: entry.block.header.height,
                hash: entry.hash,
                previous_hash: entry.block.header.previous_hash,
                timestamp: entry.block.header.timestamp,
                target_bits: entry.block.header.target_bits,
                nonce: entry.block.header.nonce,
                transaction_count: entry.block.transactions.len(),
            })
            .collect();

        ChainSummary {
            height: self.height(),
            tip: self.tip_hash(),
            total_supply: self.total_supply(),
            next_target_bits: self.next_block().target_bits,
            utxo_count: self.utxo_set.len(),
            headers,
        }
    }

    /// Validates `block` as a child of the current tip and appends it.
    pub fn add_block(&mut self, block: Block) -> Result<ChainUpdate> {
        let hash = block.hash();
        if self.contains(&hash) {
            return Err(ValidationError::AlreadyKnown(hash).into());
        }

        let context = self.parent_context(&self.headers, &self.utxo_set, unix_now());
        self.validator.validate_block(&block, &context)?;
        let undo = self.utxo_set.spent_by(&block)?;

        let fork_height = self.height();
        let height = block.header.height;
        self.db.commit(&ChainCommit {
            detached: vec![],
            attached: vec![(&block, &undo)],
            state: ChainState { tip: hash, height },
        })?;

        self.utxo_set.apply_block(&block)?;
        self.push_entry(ChainEntry {
            block: block.clone(),
            hash,
            undo,
        });
        self.tip_tx.send_replace(self.tip());

        log::info!("✅ Block {} added to chain ({})", height, hash);
        Ok(ChainUpdate {
            fork_height,
            detached: vec![],
            attached: vec![block],
        })
    }

    /// Fork choice. `segment` is a run of consecutive blocks whose first
    /// parent is on the active chain; blocks already on the active chain are
    /// skipped. The result replaces the local blocks above the fork point only
    /// if it ends strictly higher than the local tip and every block validates.
    /// On any failure nothing changes.
    pub fn accept_chain(&mut self, segment: Vec<Block>) -> Result<ChainUpdate> {
        let local = self.height();
        let offered = segment.last().map(|block| block.header.height).unwrap_or(0);

        let mut blocks = segment.into_iter().peekable();
        while let Some(block) = blocks.peek() {
            let hash = block.hash();
            if self.height_of(&hash) == Some(block.header.height) {
                blocks.next();
            } else {
                break;
            }
        }
        let blocks: Vec<Block> = blocks.collect();

        let Some(first) = blocks.first() else {
            return Err(ValidationError::NotLonger { local, offered }.into());
        };
        if offered <= local {
            return Err(ValidationError::NotLonger { local, offered }.into());
        }
        let fork_height = self
            .height_of(&first.header.previous_hash)
            .ok_or(ValidationError::UnknownAncestor(first.header.previous_hash))?;

        let mut utxos = self.utxo_set.clone();
        for entry in self.entries[fork_height as usize + 1..].iter().rev() {
            utxos.rollback_block(&entry.block, &entry.undo);
        }

        let mut headers = self.headers[..=fork_height as usize].to_vec();
        let mut attached = Vec::with_capacity(blocks.len());
        let now = unix_now();
        for block in blocks {
            let context = self.parent_context(&headers, &utxos, now);
            self.validator.validate_block(&block, &context)?;
            let undo = utxos.apply_block(&block)?;
            headers.push(block.header.clone());
            attached.push(ChainEntry {
                hash: block.hash(),
                block,
                undo,
            });
        }

        let detached_range = fork_height as usize + 1..self.entries.len();
        let tip = attached
            .last()
            .map(|entry| ChainState {
                tip: entry.hash,
                height: entry.block.header.height,
            })
            .ok_or_else(|| CoinError::InvalidInput("empty chain segment".to_string()))?;

        self.db.commit(&ChainCommit {
            detached: self.entries[detached_range.clone()]
                .iter()
                .rev()
                .map(|entry| (&entry.block, &entry.undo))
                .collect(),
            attached: attached.iter().map(|entry| (&entry.block, &entry.undo)).collect(),
            state: tip,
        })?;

        let detached: Vec<ChainEntry> = self.entries.drain(detached_range).collect();
        self.headers.truncate(fork_height as usize + 1);
        for entry in &detached {
            self.by_hash.remove(&entry.hash);
        }
        let attached_blocks: Vec<Block> = attached.iter().map(|entry| entry.block.clone()).collect();
        for entry in attached {
            self.push_entry(entry);
        }
        self.utxo_set = utxos;
        self.tip_tx.send_replace(self.tip());

        if detached.is_empty() {
            log::info!(
                "✅ Chain extended by {} blocks to height {}",
                attached_blocks.len(),
                self.height()
            );
        } else {
            log::warn!(
                "🔀 Reorganized at height {}: detached {} blocks, attached {}, new tip {} at {}",
                fork_height,
                detached.len(),
                attached_blocks.len(),
                self.tip_hash(),
                self.height()
            );
        }

        Ok(ChainUpdate {
            fork_height,
            detached: detached.into_iter().map(|entry| entry.block).collect(),
            attached: attached_blocks,
        })
    }

    fn push_entry(&mut self, entry: ChainEntry) {
        self.by_hash.insert(entry.hash, entry.block.header.height);
        self.headers.push(entry.block.header.clone());
        self.entries.push(entry);
    }

    /// Context for a child of the last header in `headers`.
    fn parent_context<'u>(&self, headers: &[BlockHeader], utxos: &'u UtxoSet, now: u64) -> ParentContext<'u> {
        let parent = &headers[headers.len() - 1];
        let child_height = parent.height + 1;

        let window_start = self.difficulty.window_start(child_height) as usize;
        let timestamps: Vec<u64> = headers
            .get(window_start..)
            .unwrap_or_default()
            .iter()
            .map(|header| header.timestamp)
            .collect();
        let expected_bits = self
            .difficulty
            .next_target_bits(parent.target_bits, child_height, &timestamps);

        let span_start = headers.len().saturating_sub(self.params.median_time_span);
        let recent: Vec<u64> = headers[span_start..].iter().map(|h| h.timestamp).collect();

        ParentContext {
            hash: parent.hash(),
            height: parent.height,
            expected_bits,
            median_time_past: median_timestamp(&recent),
            now,
            utxos,
        }
    }
}
