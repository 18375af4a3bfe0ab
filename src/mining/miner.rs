use crate::core::blockchain::{unix_now, ChainTip, ChainUpdate};
use crate::core::transaction::OutPoint;
use crate::core::{Block, Blockchain, Mempool, Transaction};
use crate::crypto::hash::{Hash256, Hashable};
use crate::crypto::keys::is_valid_address;
use crate::{CoinError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerConfig {
    pub mining_address: String,
    pub max_block_transactions: usize,
    /// Hashes between checks of the tip-change signal.
    pub tip_check_interval: u64,
    /// Hashes per round before the template is rebuilt.
    pub max_nonces_per_round: u64,
}

impl MinerConfig {
    pub fn new(mining_address: impl Into<String>) -> Self {
        Self {
            mining_address: mining_address.into(),
            max_block_transactions: 1_000,
            tip_check_interval: 1_024,
            max_nonces_per_round: 1 << 22,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningStats {
    pub is_mining: bool,
    pub hashrate: f64,
    pub total_hashes: u64,
    pub blocks_mined: u64,
    pub stale_rounds: u64,
    pub rejected_blocks: u64,
    pub uptime_seconds: u64,
    pub mining_address: String,
}

#[derive(Debug, Default)]
struct Counters {
    total_hashes: AtomicU64,
    blocks_mined: AtomicU64,
    stale_rounds: AtomicU64,
    rejected_blocks: AtomicU64,
}

/// Candidate block built from a snapshot of the tip and the pending pool.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub block: Block,
    pub fees: u64,
    /// Pending transactions that can never be mined on this tip.
    pub evicted: Vec<Hash256>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Found(Block),
    /// The tip moved during the search; the candidate is obsolete.
    Stale,
    /// The round's nonce budget ran out.
    Exhausted,
    Stopped,
}

pub struct Miner {
    blockchain: Arc<RwLock<Blockchain>>,
    mempool: Arc<Mutex<Mempool>>,
    config: MinerConfig,
    is_mining: Arc<AtomicBool>,
    counters: Arc<Counters>,
    start_time: Instant,
}

impl Miner {
    pub fn new(
        blockchain: Arc<RwLock<Blockchain>>,
        mempool: Arc<Mutex<Mempool>>,
        config: MinerConfig,
    ) -> Result<Self> {
        if !is_valid_address(&config.mining_address) {
            return Err(CoinError::Mining(format!(
                "Invalid mining address: {}",
                config.mining_address
            )));
        }

        Ok(Self {
            blockchain,
            mempool,
            config,
            is_mining: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            start_time: Instant::now(),
        })
    }

    /// Snapshots the tip and pending pool and assembles a candidate. The
    /// returned receiver reports tip changes that make the candidate stale.
    pub fn build_template(&self) -> Result<(BlockTemplate, watch::Receiver<ChainTip>)> {
        let chain = self.blockchain.read();
        let tip_rx = chain.subscribe();
        let next = chain.next_block();

        let pending = self.mempool.lock().pending();

        let mut selected: Vec<Transaction> = Vec::new();
        let mut spent: HashSet<OutPoint> = HashSet::new();
        let mut evicted = Vec::new();
        let mut fees = 0u64;

        for candidate in pending {
            if selected.len() >= self.config.max_block_transactions {
                break;
            }
            if candidate.tx.lock_time > next.height {
                continue;
            }
            if candidate
                .tx
                .inputs
                .iter()
                .any(|input| spent.contains(&input.previous_output))
            {
                // Conflicts with an earlier selection; stays pending.
                continue;
            }

            match chain
                .validator()
                .validate_transaction(&candidate.tx, chain.utxo_set(), next.height)
            {
                Ok(fee) => match fees.checked_add(fee) {
                    Some(total) => {
                        fees = total;
                        spent.extend(candidate.tx.inputs.iter().map(|input| input.previous_output));
                        selected.push(candidate.tx);
                    }
                    None => continue,
                },
                Err(e) => {
                    log::debug!("🗑️ Evicting pending transaction {}: {}", candidate.txid, e);
                    evicted.push(candidate.txid);
                }
            }
        }

        if !evicted.is_empty() {
            let mut mempool = self.mempool.lock();
            for txid in &evicted {
                mempool.remove(txid);
            }
        }

        let reward = chain
            .monetary()
            .expected_coinbase_value(next.height, fees)
            .ok_or_else(|| CoinError::Mining("Coinbase value overflows".to_string()))?;
        let mut transactions = Vec::with_capacity(selected.len() + 1);
        transactions.push(Transaction::new_coinbase(
            self.config.mining_address.clone(),
            reward,
            next.height,
        ));
        transactions.extend(selected);

        let timestamp = unix_now().max(next.median_time_past + 1);
        let block = Block::new(
            next.parent_hash,
            transactions,
            next.target_bits,
            next.height,
            timestamp,
        );

        Ok((
            BlockTemplate {
                block,
                fees,
                evicted,
            },
            tip_rx,
        ))
    }

    /// Nonce search over `block`, starting at `start_nonce`, for as long as
    /// `running` stays set. Blocking; run it on a worker thread.
    pub fn search(
        mut block: Block,
        start_nonce: u64,
        config: &MinerConfig,
        tip_rx: &watch::Receiver<ChainTip>,
        running: &AtomicBool,
        hashes: &AtomicU64,
    ) -> SearchOutcome {
        let check_interval = config.tip_check_interval.max(1);
        let mut tried = 0u64;
        block.header.nonce = start_nonce;

        let outcome = loop {
            if tried >= config.max_nonces_per_round {
                break SearchOutcome::Exhausted;
            }
            if tried % check_interval == 0 {
                if !running.load(Ordering::Relaxed) {
                    break SearchOutcome::Stopped;
                }
                match tip_rx.has_changed() {
                    Ok(false) => {}
                    Ok(true) => break SearchOutcome::Stale,
                    Err(_) => break SearchOutcome::Stopped,
                }
            }

            tried += 1;
            if block.header.meets_target() {
                break SearchOutcome::Found(block);
            }
            block.header.nonce = block.header.nonce.wrapping_add(1);
        };

        hashes.fetch_add(tried, Ordering::Relaxed);
        outcome
    }

    /// Hands a solved block to the chain and updates the pending pool.
    pub fn submit(&self, block: Block) -> Result<ChainUpdate> {
        let update = self.blockchain.write().add_block(block)?;
        self.mempool.lock().apply_update(&update);
        Ok(update)
    }

    /// Builds, solves and submits one block. Blocking.
    pub fn mine_next_block(&self) -> Result<Block> {
        let running = AtomicBool::new(true);
        loop {
            let (template, tip_rx) = self.build_template()?;
            let outcome = Self::search(
                template.block,
                rand::random(),
                &self.config,
                &tip_rx,
                &running,
                &self.counters.total_hashes,
            );

            if let SearchOutcome::Found(block) = outcome {
                self.submit(block.clone())?;
                self.counters.blocks_mined.fetch_add(1, Ordering::Relaxed);
                return Ok(block);
            }
        }
    }

    /// Mining loop. Runs until `stop` is called; returns early only on a
    /// fatal storage error.
    pub async fn run(&self) -> Result<()> {
        if self.is_mining.swap(true, Ordering::SeqCst) {
            return Err(CoinError::Mining("Mining already started".to_string()));
        }
        log::info!("⛏️ Mining to address: {}", self.config.mining_address);

        while self.is_mining.load(Ordering::Relaxed) {
            let (template, tip_rx) = match self.build_template() {
                Ok(template) => template,
                Err(e) => {
                    log::error!("Failed to build block template: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            log::debug!(
                "🔨 Mining block {} with {} transactions ({} fees)",
                template.block.header.height,
                template.block.transactions.len(),
                template.fees
            );

            let config = self.config.clone();
            let running = self.is_mining.clone();
            let counters = self.counters.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                Self::search(
                    template.block,
                    rand::random(),
                    &config,
                    &tip_rx,
                    &running,
                    &counters.total_hashes,
                )
            })
            .await
            .map_err(|e| CoinError::Mining(format!("Mining worker failed: {}", e)))?;

            match outcome {
                SearchOutcome::Found(block) => {
                    let hash = block.hash();
                    let height = block.header.height;
                    match self.submit(block) {
                        Ok(_) => {
                            self.counters.blocks_mined.fetch_add(1, Ordering::Relaxed);
                            log::info!("🎉 Block mined at height {}! Hash: {}", height, hash);
                        }
                        Err(e) if e.is_fatal() => {
                            self.is_mining.store(false, Ordering::SeqCst);
                            return Err(e);
                        }
                        Err(e) => {
                            self.counters.rejected_blocks.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Mined block {} not accepted: {}", height, e);
                        }
                    }
                }
                SearchOutcome::Stale => {
                    self.counters.stale_rounds.fetch_add(1, Ordering::Relaxed);
                    log::debug!("♻️ Tip changed, restarting mining round");
                }
                SearchOutcome::Exhausted => {}
                SearchOutcome::Stopped => break,
            }
        }

        log::info!("🛑 Mining stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.is_mining.store(false, Ordering::SeqCst);
    }

    pub fn is_mining(&self) -> bool {
        self.is_mining.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> MiningStats {
        let total_hashes = self.counters.total_hashes.load(Ordering::Relaxed);
        let uptime = self.start_time.elapsed();
        let hashrate = if uptime.as_secs_f64() > 0.0 {
            total_hashes as f64 / uptime.as_secs_f64()
        } else {
            0.0
        };

        MiningStats {
            is_mining: self.is_mining(),
            hashrate,
            total_hashes,
            blocks_mined: self.counters.blocks_mined.load(Ordering::Relaxed),
            stale_rounds: self.counters.stale_rounds.load(Ordering::Relaxed),
            rejected_blocks: self.counters.rejected_blocks.load(Ordering::Relaxed),
            uptime_seconds: uptime.as_secs(),
            mining_address: self.config.mining_address.clone(),
        }
    }
}
