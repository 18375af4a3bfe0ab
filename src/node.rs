use crate::config::Config;
use crate::core::{Block, Blockchain, ChainSummary, ChainTip, ChainUpdate, Mempool, OutPoint, Transaction, UtxoEntry};
use crate::crypto::hash::Hash256;
use crate::error::ValidationError;
use crate::mining::Miner;
use crate::network::protocol::ProtocolHandler;
use crate::network::sync::{PeerTable, Synchronizer};
use crate::network::transport::{self, PeerTransport};
use crate::storage::Database;
use crate::{CoinError, Result};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinSet;

/// Headers included in a chain summary, newest first.
pub const SUMMARY_HEADERS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Height(u64),
    Hash(Hash256),
}

impl FromStr for BlockRef {
    type Err = CoinError;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(height) = s.parse::<u64>() {
            return Ok(BlockRef::Height(height));
        }
        Hash256::from_hex(s)
            .map(BlockRef::Hash)
            .map_err(|_| CoinError::InvalidInput(format!("Invalid block identifier: {}", s)))
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockRef::Height(height) => write!(f, "height {}", height),
            BlockRef::Hash(hash) => write!(f, "{}", hash),
        }
    }
}

/// Shared entry point to the chain and the pending pool. Cloning is cheap;
/// every clone sees the same state. Lock order is chain before pool.
#[derive(Clone)]
pub struct NodeHandle {
    blockchain: Arc<RwLock<Blockchain>>,
    mempool: Arc<Mutex<Mempool>>,
    tx_relay: mpsc::UnboundedSender<Transaction>,
    shutdown: Arc<watch::Sender<bool>>,
    fatal: Arc<Mutex<Option<String>>>,
}

impl NodeHandle {
    /// The receiver yields every transaction accepted through
    /// `submit_transaction`, for relaying to peers.
    pub fn new(blockchain: Blockchain, mempool: Mempool) -> (Self, mpsc::UnboundedReceiver<Transaction>) {
        let (tx_relay, tx_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let handle = Self {
            blockchain: Arc::new(RwLock::new(blockchain)),
            mempool: Arc::new(Mutex::new(mempool)),
            tx_relay,
            shutdown: Arc::new(shutdown),
            fatal: Arc::new(Mutex::new(None)),
        };
        (handle, tx_rx)
    }

    pub fn blockchain(&self) -> &Arc<RwLock<Blockchain>> {
        &self.blockchain
    }

    pub fn mempool(&self) -> &Arc<Mutex<Mempool>> {
        &self.mempool
    }

    pub fn tip(&self) -> ChainTip {
        self.blockchain.read().tip()
    }

    /// Validates `tx` against the current UTXO set and adds it to the
    /// pending pool. Acceptance does not guarantee inclusion in a block.
    pub fn submit_transaction(&self, tx: Transaction) -> std::result::Result<Hash256, ValidationError> {
        let txid = {
            let chain = self.blockchain.read();
            self.mempool.lock().submit(tx.clone(), &chain)?
        };

        if self.tx_relay.send(tx).is_err() {
            log::debug!("No relay running for transaction {}", txid);
        }
        Ok(txid)
    }

    pub fn get_chain_summary(&self) -> ChainSummary {
        self.blockchain.read().summary(SUMMARY_HEADERS)
    }

    /// Looks up a block on the active chain.
    pub fn get_block(&self, block: BlockRef) -> Option<Block> {
        let chain = self.blockchain.read();
        match block {
            BlockRef::Height(height) => chain.block_at(height).cloned(),
            BlockRef::Hash(hash) => chain.block_by_hash(&hash).cloned(),
        }
    }

    pub fn get_balance(&self, address: &str) -> u64 {
        self.blockchain.read().utxo_set().balance(address)
    }

    pub fn get_utxos(&self, address: &str) -> Vec<(OutPoint, UtxoEntry)> {
        self.blockchain.read().utxo_set().utxos_for(address)
    }

    /// Applies a block that extends the current tip.
    pub fn process_block(&self, block: Block) -> Result<ChainUpdate> {
        let result = {
            let mut chain = self.blockchain.write();
            let result = chain.add_block(block);
            if let Ok(update) = &result {
                self.mempool.lock().apply_update(update);
            }
            result
        };
        self.check_fatal(result)
    }

    /// Fork choice over a chain segment from a peer.
    pub fn accept_chain(&self, segment: Vec<Block>) -> Result<ChainUpdate> {
        let result = {
            let mut chain = self.blockchain.write();
            let result = chain.accept_chain(segment);
            if let Ok(update) = &result {
                self.mempool.lock().apply_update(update);
            }
            result
        };
        self.check_fatal(result)
    }

    fn check_fatal<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.fail(e);
            }
        }
        result
    }

    /// Records a fatal error and signals every task to stop.
    pub fn fail(&self, error: &CoinError) {
        log::error!("💥 Fatal error, shutting down: {}", error);
        self.fatal.lock().get_or_insert_with(|| error.to_string());
        self.shutdown.send_replace(true);
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().clone()
    }
}

/// A full node: chain, pending pool, peer protocol, sync and optional miner.
pub struct Node<T: PeerTransport> {
    handle: NodeHandle,
    handler: Arc<ProtocolHandler>,
    synchronizer: Arc<Synchronizer<T>>,
    miner: Option<Arc<Miner>>,
    tx_rx: Option<mpsc::UnboundedReceiver<Transaction>>,
    idle_timeout: Duration,
}

impl<T: PeerTransport> Node<T> {
    /// Opens the chain in the configured data directory.
    pub fn open(config: &Config, transport: T) -> Result<Self> {
        let db = Database::open(&config.storage.data_dir)?;
        let blockchain = Blockchain::open(db, config.consensus.clone(), config.storage.verify_on_startup)?;
        Self::new(blockchain, config, transport)
    }

    pub fn new(blockchain: Blockchain, config: &Config, transport: T) -> Result<Self> {
        let mempool = Mempool::new(config.mining.max_pending_transactions);
        let (handle, tx_rx) = NodeHandle::new(blockchain, mempool);

        let sync_config = config.network.sync_config();
        let advertised = config.network.advertised_addr();
        let mut table = PeerTable::new(&sync_config, advertised.clone());
        for peer in &config.network.peers {
            table.add(peer);
        }
        let peers = Arc::new(Mutex::new(table));
        let trigger = Arc::new(Notify::new());

        let handler = Arc::new(ProtocolHandler::new(
            handle.clone(),
            peers.clone(),
            trigger.clone(),
            advertised.clone(),
        ));
        let synchronizer = Arc::new(Synchronizer::new(
            handle.clone(),
            peers,
            transport,
            sync_config,
            advertised,
            trigger,
        ));

        let miner = if config.mining.enabled {
            let address = config.mining.address.clone().ok_or_else(|| {
                CoinError::Config("Mining address required when mining is enabled".to_string())
            })?;
            let miner = Miner::new(
                handle.blockchain().clone(),
                handle.mempool().clone(),
                config.mining.miner_config(address),
            )?;
            Some(Arc::new(miner))
        } else {
            None
        };

        Ok(Self {
            handle,
            handler,
            synchronizer,
            miner,
            tx_rx: Some(tx_rx),
            idle_timeout: Duration::from_secs(config.network.request_timeout_secs.max(1) * 6),
        })
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    pub fn handler(&self) -> Arc<ProtocolHandler> {
        self.handler.clone()
    }

    pub fn synchronizer(&self) -> Arc<Synchronizer<T>> {
        self.synchronizer.clone()
    }

    pub fn miner(&self) -> Option<Arc<Miner>> {
        self.miner.clone()
    }

    /// Runs the node until ctrl-c, `NodeHandle::shutdown`, or a fatal error.
    /// With a listener, inbound peer connections are served on it.
    pub async fn run(mut self, listener: Option<TcpListener>) -> Result<()> {
        let shutdown_rx = self.handle.subscribe_shutdown();
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        if let Some(listener) = listener {
            tasks.spawn(transport::serve(
                listener,
                self.handler.clone(),
                self.idle_timeout,
                shutdown_rx.clone(),
            ));
        }
        tasks.spawn(self.synchronizer.clone().run(shutdown_rx.clone()));
        if let Some(tx_rx) = self.tx_rx.take() {
            let tip_rx = self.handle.blockchain().read().subscribe();
            tasks.spawn(self.synchronizer.clone().run_relay(tip_rx, tx_rx, shutdown_rx.clone()));
        }
        if let Some(miner) = self.miner.clone() {
            tasks.spawn(async move { miner.run().await });
        }
        log::info!("🚀 Node running at height {}", self.handle.tip().height);

        let mut shutdown = shutdown_rx;
        let outcome = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("🛑 Shutting down node...");
                    break Ok(());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) if e.is_fatal() => {
                        self.handle.fail(&e);
                        break Err(e);
                    }
                    Ok(Err(e)) => log::warn!("Node task ended with error: {}", e),
                    Err(e) => log::error!("Node task panicked: {}", e),
                },
            }
        };

        self.handle.shutdown();
        if let Some(miner) = &self.miner {
            miner.stop();
        }
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!("Some node tasks did not stop in time");
            tasks.abort_all();
        }
        if let Some(miner) = &self.miner {
            let stats = miner.stats();
            log::info!(
                "⛏️ Mined {} blocks ({} hashes, {} stale rounds, {} rejected)",
                stats.blocks_mined,
                stats.total_hashes,
                stats.stale_rounds,
                stats.rejected_blocks
            );
        }

        match (outcome, self.handle.fatal_error()) {
            (Ok(()), Some(reason)) => Err(CoinError::Storage(reason)),
            (outcome, _) => outcome,
        }
    }
}
