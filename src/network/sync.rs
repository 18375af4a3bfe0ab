use crate::core::{Block, ChainTip, ChainUpdate, Transaction};
use crate::crypto::hash::{Hash256, Hashable};
use crate::error::ValidationError;
use crate::network::protocol::{Message, MAX_CHAIN_CHUNK};
use crate::network::transport::PeerTransport;
use crate::node::{BlockRef, NodeHandle};
use crate::{CoinError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::MissedTickBehavior;

/// Times the ancestor search is repeated when the local chain moves under a
/// download.
const MAX_ANCESTOR_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sync_interval: Duration,
    pub max_peers: usize,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Blocks requested per `GetChain`.
    pub chain_chunk: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(10),
            max_peers: 32,
            retry_base: Duration::from_secs(5),
            retry_max: Duration::from_secs(300),
            chain_chunk: MAX_CHAIN_CHUNK,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: String,
    pub height: u64,
    pub tip: Option<Hash256>,
    pub last_seen: Option<Instant>,
    pub failures: u32,
    pub next_retry: Option<Instant>,
}

impl PeerInfo {
    fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            height: 0,
            tip: None,
            last_seen: None,
            failures: 0,
            next_retry: None,
        }
    }

    pub fn is_eligible(&self, now: Instant) -> bool {
        self.next_retry.map_or(true, |retry| retry <= now)
    }
}

/// Known peers keyed by their listening address, bounded by `max_peers`.
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<String, PeerInfo>,
    local_addr: Option<String>,
    max_peers: usize,
    retry_base: Duration,
    retry_max: Duration,
}

impl PeerTable {
    pub fn new(config: &SyncConfig, local_addr: Option<String>) -> Self {
        Self {
            peers: HashMap::new(),
            local_addr,
            max_peers: config.max_peers,
            retry_base: config.retry_base,
            retry_max: config.retry_max,
        }
    }

    /// Returns true if `addr` was not known before. A full table only makes
    /// room by dropping its most-failing peer.
    pub fn add(&mut self, addr: &str) -> bool {
        if addr.is_empty() || self.local_addr.as_deref() == Some(addr) || self.peers.contains_key(addr) {
            return false;
        }

        if self.peers.len() >= self.max_peers {
            let worst = self
                .peers
                .values()
                .filter(|peer| peer.failures > 0)
                .max_by_key(|peer| peer.failures)
                .map(|peer| peer.addr.clone());
            match worst {
                Some(worst) => {
                    log::debug!("Dropping unreliable peer {}", worst);
                    self.peers.remove(&worst);
                }
                None => return false,
            }
        }

        self.peers.insert(addr.to_string(), PeerInfo::new(addr));
        true
    }

    pub fn remove(&mut self, addr: &str) -> Option<PeerInfo> {
        self.peers.remove(addr)
    }

    pub fn get(&self, addr: &str) -> Option<&PeerInfo> {
        self.peers.get(addr)
    }

    pub fn record_tip(&mut self, addr: &str, height: u64, tip: Hash256) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.height = height;
            peer.tip = Some(tip);
            peer.last_seen = Some(Instant::now());
        }
    }

    pub fn record_success(&mut self, addr: &str) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.failures = 0;
            peer.next_retry = None;
            peer.last_seen = Some(Instant::now());
        }
    }

    /// Counts a failure and schedules the next attempt. Returns the delay.
    pub fn record_failure(&mut self, addr: &str) -> Option<Duration> {
        let peer = self.peers.get_mut(addr)?;
        peer.failures = peer.failures.saturating_add(1);

        let factor = 2u32.saturating_pow(peer.failures);
        let delay = self.retry_base.saturating_mul(factor).min(self.retry_max);
        peer.next_retry = Some(Instant::now() + delay);
        Some(delay)
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.peers.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub fn eligible(&self, now: Instant) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .peers
            .values()
            .filter(|peer| peer.is_eligible(now))
            .map(|peer| peer.addr.clone())
            .collect();
        addrs.sort();
        addrs
    }

    /// Eligible peers ahead of `local_height`, highest first.
    pub fn candidates(&self, local_height: u64, now: Instant) -> Vec<PeerInfo> {
        let mut ahead: Vec<PeerInfo> = self
            .peers
            .values()
            .filter(|peer| peer.is_eligible(now) && peer.height > local_height)
            .cloned()
            .collect();
        ahead.sort_by(|a, b| b.height.cmp(&a.height).then_with(|| a.addr.cmp(&b.addr)));
        ahead
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn unexpected(addr: &str, message: &Message) -> CoinError {
    match message {
        Message::Reject { reason } => CoinError::Network(format!("{} rejected request: {}", addr, reason)),
        other => CoinError::Network(format!("{} sent unexpected {} response", addr, other.name())),
    }
}

/// Keeps the local chain converged with peers: announces the tip, finds
/// longer chains, downloads them in chunks and hands them to fork choice.
pub struct Synchronizer<T: PeerTransport> {
    node: NodeHandle,
    peers: Arc<Mutex<PeerTable>>,
    transport: T,
    config: SyncConfig,
    listen_addr: Option<String>,
    trigger: Arc<Notify>,
}

impl<T: PeerTransport> Synchronizer<T> {
    pub fn new(
        node: NodeHandle,
        peers: Arc<Mutex<PeerTable>>,
        transport: T,
        config: SyncConfig,
        listen_addr: Option<String>,
        trigger: Arc<Notify>,
    ) -> Self {
        Self {
            node,
            peers,
            transport,
            config,
            listen_addr,
            trigger,
        }
    }

    pub fn peers(&self) -> &Arc<Mutex<PeerTable>> {
        &self.peers
    }

    /// Sync loop: one round per interval, or sooner when a peer reports a
    /// longer chain. Ends on shutdown or a fatal storage error.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.sync_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.trigger.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.sync_round().await {
                if e.is_fatal() {
                    log::error!("💥 Sync stopped: {}", e);
                    return Err(e);
                }
                log::warn!("Sync round failed: {}", e);
            }
        }

        log::info!("🛑 Sync stopped");
        Ok(())
    }

    /// Announce, exchange peers, then sync from the highest peer ahead of
    /// us. A peer that fails is backed off and the next one is tried.
    pub async fn sync_round(&self) -> Result<Option<ChainUpdate>> {
        self.announce().await;
        self.exchange_peers().await;

        let candidates = self.peers.lock().candidates(self.node.tip().height, Instant::now());
        for peer in candidates {
            if peer.height <= self.node.tip().height {
                continue;
            }
            match self.sync_with(&peer.addr, peer.height).await {
                Ok(update) => {
                    self.peers.lock().record_success(&peer.addr);
                    return Ok(update);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => self.penalize(&peer.addr, &e),
            }
        }

        Ok(None)
    }

    pub async fn announce(&self) {
        let tip = self.node.tip();
        let targets = self.peers.lock().eligible(Instant::now());

        for addr in targets {
            let message = Message::AnnounceTip {
                height: tip.height,
                hash: tip.hash,
                listen_addr: self.listen_addr.clone(),
            };
            match self.transport.request(&addr, message).await {
                Ok(Message::AnnounceTip { height, hash, .. }) => {
                    let mut peers = self.peers.lock();
                    peers.record_tip(&addr, height, hash);
                    // A claimed longer chain only clears failures once it is served.
                    if height <= tip.height {
                        peers.record_success(&addr);
                    }
                }
                Ok(other) => self.penalize(&addr, &unexpected(&addr, &other)),
                Err(e) => self.penalize(&addr, &e),
            }
        }
    }

    pub async fn exchange_peers(&self) {
        let targets = self.peers.lock().eligible(Instant::now());

        for addr in targets {
            match self.transport.request(&addr, Message::GetPeers).await {
                Ok(Message::Peers(addrs)) => {
                    let mut peers = self.peers.lock();
                    for discovered in addrs {
                        if peers.add(&discovered) {
                            log::info!("🔍 Discovered peer {} via {}", discovered, addr);
                        }
                    }
                }
                Ok(other) => self.penalize(&addr, &unexpected(&addr, &other)),
                Err(e) => self.penalize(&addr, &e),
            }
        }
    }

    /// Downloads `addr`'s chain above the common ancestor and adopts it if
    /// it is longer and valid. Fails if the peer does not serve the height it
    /// announced.
    pub async fn sync_with(&self, addr: &str, peer_height: u64) -> Result<Option<ChainUpdate>> {
        let mut result: Option<ChainUpdate> = None;
        let mut retries = 0;

        loop {
            match self.download(addr, peer_height, &mut result).await {
                Ok(()) => break,
                Err(CoinError::Validation(ValidationError::UnknownAncestor(_)))
                    if retries < MAX_ANCESTOR_RETRIES =>
                {
                    retries += 1;
                    log::debug!("🔁 Local chain moved while syncing from {}, locating ancestor again", addr);
                }
                Err(CoinError::Validation(reason)) => {
                    return Err(CoinError::PeerGaveInvalidChain {
                        peer: addr.to_string(),
                        reason,
                    })
                }
                Err(e) => return Err(e),
            }
        }

        let local_height = self.node.tip().height;
        if local_height < peer_height {
            return Err(CoinError::Network(format!(
                "{} announced height {} but served a chain only reaching {}",
                addr, peer_height, local_height
            )));
        }
        Ok(result)
    }

    /// One pass of ancestor search and chunked download. Stops early once the
    /// local chain is at least as long as the peer's branch.
    async fn download(&self, addr: &str, peer_height: u64, result: &mut Option<ChainUpdate>) -> Result<()> {
        let ancestor = self.find_common_ancestor(addr, peer_height).await?;
        log::info!(
            "🔄 Syncing from {} (height {}), common ancestor at {}",
            addr,
            peer_height,
            ancestor
        );

        let chunk = self.config.chain_chunk.clamp(1, MAX_CHAIN_CHUNK);
        let mut next_height = ancestor + 1;
        let mut segment: Vec<Block> = Vec::new();

        while next_height <= peer_height {
            let limit = chunk.min(peer_height - next_height + 1);
            let request = Message::GetChain {
                from_height: next_height,
                limit,
            };
            let blocks = match self.transport.request(addr, request).await? {
                Message::Chain(blocks) => blocks,
                other => return Err(unexpected(addr, &other)),
            };
            if blocks.is_empty() {
                break;
            }
            if blocks.len() as u64 > limit {
                return Err(CoinError::Network(format!(
                    "{} sent {} blocks, asked for {}",
                    addr,
                    blocks.len(),
                    limit
                )));
            }
            self.check_contiguous(addr, &blocks, next_height, segment.last())?;
            next_height += blocks.len() as u64;
            segment.extend(blocks);

            let local_height = self.node.tip().height;
            if segment.last().map_or(false, |block| block.header.height > local_height) {
                match self.apply_segment(addr, std::mem::take(&mut segment))? {
                    Some(update) => *result = Some(merge_updates(result.take(), update)),
                    None => return Ok(()),
                }
            }
        }

        Ok(())
    }

    /// Requests the peer's headers at exponentially growing distance below the
    /// lower of the two tips until one matches the local active chain.
    pub async fn find_common_ancestor(&self, addr: &str, peer_height: u64) -> Result<u64> {
        let mut height = self.node.tip().height.min(peer_height);
        let mut step = 1u64;

        loop {
            let request = Message::GetHeaders {
                from_height: height,
                count: 1,
            };
            let header = match self.transport.request(addr, request).await? {
                Message::Headers(headers) => headers.into_iter().next(),
                other => return Err(unexpected(addr, &other)),
            };
            let header = header.ok_or_else(|| {
                CoinError::Network(format!("{} has no header at height {}", addr, height))
            })?;

            let hash = header.hash();
            if header.height == height && self.node.blockchain().read().hash_at(height) == Some(hash) {
                return Ok(height);
            }
            if height == 0 {
                return Err(CoinError::PeerGaveInvalidChain {
                    peer: addr.to_string(),
                    reason: ValidationError::UnknownAncestor(hash),
                });
            }

            height = height.saturating_sub(step);
            step = step.saturating_mul(2);
        }
    }

    fn check_contiguous(
        &self,
        addr: &str,
        blocks: &[Block],
        first_height: u64,
        previous: Option<&Block>,
    ) -> Result<()> {
        let mut expected_height = first_height;
        let mut parent = previous.map(|block| block.hash());

        for block in blocks {
            if block.header.height != expected_height {
                return Err(CoinError::PeerGaveInvalidChain {
                    peer: addr.to_string(),
                    reason: ValidationError::UnexpectedHeight {
                        expected: expected_height,
                        actual: block.header.height,
                    },
                });
            }
            if let Some(parent) = parent {
                if block.header.previous_hash != parent {
                    return Err(CoinError::PeerGaveInvalidChain {
                        peer: addr.to_string(),
                        reason: ValidationError::BrokenLink {
                            expected: parent,
                            actual: block.header.previous_hash,
                        },
                    });
                }
            }
            parent = Some(block.hash());
            expected_height += 1;
        }

        Ok(())
    }

    /// Fork choice on a downloaded segment. `None` if the local chain grew
    /// past it in the meantime.
    fn apply_segment(&self, addr: &str, segment: Vec<Block>) -> Result<Option<ChainUpdate>> {
        match self.node.accept_chain(segment) {
            Ok(update) => Ok(Some(update)),
            Err(CoinError::Validation(ValidationError::NotLonger { local, offered })) => {
                log::debug!("Chain from {} ends at {}, local tip is {}", addr, offered, local);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn penalize(&self, addr: &str, error: &CoinError) {
        let delay = self.peers.lock().record_failure(addr).unwrap_or_default();
        match error {
            CoinError::PeerGaveInvalidChain { .. } => {
                log::warn!("🚫 {} (retry in {}s)", error, delay.as_secs())
            }
            _ => log::debug!("Peer {} failed: {} (retry in {}s)", addr, error, delay.as_secs()),
        }
    }

    /// Sends `message` to every eligible peer. Returns how many accepted it.
    pub async fn broadcast(&self, message: Message) -> usize {
        let targets = self.peers.lock().eligible(Instant::now());
        let mut delivered = 0;

        for addr in targets {
            match self.transport.request(&addr, message.clone()).await {
                Ok(Message::Ack) => delivered += 1,
                Ok(Message::Reject { reason }) => {
                    log::debug!("Peer {} rejected {}: {}", addr, message.name(), reason)
                }
                Ok(other) => self.penalize(&addr, &unexpected(&addr, &other)),
                Err(e) => self.penalize(&addr, &e),
            }
        }

        delivered
    }

    /// Pushes each new tip block and each locally accepted transaction to
    /// peers.
    pub async fn run_relay(
        self: Arc<Self>,
        mut tip_rx: watch::Receiver<ChainTip>,
        mut tx_rx: mpsc::UnboundedReceiver<Transaction>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                changed = tip_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let tip = *tip_rx.borrow_and_update();
                    if let Some(block) = self.node.get_block(BlockRef::Hash(tip.hash)) {
                        let delivered = self.broadcast(Message::SubmitBlock(block)).await;
                        log::debug!("📡 Relayed block {} to {} peers", tip.height, delivered);
                    }
                }
                tx = tx_rx.recv() => {
                    let Some(tx) = tx else {
                        break;
                    };
                    let txid = tx.id();
                    let delivered = self.broadcast(Message::Transaction(tx)).await;
                    log::debug!("📡 Relayed transaction {} to {} peers", txid, delivered);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn merge_updates(previous: Option<ChainUpdate>, next: ChainUpdate) -> ChainUpdate {
    match previous {
        None => next,
        Some(mut merged) => {
            merged.detached.extend(next.detached);
            merged.attached.extend(next.attached);
            merged
        }
    }
}
