use crate::core::{Block, BlockHeader, Transaction};
use crate::crypto::hash::{Hash256, Hashable};
use crate::error::ValidationError;
use crate::network::sync::PeerTable;
use crate::node::NodeHandle;
use crate::{CoinError, Result};
use bincode::Options;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

pub const PROTOCOL_MAGIC: [u8; 4] = *b"MNC1";
pub const FRAME_HEADER_LEN: usize = 12;
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;
pub const MAX_CHAIN_CHUNK: u64 = 500;
pub const MAX_HEADERS: u64 = 2_000;
pub const MAX_PEER_ADDRESSES: usize = 100;

/// Peer wire messages. Every request is answered by exactly one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Sender's tip; answered with the receiver's own tip.
    AnnounceTip {
        height: u64,
        hash: Hash256,
        listen_addr: Option<String>,
    },
    GetChain { from_height: u64, limit: u64 },
    Chain(Vec<Block>),
    GetHeaders { from_height: u64, count: u64 },
    Headers(Vec<BlockHeader>),
    GetBlock(Hash256),
    Block(Block),
    NotFound,
    SubmitBlock(Block),
    Transaction(Transaction),
    GetPeers,
    Peers(Vec<String>),
    Ack,
    Reject { reason: String },
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::AnnounceTip { .. } => "announce",
            Message::GetChain { .. } => "getchain",
            Message::Chain(_) => "chain",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::GetBlock(_) => "getblock",
            Message::Block(_) => "block",
            Message::NotFound => "notfound",
            Message::SubmitBlock(_) => "submitblock",
            Message::Transaction(_) => "tx",
            Message::GetPeers => "getpeers",
            Message::Peers(_) => "peers",
            Message::Ack => "ack",
            Message::Reject { .. } => "reject",
        }
    }

    pub fn reject(reason: impl ToString) -> Self {
        Message::Reject {
            reason: reason.to_string(),
        }
    }

    fn within_limits(&self) -> bool {
        match self {
            Message::Chain(blocks) => blocks.len() as u64 <= MAX_CHAIN_CHUNK,
            Message::Headers(headers) => headers.len() as u64 <= MAX_HEADERS,
            Message::Peers(addrs) => addrs.len() <= MAX_PEER_ADDRESSES,
            _ => true,
        }
    }
}

fn wire_options() -> impl Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_MESSAGE_SIZE as u64)
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = Hash256::hash(payload);
    let bytes = hash.as_bytes();
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

/// Wire format: MAGIC (4) + LENGTH u32 LE (4) + CHECKSUM (4) + PAYLOAD
pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let payload = wire_options().serialize(message)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(CoinError::Network(format!(
            "Message too large: {} bytes",
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&PROTOCOL_MAGIC);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum(&payload));
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Splits a frame header into payload length and checksum.
pub fn decode_header(header: &[u8; FRAME_HEADER_LEN]) -> Result<(usize, [u8; 4])> {
    if header[..4] != PROTOCOL_MAGIC {
        return Err(CoinError::Network("Invalid protocol magic".to_string()));
    }

    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(CoinError::Network(format!("Message too large: {} bytes", len)));
    }

    Ok((len, [header[8], header[9], header[10], header[11]]))
}

pub fn decode_payload(payload: &[u8], expected_checksum: [u8; 4]) -> Result<Message> {
    if checksum(payload) != expected_checksum {
        return Err(CoinError::Network("Invalid checksum".to_string()));
    }

    let message: Message = wire_options().deserialize(payload)?;
    if !message.within_limits() {
        return Err(CoinError::Network(format!(
            "Collection size limit exceeded in {} message",
            message.name()
        )));
    }
    Ok(message)
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let (len, expected) = decode_header(&header)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode_payload(&payload, expected)
}

/// Answers peer requests from local state. Anything a peer sends is
/// validated before it can change the chain or the pending pool.
pub struct ProtocolHandler {
    node: NodeHandle,
    peers: Arc<Mutex<PeerTable>>,
    sync_trigger: Arc<Notify>,
    listen_addr: Option<String>,
}

impl ProtocolHandler {
    pub fn new(
        node: NodeHandle,
        peers: Arc<Mutex<PeerTable>>,
        sync_trigger: Arc<Notify>,
        listen_addr: Option<String>,
    ) -> Self {
        Self {
            node,
            peers,
            sync_trigger,
            listen_addr,
        }
    }

    pub fn handle_message(&self, message: Message, peer: &str) -> Message {
        log::debug!("📨 Handling {} message from {}", message.name(), peer);

        match message {
            Message::AnnounceTip {
                height,
                hash,
                listen_addr,
            } => self.handle_announce(height, hash, listen_addr),
            Message::GetChain { from_height, limit } => {
                let blocks = self
                    .node
                    .blockchain()
                    .read()
                    .blocks_from(from_height, limit.min(MAX_CHAIN_CHUNK) as usize);
                Message::Chain(blocks)
            }
            Message::GetHeaders { from_height, count } => {
                let headers = self
                    .node
                    .blockchain()
                    .read()
                    .headers(from_height, count.min(MAX_HEADERS) as usize);
                Message::Headers(headers)
            }
            Message::GetBlock(hash) => match self.node.blockchain().read().find_block(&hash) {
                Ok(Some(block)) => Message::Block(block),
                Ok(None) => Message::NotFound,
                Err(e) => {
                    log::error!("Block lookup failed: {}", e);
                    Message::reject(e)
                }
            },
            Message::SubmitBlock(block) => self.handle_block(block, peer),
            Message::Transaction(tx) => self.handle_transaction(tx, peer),
            Message::GetPeers => {
                let mut addrs = self.peers.lock().addresses();
                addrs.truncate(MAX_PEER_ADDRESSES);
                Message::Peers(addrs)
            }
            other => {
                log::debug!("📭 Unexpected {} request from {}", other.name(), peer);
                Message::reject(format!("unexpected {} request", other.name()))
            }
        }
    }

    fn handle_announce(&self, height: u64, hash: Hash256, listen_addr: Option<String>) -> Message {
        let local = self.node.tip();

        if let Some(addr) = listen_addr {
            let mut peers = self.peers.lock();
            if peers.add(&addr) {
                log::info!("🤝 New peer {}", addr);
            }
            peers.record_tip(&addr, height, hash);
        }
        if height > local.height {
            self.sync_trigger.notify_one();
        }

        Message::AnnounceTip {
            height: local.height,
            hash: local.hash,
            listen_addr: self.listen_addr.clone(),
        }
    }

    fn handle_block(&self, block: Block, peer: &str) -> Message {
        let hash = block.hash();
        let height = block.header.height;
        let tip = self.node.tip();

        if self.node.blockchain().read().contains(&hash) {
            return Message::Ack;
        }
        if block.header.previous_hash != tip.hash {
            if height > tip.height {
                log::info!("🔀 Block {} from {} does not extend our tip, syncing", height, peer);
                self.sync_trigger.notify_one();
            }
            return Message::reject(ValidationError::UnknownAncestor(block.header.previous_hash));
        }

        match self.node.process_block(block) {
            Ok(_) => {
                log::info!("📦 Accepted block {} from {}", height, peer);
                Message::Ack
            }
            Err(e) => {
                log::warn!("❌ Rejected block {} from {}: {}", height, peer, e);
                Message::reject(e)
            }
        }
    }

    fn handle_transaction(&self, tx: Transaction, peer: &str) -> Message {
        match self.node.submit_transaction(tx) {
            Ok(txid) => {
                log::debug!("💰 Accepted transaction {} from {}", txid, peer);
                Message::Ack
            }
            Err(ValidationError::AlreadyKnown(_)) => Message::Ack,
            Err(e) => {
                log::debug!("❌ Rejected transaction from {}: {}", peer, e);
                Message::reject(e)
            }
        }
    }
}
