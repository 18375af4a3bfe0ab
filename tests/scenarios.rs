use minicoin::config::Config;
use minicoin::consensus::params::{ConsensusParams, GENESIS_SEED};
use minicoin::core::{Block, Blockchain, Mempool, OutPoint, Transaction, TxOutput};
use minicoin::crypto::{Hashable, KeyPair};
use minicoin::mining::{Miner, MinerConfig, SearchOutcome};
use minicoin::network::{Message, MemoryTransport, PeerTable, PeerTransport, ProtocolHandler, SyncConfig, Synchronizer};
use minicoin::node::{BlockRef, Node, NodeHandle};
use minicoin::storage::Database;
use minicoin::{CoinError, Result, ValidationError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Notify;

struct TestNode {
    node: NodeHandle,
    sync: Synchronizer<MemoryTransport>,
    _dir: TempDir,
}

fn open_chain(dir: &TempDir) -> Result<Blockchain> {
    Blockchain::open(Database::open(dir.path())?, ConsensusParams::regtest(), false)
}

fn spawn_node(name: &str, transport: &MemoryTransport) -> Result<TestNode> {
    let dir = TempDir::new()?;
    let (node, _) = NodeHandle::new(open_chain(&dir)?, Mempool::default());
    let config = SyncConfig::default();
    let peers = Arc::new(Mutex::new(PeerTable::new(&config, Some(name.to_string()))));
    let trigger = Arc::new(Notify::new());

    let handler = ProtocolHandler::new(node.clone(), peers.clone(), trigger.clone(), Some(name.to_string()));
    transport.register(name, Arc::new(handler));
    let sync = Synchronizer::new(node.clone(), peers, transport.clone(), config, Some(name.to_string()), trigger);

    Ok(TestNode { node, sync, _dir: dir })
}

fn solve(mut block: Block) -> Block {
    while !block.meets_target() {
        block.header.nonce += 1;
    }
    block
}

/// Child of the node's tip paying subsidy plus fees to `miner`.
fn candidate(node: &NodeHandle, miner: &KeyPair, txs: Vec<Transaction>) -> Result<Block> {
    let chain = node.blockchain().read();
    let next = chain.next_block();

    let mut fees = 0;
    for tx in &txs {
        fees += chain
            .validator()
            .validate_transaction(tx, chain.utxo_set(), next.height)?;
    }
    let reward = chain.monetary().subsidy(next.height) + fees;

    let mut transactions = vec![Transaction::new_coinbase(miner.address(), reward, next.height)];
    transactions.extend(txs);
    Ok(Block::new(
        next.parent_hash,
        transactions,
        next.target_bits,
        next.height,
        next.median_time_past + 1,
    ))
}

fn mine(node: &NodeHandle, miner: &KeyPair, txs: Vec<Transaction>) -> Result<Block> {
    let block = solve(candidate(node, miner, txs)?);
    node.process_block(block.clone())?;
    Ok(block)
}

fn genesis_output(node: &NodeHandle) -> OutPoint {
    let genesis = node.get_block(BlockRef::Height(0)).expect("genesis");
    OutPoint::new(genesis.transactions[0].id(), 0)
}

#[tokio::test]
async fn reorganizes_to_longer_peer_chain() -> Result<()> {
    let transport = MemoryTransport::new();
    let local = spawn_node("local", &transport)?;
    let peer = spawn_node("peer", &transport)?;
    let owner = KeyPair::from_seed(GENESIS_SEED)?;
    let local_miner = KeyPair::from_seed(b"local miner")?;
    let peer_miner = KeyPair::from_seed(b"peer miner")?;
    let carol = KeyPair::from_seed(b"carol")?;

    // Shared block 1, then local [G,1,2] against peer [G,1,2',3'].
    let first = mine(&local.node, &local_miner, vec![])?;
    peer.node.process_block(first)?;

    let payment = Transaction::new_signed(
        &[(genesis_output(&local.node), &owner)],
        vec![TxOutput::new(1_000, carol.address())],
    )?;
    let second = mine(&local.node, &local_miner, vec![payment.clone()])?;
    mine(&peer.node, &peer_miner, vec![])?;
    mine(&peer.node, &peer_miner, vec![])?;
    assert_eq!(local.node.get_balance(&carol.address()), 1_000);

    local.sync.peers().lock().add("peer");
    let update = local.sync.sync_round().await?.expect("local should reorganize");

    assert!(update.is_reorg());
    assert_eq!(update.fork_height, 1);
    assert_eq!(update.detached, vec![second.clone()]);
    assert_eq!(local.node.tip(), peer.node.tip());
    assert_eq!(local.node.tip().height, 3);

    let peer_replay = peer.node.blockchain().read().replay()?;
    assert_eq!(local.node.blockchain().read().utxo_set(), &peer_replay);
    for (vout, _) in second.transactions[0].outputs.iter().enumerate() {
        let outpoint = OutPoint::new(second.transactions[0].id(), vout as u32);
        assert!(!local.node.blockchain().read().utxo_set().contains(&outpoint));
    }
    assert_eq!(local.node.get_balance(&carol.address()), 0);
    assert!(local.node.mempool().lock().contains(&payment.id()));
    Ok(())
}

#[tokio::test]
async fn equal_length_fork_keeps_first_seen() -> Result<()> {
    let transport = MemoryTransport::new();
    let local = spawn_node("local", &transport)?;
    let peer = spawn_node("peer", &transport)?;

    let ours = mine(&local.node, &KeyPair::from_seed(b"ours")?, vec![])?;
    mine(&peer.node, &KeyPair::from_seed(b"theirs")?, vec![])?;

    local.sync.peers().lock().add("peer");
    assert!(local.sync.sync_round().await?.is_none());
    assert_eq!(local.node.tip().hash, ours.hash());

    let outcome = local.sync.sync_with("peer", 1).await?;
    assert!(outcome.is_none());
    assert_eq!(local.node.tip().hash, ours.hash());
    Ok(())
}

#[test]
fn double_spend_race_mines_exactly_one() -> Result<()> {
    let dir = TempDir::new()?;
    let (node, _) = NodeHandle::new(open_chain(&dir)?, Mempool::default());
    let owner = KeyPair::from_seed(GENESIS_SEED)?;
    let alice = KeyPair::from_seed(b"alice")?;
    let bob = KeyPair::from_seed(b"bob")?;
    let funding = genesis_output(&node);

    let to_alice = Transaction::new_signed(&[(funding, &owner)], vec![TxOutput::new(500, alice.address())])?;
    let to_bob = Transaction::new_signed(&[(funding, &owner)], vec![TxOutput::new(700, bob.address())])?;
    let submitters: Vec<_> = [to_alice.clone(), to_bob.clone()]
        .into_iter()
        .map(|tx| {
            let node = node.clone();
            std::thread::spawn(move || node.submit_transaction(tx))
        })
        .collect();
    for submitter in submitters {
        submitter.join().expect("submitter thread")?;
    }
    assert_eq!(node.mempool().lock().len(), 2);

    let miner = Miner::new(
        node.blockchain().clone(),
        node.mempool().clone(),
        MinerConfig::new(KeyPair::from_seed(b"miner")?.address()),
    )?;
    miner.mine_next_block()?;
    miner.mine_next_block()?;

    let chain = node.blockchain().read();
    let mined: Vec<Transaction> = (1..=chain.height())
        .filter_map(|height| chain.block_at(height))
        .flat_map(|block| block.transactions.iter().skip(1).cloned())
        .collect();
    let included = [&to_alice, &to_bob]
        .iter()
        .filter(|tx| mined.contains(tx))
        .count();
    assert_eq!(included, 1);
    assert!(node.mempool().lock().is_empty());

    let loser = if mined.contains(&to_alice) { &to_bob } else { &to_alice };
    assert!(matches!(
        chain.validator().validate_transaction(loser, chain.utxo_set(), chain.height() + 1),
        Err(ValidationError::UnknownInput { .. })
    ));
    assert_eq!(
        node.get_balance(&alice.address()) + node.get_balance(&bob.address()),
        if mined.contains(&to_alice) { 500 } else { 700 }
    );
    Ok(())
}

#[test]
fn tip_change_abandons_search() -> Result<()> {
    let dir = TempDir::new()?;
    let (node, _) = NodeHandle::new(open_chain(&dir)?, Mempool::default());
    let config = MinerConfig::new(KeyPair::from_seed(b"miner")?.address());
    let miner = Miner::new(node.blockchain().clone(), node.mempool().clone(), config.clone())?;

    let (template, tip_rx) = miner.build_template()?;
    mine(&node, &KeyPair::from_seed(b"competitor")?, vec![])?;

    let running = AtomicBool::new(true);
    let hashes = AtomicU64::new(0);
    let outcome = Miner::search(template.block.clone(), 0, &config, &tip_rx, &running, &hashes);
    assert_eq!(outcome, SearchOutcome::Stale);

    // The obsolete candidate cannot be forced in either.
    let stale = solve(template.block);
    let err = node.process_block(stale).unwrap_err();
    assert!(matches!(err.validation(), Some(ValidationError::UnexpectedHeight { .. })));
    assert_eq!(node.tip().height, 1);
    Ok(())
}

#[test]
fn forged_signature_is_never_applied() -> Result<()> {
    let dir = TempDir::new()?;
    let (node, _) = NodeHandle::new(open_chain(&dir)?, Mempool::default());
    let owner = KeyPair::from_seed(GENESIS_SEED)?;
    let thief = KeyPair::from_seed(b"thief")?;
    let funding = genesis_output(&node);

    let honest = Transaction::new_signed(&[(funding, &owner)], vec![TxOutput::new(10, owner.address())])?;
    let mut forged = honest.clone();
    forged.outputs[0].address = thief.address();

    assert!(matches!(
        node.submit_transaction(forged.clone()),
        Err(ValidationError::InvalidSignature(0))
    ));

    let utxos_before = node.blockchain().read().utxo_set().clone();
    let mut block = candidate(&node, &thief, vec![honest])?;
    block.transactions[1] = forged;
    block.header.merkle_root = Block::calculate_merkle_root(&block.transactions);
    let block = solve(block);

    let err = node.process_block(block).unwrap_err();
    assert!(matches!(err.validation(), Some(ValidationError::InvalidSignature(0))));
    assert_eq!(node.tip().height, 0);
    assert_eq!(node.blockchain().read().utxo_set(), &utxos_before);
    assert_eq!(node.get_balance(&thief.address()), 0);
    Ok(())
}

#[test]
fn block_without_work_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let (node, _) = NodeHandle::new(open_chain(&dir)?, Mempool::default());

    let mut block = candidate(&node, &KeyPair::from_seed(b"lazy")?, vec![])?;
    while block.meets_target() {
        block.header.nonce += 1;
    }

    let err = node.process_block(block).unwrap_err();
    assert!(matches!(err.validation(), Some(ValidationError::InsufficientWork(_))));
    assert_eq!(node.tip().height, 0);
    Ok(())
}

#[test]
fn replay_and_supply_invariants() -> Result<()> {
    let dir = TempDir::new()?;
    let miner = KeyPair::from_seed(b"miner")?;
    let owner = KeyPair::from_seed(GENESIS_SEED)?;
    let payee = KeyPair::from_seed(b"payee")?;

    let expected_utxos = {
        let (node, _) = NodeHandle::new(open_chain(&dir)?, Mempool::default());
        let mut spendable = vec![(genesis_output(&node), owner.clone())];

        for round in 0..6u64 {
            let before = node.blockchain().read().utxo_set().total_value();
            let txs = match spendable.pop() {
                Some((outpoint, key)) => {
                    let value = node
                        .blockchain()
                        .read()
                        .utxo_set()
                        .get(&outpoint)
                        .map(|entry| entry.value)
                        .unwrap_or_default();
                    vec![Transaction::new_signed(
                        &[(outpoint, &key)],
                        vec![TxOutput::new(value - 100 - round, payee.address())],
                    )?]
                }
                None => vec![],
            };

            let block = mine(&node, &miner, txs)?;
            let height = block.header.height;
            let subsidy = node.blockchain().read().monetary().subsidy(height);
            assert_eq!(node.blockchain().read().utxo_set().total_value(), before + subsidy);

            let payment = block.transactions.get(1).map(|tx| OutPoint::new(tx.id(), 0));
            if let Some(outpoint) = payment {
                spendable.push((outpoint, payee.clone()));
            }
        }

        let chain = node.blockchain().read();
        assert_eq!(chain.utxo_set().total_value(), chain.total_supply());
        assert_eq!(&chain.replay()?, chain.utxo_set());

        let mut consumed = HashSet::new();
        for height in 0..=chain.height() {
            let block = chain.block_at(height).expect("block on chain");
            for tx in &block.transactions {
                for input in &tx.inputs {
                    assert!(consumed.insert(input.previous_output), "outpoint spent twice");
                }
            }
        }
        chain.utxo_set().clone()
    };

    let reopened = Blockchain::open(Database::open(dir.path())?, ConsensusParams::regtest(), true)?;
    assert_eq!(reopened.height(), 6);
    assert_eq!(reopened.utxo_set(), &expected_utxos);
    Ok(())
}

/// Peer that serves a fixed chain, valid or not.
#[derive(Clone)]
struct ScriptedPeer {
    blocks: Arc<Vec<Block>>,
}

impl PeerTransport for ScriptedPeer {
    fn request(&self, _addr: &str, message: Message) -> impl Future<Output = Result<Message>> + Send {
        let blocks = self.blocks.clone();
        async move {
            let tip = blocks.last().expect("scripted chain");
            let response = match message {
                Message::AnnounceTip { .. } => Message::AnnounceTip {
                    height: tip.header.height,
                    hash: tip.hash(),
                    listen_addr: None,
                },
                Message::GetPeers => Message::Peers(vec![]),
                Message::GetHeaders { from_height, count } => Message::Headers(
                    blocks
                        .iter()
                        .skip(from_height as usize)
                        .take(count as usize)
                        .map(|block| block.header.clone())
                        .collect(),
                ),
                Message::GetChain { from_height, limit } => Message::Chain(
                    blocks
                        .iter()
                        .skip(from_height as usize)
                        .take(limit as usize)
                        .cloned()
                        .collect(),
                ),
                _ => Message::Ack,
            };
            Ok(response)
        }
    }
}

#[tokio::test]
async fn invalid_peer_chain_is_rejected_and_penalized() -> Result<()> {
    let scratch_dir = TempDir::new()?;
    let (scratch, _) = NodeHandle::new(open_chain(&scratch_dir)?, Mempool::default());
    let mallory = KeyPair::from_seed(b"mallory")?;
    let first = mine(&scratch, &mallory, vec![])?;
    let mut second = candidate(&scratch, &mallory, vec![])?;
    while second.meets_target() {
        second.header.nonce += 1;
    }
    let genesis = scratch.get_block(BlockRef::Height(0)).expect("genesis");
    let transport = ScriptedPeer {
        blocks: Arc::new(vec![genesis, first, second]),
    };

    let dir = TempDir::new()?;
    let (node, _) = NodeHandle::new(open_chain(&dir)?, Mempool::default());
    let config = SyncConfig::default();
    let peers = Arc::new(Mutex::new(PeerTable::new(&config, None)));
    peers.lock().add("mallory");
    let sync = Synchronizer::new(node.clone(), peers.clone(), transport, config, None, Arc::new(Notify::new()));
    let tip = node.tip();

    let err = sync.sync_with("mallory", 2).await.unwrap_err();
    match &err {
        CoinError::PeerGaveInvalidChain { peer, reason } => {
            assert_eq!(peer, "mallory");
            assert!(matches!(reason, ValidationError::InsufficientWork(_)));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(node.tip(), tip);

    assert!(sync.sync_round().await?.is_none());
    let record = peers.lock().get("mallory").cloned().expect("mallory");
    assert_eq!(record.failures, 1);
    assert_eq!(node.tip(), tip);
    Ok(())
}

/// Routes "liar" to a peer that claims a long chain but only has genesis.
#[derive(Clone)]
struct LyingPeer {
    honest: MemoryTransport,
    genesis: Block,
}

impl PeerTransport for LyingPeer {
    fn request(&self, addr: &str, message: Message) -> impl Future<Output = Result<Message>> + Send {
        let honest = self.honest.clone();
        let genesis = self.genesis.clone();
        let addr = addr.to_string();
        async move {
            if addr != "liar" {
                return honest.request(&addr, message).await;
            }
            let response = match message {
                Message::AnnounceTip { .. } => Message::AnnounceTip {
                    height: 1000,
                    hash: genesis.hash(),
                    listen_addr: None,
                },
                Message::GetPeers => Message::Peers(vec![]),
                Message::GetHeaders { from_height: 0, .. } => Message::Headers(vec![genesis.header.clone()]),
                Message::GetHeaders { .. } => Message::Headers(vec![]),
                Message::GetChain { .. } => Message::Chain(vec![]),
                _ => Message::Ack,
            };
            Ok(response)
        }
    }
}

#[tokio::test]
async fn unserved_height_falls_back_to_next_peer() -> Result<()> {
    let transport = MemoryTransport::new();
    let honest = spawn_node("honest", &transport)?;
    let miner = KeyPair::from_seed(b"honest miner")?;
    for _ in 0..3 {
        mine(&honest.node, &miner, vec![])?;
    }

    let dir = TempDir::new()?;
    let (node, _) = NodeHandle::new(open_chain(&dir)?, Mempool::default());
    let genesis = node.get_block(BlockRef::Height(0)).expect("genesis");
    let config = SyncConfig::default();
    let peers = Arc::new(Mutex::new(PeerTable::new(&config, None)));
    peers.lock().add("liar");
    peers.lock().add("honest");
    let sync = Synchronizer::new(
        node.clone(),
        peers.clone(),
        LyingPeer { honest: transport, genesis },
        config,
        None,
        Arc::new(Notify::new()),
    );

    let update = sync.sync_round().await?.expect("synced from the honest peer");
    assert_eq!(update.attached.last().map(|b| b.header.height), Some(3));
    assert_eq!(node.tip(), honest.node.tip());

    let liar = peers.lock().get("liar").cloned().expect("liar");
    assert_eq!(liar.failures, 1);
    assert!(!liar.is_eligible(Instant::now()));
    assert_eq!(peers.lock().get("honest").map(|p| p.failures), Some(0));

    // Backed off, so the next round neither contacts nor forgives it.
    assert!(sync.sync_round().await?.is_none());
    assert_eq!(peers.lock().get("liar").map(|p| p.failures), Some(1));
    Ok(())
}

type Hook = Box<dyn FnOnce() -> Result<()> + Send>;

/// Runs `hook` once, just before the first block download is answered.
#[derive(Clone)]
struct InterleavedReorg {
    inner: MemoryTransport,
    hook: Arc<Mutex<Option<Hook>>>,
}

impl PeerTransport for InterleavedReorg {
    fn request(&self, addr: &str, message: Message) -> impl Future<Output = Result<Message>> + Send {
        let hook = match message {
            Message::GetChain { .. } => self.hook.lock().take(),
            _ => None,
        };
        let inner = self.inner.clone();
        let addr = addr.to_string();
        async move {
            if let Some(hook) = hook {
                hook()?;
            }
            inner.request(&addr, message).await
        }
    }
}

#[tokio::test]
async fn local_reorg_during_download_does_not_blame_peer() -> Result<()> {
    let transport = MemoryTransport::new();
    let local = spawn_node("local", &transport)?;
    let peer = spawn_node("peer", &transport)?;
    let side = spawn_node("side", &transport)?;

    // local [G,1,2], peer [G,1,2,3,4,5], side [G,1,2',3'].
    let ours = KeyPair::from_seed(b"ours")?;
    let first = mine(&local.node, &ours, vec![])?;
    let second = mine(&local.node, &ours, vec![])?;
    peer.node.process_block(first.clone())?;
    peer.node.process_block(second)?;
    let theirs = KeyPair::from_seed(b"theirs")?;
    for _ in 0..3 {
        mine(&peer.node, &theirs, vec![])?;
    }
    side.node.process_block(first)?;
    let other = KeyPair::from_seed(b"other")?;
    let side_blocks = vec![mine(&side.node, &other, vec![])?, mine(&side.node, &other, vec![])?];

    let target = local.node.clone();
    let hook: Hook = Box::new(move || target.accept_chain(side_blocks).map(|_| ()));
    let config = SyncConfig::default();
    let peers = Arc::new(Mutex::new(PeerTable::new(&config, None)));
    peers.lock().add("peer");
    let sync = Synchronizer::new(
        local.node.clone(),
        peers.clone(),
        InterleavedReorg {
            inner: transport,
            hook: Arc::new(Mutex::new(Some(hook))),
        },
        config,
        None,
        Arc::new(Notify::new()),
    );

    let update = sync.sync_round().await?.expect("caught up with the peer");
    assert_eq!(update.attached.last().map(|b| b.header.height), Some(5));
    assert_eq!(local.node.tip(), peer.node.tip());
    assert_eq!(peers.lock().get("peer").map(|p| p.failures), Some(0));
    Ok(())
}

#[tokio::test]
async fn nodes_converge_over_tcp() -> Result<()> {
    let miner_dir = TempDir::new()?;
    let follower_dir = TempDir::new()?;

    let miner_listener = TcpListener::bind("127.0.0.1:0").await?;
    let miner_addr = miner_listener.local_addr()?.to_string();
    let follower_listener = TcpListener::bind("127.0.0.1:0").await?;
    let follower_addr = follower_listener.local_addr()?.to_string();

    let mut miner_config = Config::regtest(miner_dir.path());
    miner_config.network.listen_addr = miner_addr.clone();
    miner_config.mining.enabled = true;
    miner_config.mining.address = Some(KeyPair::from_seed(b"tcp miner")?.address());

    let mut follower_config = Config::regtest(follower_dir.path());
    follower_config.network.listen_addr = follower_addr;
    follower_config.network.peers = vec![miner_addr];

    let miner = Node::open(&miner_config, miner_config.network.transport())?;
    let follower = Node::open(&follower_config, follower_config.network.transport())?;
    let miner_handle = miner.handle();
    let follower_handle = follower.handle();

    let miner_task = tokio::spawn(miner.run(Some(miner_listener)));
    let follower_task = tokio::spawn(follower.run(Some(follower_listener)));

    let converged = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            if follower_handle.tip().height >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(converged.is_ok(), "follower never caught up");

    miner_handle.shutdown();
    follower_handle.shutdown();
    miner_task.await.map_err(|e| CoinError::Network(e.to_string()))??;
    follower_task.await.map_err(|e| CoinError::Network(e.to_string()))??;

    let height = follower_handle.tip().height;
    assert_eq!(
        follower_handle.get_block(BlockRef::Height(height)).map(|b| b.hash()),
        miner_handle.get_block(BlockRef::Height(height)).map(|b| b.hash())
    );
    Ok(())
}
