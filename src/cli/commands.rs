use crate::config::Config;
use crate::consensus::params::ConsensusParams;
use crate::core::{Blockchain, ChainSummary};
use crate::crypto::hash::Hashable;
use crate::crypto::keys::is_valid_address;
use crate::node::{BlockRef, Node, NodeHandle};
use crate::storage::Database;
use crate::{CoinError, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use tokio::net::TcpListener;

const COIN: u64 = 100_000_000;

#[derive(Parser)]
#[command(name = "minicoind")]
#[command(about = "minicoin node - a minimal proof-of-work cryptocurrency")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Data directory")]
    pub data_dir: Option<String>,

    #[arg(long, help = "Enable debug logging")]
    pub debug: bool,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<String>,

    #[arg(long, help = "Use regtest consensus parameters")]
    pub regtest: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the node
    Start {
        #[arg(long, help = "Enable mining on startup")]
        mine: bool,

        #[arg(long, help = "Mining address")]
        mining_address: Option<String>,

        #[arg(long = "peer", help = "Peer address (host:port), repeatable")]
        peers: Vec<String>,

        #[arg(long, help = "Listen address for peer connections")]
        listen: Option<String>,

        #[arg(long, help = "Address announced to peers")]
        advertise: Option<String>,

        #[arg(long, help = "Replay and verify the stored chain before starting")]
        verify: bool,
    },

    /// Blockchain information commands
    #[command(subcommand)]
    Chain(ChainCommands),

    /// Show the confirmed balance of an address
    Balance { address: String },

    /// List unspent outputs of an address
    Utxos { address: String },
}

#[derive(Subcommand)]
pub enum ChainCommands {
    /// Show chain information
    Info,

    /// Show a block by height or hash
    Block {
        identifier: String,
        #[arg(long, help = "List transactions")]
        verbose: bool,
    },

    /// Replay the stored chain from genesis and check it against the stored
    /// UTXO snapshot without modifying it
    Verify,
}

pub async fn run_cli(config: Config) -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging once
    let _ = if cli.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).try_init()
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init()
    };

    let mut config = match &cli.config {
        Some(path) => Config::load_from(Path::new(path))
            .map_err(|e| CoinError::Config(format!("Failed to load {}: {}", path, e)))?,
        None => config,
    };
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir.into();
    }
    if cli.regtest {
        config.consensus = ConsensusParams::regtest();
    }

    // Ensure data directory exists
    std::fs::create_dir_all(&config.storage.data_dir)?;

    match cli.command {
        Commands::Start {
            mine,
            mining_address,
            peers,
            listen,
            advertise,
            verify,
        } => {
            if mine {
                config.mining.enabled = true;
            }
            if mining_address.is_some() {
                config.mining.address = mining_address;
            }
            config.network.peers.extend(peers);
            if let Some(listen) = listen {
                config.network.listen_addr = listen;
            }
            if advertise.is_some() {
                config.network.advertise_addr = advertise;
            }
            config.storage.verify_on_startup |= verify;
            start_node(config).await
        }
        Commands::Chain(chain_cmd) => handle_chain_command(&config, chain_cmd),
        Commands::Balance { address } => {
            let node = open_local(&config, false)?;
            check_address(&address)?;
            let balance = node.get_balance(&address);
            println!("💰 Balance of {}: {} MNC", address, format_amount(balance));
            Ok(())
        }
        Commands::Utxos { address } => {
            let node = open_local(&config, false)?;
            check_address(&address)?;
            let utxos = node.get_utxos(&address);
            if utxos.is_empty() {
                println!("No unspent outputs for {}", address);
            }
            for (outpoint, entry) in utxos {
                println!(
                    "{}  {} MNC  height {}{}",
                    outpoint,
                    format_amount(entry.value),
                    entry.height,
                    if entry.is_coinbase { "  (coinbase)" } else { "" }
                );
            }
            Ok(())
        }
    }
}

async fn start_node(config: Config) -> Result<()> {
    println!("🚀 Starting minicoin node...");

    let node = Node::open(&config, config.network.transport())?;
    let listener = TcpListener::bind(&config.network.listen_addr)
        .await
        .map_err(|e| CoinError::Network(format!("Failed to bind {}: {}", config.network.listen_addr, e)))?;

    let tip = node.handle().tip();
    println!("✅ Node started at height {} ({})", tip.height, tip.hash);
    println!("🌐 P2P listen address: {}", config.network.listen_addr);
    if let Some(addr) = config.network.advertised_addr() {
        println!("📣 Advertised address: {}", addr);
    }
    if let Some(address) = &config.mining.address {
        if config.mining.enabled {
            println!("⛏️ Mining to {}", address);
        }
    }
    println!("Press Ctrl+C to stop");

    node.run(Some(listener)).await?;

    println!("👋 Node stopped");
    Ok(())
}

fn open_local(config: &Config, verify: bool) -> Result<NodeHandle> {
    let db = Database::open(&config.storage.data_dir)?;
    let blockchain = Blockchain::open(db, config.consensus.clone(), verify)?;
    let (node, _) = NodeHandle::new(blockchain, Default::default());
    Ok(node)
}

/// Replays the stored chain and compares the result with the stored UTXO
/// snapshot. Nothing is written back.
fn verify_chain(config: &Config) -> Result<ChainSummary> {
    let node = open_local(config, false)?;
    {
        let chain = node.blockchain().read();
        if &chain.replay()? != chain.utxo_set() {
            return Err(CoinError::Storage(format!(
                "UTXO snapshot at height {} disagrees with a replay of the chain; start with --verify to rebuild it",
                chain.height()
            )));
        }
    }
    Ok(node.get_chain_summary())
}

fn check_address(address: &str) -> Result<()> {
    if is_valid_address(address) {
        Ok(())
    } else {
        Err(CoinError::InvalidInput(format!("Invalid address: {}", address)))
    }
}

fn handle_chain_command(config: &Config, cmd: ChainCommands) -> Result<()> {
    match cmd {
        ChainCommands::Info => {
            let node = open_local(config, false)?;
            let summary = node.get_chain_summary();
            println!("⛓️  Blockchain Information:");
            println!("Height: {}", summary.height);
            println!("Tip hash: {}", summary.tip);
            println!("Next target bits: {}", summary.next_target_bits);
            println!("Total supply: {} MNC", format_amount(summary.total_supply));
            println!("Unspent outputs: {}", summary.utxo_count);
            println!();
            println!("Recent blocks:");
            for header in summary.headers {
                println!(
                    "  #{:<6} {}  bits {:<3} txs {:<4} time {}",
                    header.height,
                    header.hash,
                    header.target_bits,
                    header.transaction_count,
                    format_time(header.timestamp)
                );
            }
        }

        ChainCommands::Block { identifier, verbose } => {
            let node = open_local(config, false)?;
            let block_ref: BlockRef = identifier.parse()?;

            match node.get_block(block_ref) {
                Some(block) => {
                    println!("📦 Block Information:");
                    println!("Hash: {}", block.hash());
                    println!("Height: {}", block.header.height);
                    println!("Previous hash: {}", block.header.previous_hash);
                    println!("Merkle root: {}", block.header.merkle_root);
                    println!("Timestamp: {}", format_time(block.header.timestamp));
                    println!("Target bits: {}", block.header.target_bits);
                    println!("Nonce: {}", block.header.nonce);
                    println!("Transactions: {}", block.transactions.len());

                    if verbose {
                        for (i, tx) in block.transactions.iter().enumerate() {
                            let value = tx.total_output_value().unwrap_or(u64::MAX);
                            println!("  Transaction {}: {} ({} MNC)", i, tx.id(), format_amount(value));
                        }
                    }
                }
                None => println!("❌ Block not found: {}", block_ref),
            }
        }

        ChainCommands::Verify => {
            println!("🔍 Replaying chain from genesis...");
            let summary = verify_chain(config)?;
            println!("✅ Chain valid up to height {} ({})", summary.height, summary.tip);
            println!("Total supply: {} MNC", format_amount(summary.total_supply));
        }
    }

    Ok(())
}

fn format_amount(value: u64) -> String {
    format!("{}.{:08}", value / COIN, value % COIN)
}

fn format_time(timestamp: u64) -> String {
    chrono::DateTime::from_timestamp(timestamp as i64, 0)
        .map(|time| time.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::UtxoSet;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_arguments() {
        let cli = Cli::try_parse_from([
            "minicoind",
            "--regtest",
            "start",
            "--mine",
            "--mining-address",
            "mcabc",
            "--peer",
            "10.0.0.1:8333",
            "--peer",
            "10.0.0.2:8333",
            "--listen",
            "127.0.0.1:9000",
        ])
        .expect("valid arguments");

        assert!(cli.regtest);
        match cli.command {
            Commands::Start {
                mine,
                mining_address,
                peers,
                listen,
                ..
            } => {
                assert!(mine);
                assert_eq!(mining_address.as_deref(), Some("mcabc"));
                assert_eq!(peers, vec!["10.0.0.1:8333", "10.0.0.2:8333"]);
                assert_eq!(listen.as_deref(), Some("127.0.0.1:9000"));
            }
            _ => panic!("expected start command"),
        }
    }

    #[test]
    fn test_verify_leaves_snapshot_untouched() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let config = Config::regtest(dir.path());

        let summary = verify_chain(&config)?;
        assert_eq!(summary.height, 0);

        Database::open(&config.storage.data_dir)?.rewrite_utxos(&UtxoSet::new())?;
        assert!(matches!(verify_chain(&config), Err(CoinError::Storage(_))));

        let node = open_local(&config, false)?;
        assert!(node.blockchain().read().utxo_set().is_empty());
        Ok(())
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(50 * COIN), "50.00000000");
        assert_eq!(format_amount(1), "0.00000001");
    }
}
