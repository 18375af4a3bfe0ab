//! Core ledger components

pub mod block;
pub mod blockchain;
pub mod mempool;
pub mod transaction;
pub mod utxo;

pub use block::{Block, BlockHeader};
pub use blockchain::{Blockchain, ChainSummary, ChainTip, ChainUpdate, HeaderSummary, NextBlock};
pub use mempool::Mempool;
pub use transaction::{OutPoint, Transaction, TxInput, TxOutput};
pub use utxo::{BlockUndo, UtxoEntry, UtxoSet};
