//! Persistent chain storage backed by sled

pub mod database;

pub use database::{ChainCommit, Database, StoredChain};
