//! Command line interface for the minicoin node

pub mod commands;

pub use commands::run_cli;
