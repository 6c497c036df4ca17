//! Plasma child chain node
//!
//! UTXO child chain anchored to a root chain contract by Merkle roots.
//!
//! # Architecture
//!
//! - **Single Writer**: one actor task owns every UTXO and index mutation
//! - **Atomic Commits**: each block lands in one RocksDB write batch
//! - **Root Chain Driven**: deposits, block numbers and exits arrive as
//!   contract events, replayed safely after a restart
//! - **Peer Sync**: line-delimited JSON gossip of transactions and blocks
//!
//! # Invariants
//!
//! - An output is spent at most once, across the pool and committed blocks
//! - A committed block's root equals the Merkle root of its transactions
//! - The head block number never decreases

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod block;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod error;
pub mod event_watcher;
pub mod merkle;
pub mod metrics;
pub mod node;
pub mod root_chain;
pub mod storage;
pub mod sync;
pub mod transaction;
pub mod txpool;

// Re-exports
pub use block::{Block, BlockHeader};
pub use chain::{BlockTag, Chain};
pub use config::Config;
pub use error::{Error, Result};
pub use node::Node;
pub use storage::Storage;
pub use transaction::{Output, Transaction, UtxoPosition};
