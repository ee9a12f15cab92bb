//! Vote Runtime - pending-state execution for the voting block maker
//!
//! This crate provides everything below the consensus layer:
//! - Account state with snapshots and revert
//! - Transaction application with gas accounting
//! - Transaction pool and price/nonce ordering
//! - The pending block and its finalization
//! - An in-memory chain that validates imported blocks

pub mod chain;
pub mod keys;
pub mod pending;
pub mod processor;
pub mod state;
pub mod txpool;
pub mod types;

pub use chain::{dev_genesis, ChainError, ChainEvent, ChainStore, Genesis, MemoryChain};
pub use keys::{KeyManager, LocalKeystore};
pub use pending::{Excluded, PendingBuilder, PendingConfig, PendingEvent, PendingState};
pub use processor::{apply_transaction, ExecutionError, GasPool};
pub use state::{Account, StateError, WorldState};
pub use txpool::{PoolError, TxPool, TxSource, TxsByPriceAndNonce};
pub use types::{Address, Block, Bloom, Header, Log, Receipt, SignedTransaction, Transaction, H256};

/// One gwei in wei
pub const GWEI: u128 = 1_000_000_000;

/// One ether in wei
pub const ETHER: u128 = 1_000_000_000 * GWEI;

/// Current wall-clock time in seconds since the epoch
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
