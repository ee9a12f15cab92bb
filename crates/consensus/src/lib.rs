//! Vote Consensus - voting-based block production
//!
//! Architecture:
//! - A scheduling strategy issues vote and create-block commands on random deadlines
//! - The voting node's single event loop owns the pending state and executes commands
//! - The voting ledger, reached over RPC, decides which parent is canonical
//! - Block creation refused by the ledger triggers a re-vote and a rebuild

pub mod error;
pub mod ledger;
pub mod node;
pub mod strategy;
pub mod types;

#[cfg(test)]
mod tests;

pub use error::ConsensusError;
pub use ledger::{HttpLedgerTransport, LedgerClient, LedgerError, LedgerTransport, VoteCall};
pub use node::{NodeConfig, VotingNode, VotingNodeBuilder, VotingNodeHandle};
pub use strategy::{BlockMakerStrategy, RandomDeadlineStrategy, StrategyConfig, StrategyContext};
pub use types::{Command, CommandSender, NodeInfo, NodeStats, StrategyInfo, StrategyStatus};
