//! Consensus errors

use crate::ledger::LedgerError;
use vote_runtime::{ChainError, StateError, H256};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConsensusError {
    #[error("node synchronising with network")]
    NotSynced,
    #[error("node not configured for voting")]
    NotConfiguredForVoting,
    #[error("node not configured for block creation")]
    NotConfiguredForBlockCreation,
    #[error("{0} is not authorized by the voting ledger")]
    NotAuthorized(vote_runtime::Address),
    #[error("winning parent block {canonical} differs from pending block parent {parent}")]
    CanonicalMismatch { canonical: H256, parent: H256 },
    #[error("no block with enough votes at height {0}")]
    NoCanonicalHash(u64),
    #[error("pending state not built yet")]
    NoPendingState,
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("block finalization failed: {0}")]
    Finalize(#[from] StateError),
    #[error("node not started")]
    NotStarted,
    #[error("node already started")]
    AlreadyStarted,
    #[error("command queue full")]
    Busy,
    #[error("node is shutting down")]
    Shutdown,
    #[error("timeout waiting for {0}")]
    Timeout(&'static str),
}

impl ConsensusError {
    /// Refusals caused by node configuration or eligibility rather than by
    /// the state of the chain. Retrying does not help these.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ConsensusError::NotSynced
                | ConsensusError::NotConfiguredForVoting
                | ConsensusError::NotConfiguredForBlockCreation
                | ConsensusError::NotAuthorized(_)
        )
    }
}
