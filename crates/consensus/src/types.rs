//! Commands, events and reporting types shared by the node and its strategy

use crate::ConsensusError;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use vote_runtime::{Address, ChainEvent, SignedTransaction, H256};

/// Where the outcome of a command is delivered
pub type Reply = oneshot::Sender<Result<H256, ConsensusError>>;

/// Request handled by the node's event loop
#[derive(Debug)]
pub enum Command {
    /// Cast a vote. A zero `hash` votes for the parent of the pending block.
    Vote {
        height: u64,
        hash: H256,
        reply: Option<Reply>,
    },
    /// Assemble and import a block from the pending state
    CreateBlock { reply: Option<Reply> },
}

impl Command {
    /// Vote for the local head, no reply expected
    pub fn vote_head() -> Self {
        Command::Vote {
            height: 0,
            hash: H256::zero(),
            reply: None,
        }
    }

    pub fn create_block() -> Self {
        Command::CreateBlock { reply: None }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Vote { .. } => "vote",
            Command::CreateBlock { .. } => "create block",
        }
    }
}

/// Everything the event loop consumes, merged into one stream
#[derive(Debug)]
pub(crate) enum NodeEvent {
    Chain(ChainEvent),
    PoolTx(SignedTransaction),
    Command(Command),
}

/// Sending half of the node's command stream
#[derive(Debug, Clone)]
pub struct CommandSender(pub(crate) mpsc::Sender<NodeEvent>);

impl CommandSender {
    /// Queue a command, waiting for room
    pub async fn send(&self, command: Command) -> Result<(), ConsensusError> {
        self.0
            .send(NodeEvent::Command(command))
            .await
            .map_err(|_| ConsensusError::Shutdown)
    }

    /// Queue a command without waiting; a full queue drops it
    pub fn try_send(&self, command: Command) -> Result<(), ConsensusError> {
        self.0.try_send(NodeEvent::Command(command)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(NodeEvent::Command(c)) => {
                tracing::warn!("Command queue full, dropping {} request", c.name());
                ConsensusError::Busy
            }
            _ => ConsensusError::Shutdown,
        })
    }
}

/// Whether a strategy is currently issuing commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyStatus {
    Active,
    Paused,
}

/// Strategy description reported through node info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub minblocktime: u64,
    pub maxblocktime: u64,
    pub minvotetime: u64,
    pub maxvotetime: u64,
    pub status: StrategyStatus,
}

/// Node role and eligibility as seen by the voting ledger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_maker_account: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_create_blocks: Option<bool>,
    #[serde(rename = "blockmakestrategy", skip_serializing_if = "Option::is_none")]
    pub block_make_strategy: Option<StrategyInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vote_account: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_vote: Option<bool>,
    pub synced: bool,
}

/// Counters about the node's activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub pending_rebuilds: u64,
    pub votes_cast: u64,
    pub vote_failures: u64,
    pub blocks_created: u64,
    pub block_failures: u64,
    pub txs_applied: u64,
}
