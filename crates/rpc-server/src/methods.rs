//! RPC Methods - JSON-RPC method handlers
//!
//! Administrative surface of the voting node plus transaction submission.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use vote_consensus::{ConsensusError, NodeInfo, VotingNode};
use vote_runtime::{Address, PoolError, SignedTransaction, TxPool, H256};

/// How long vote and block requests may take before the caller gets an error
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// RPC context shared across handlers
pub struct RpcContext {
    pub node: Arc<VotingNode>,
    pub pool: Arc<TxPool>,
    pub request_timeout: Duration,
}

impl RpcContext {
    pub fn new(node: Arc<VotingNode>, pool: Arc<TxPool>) -> Self {
        Self {
            node,
            pool,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

// ============ Response Types ============

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingBlockInfo {
    pub number: u64,
    pub parent_hash: H256,
    pub timestamp: u64,
    pub coinbase: Address,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub transactions: Vec<H256>,
}

// ============ RPC Handlers ============

/// Handle vote_canonicalHash RPC method
pub async fn handle_canonical_hash(ctx: &RpcContext, height: u64) -> Result<H256, RpcError> {
    Ok(ctx.node.canonical_hash(height).await?)
}

/// Handle vote_vote RPC method - vote for `hash` at the pending height
pub async fn handle_vote(ctx: &RpcContext, hash: H256) -> Result<H256, RpcError> {
    with_timeout(ctx.request_timeout, "vote request", ctx.node.vote_head(hash)).await
}

/// Handle vote_makeBlock RPC method
pub async fn handle_make_block(ctx: &RpcContext) -> Result<H256, RpcError> {
    let handle = ctx.node.handle();
    with_timeout(ctx.request_timeout, "block make request", handle.create_block()).await
}

/// Handle vote_nodeInfo RPC method
pub async fn handle_node_info(ctx: &RpcContext) -> Result<NodeInfo, RpcError> {
    Ok(ctx.node.node_info().await?)
}

/// Handle vote_isVoter RPC method
pub async fn handle_is_voter(ctx: &RpcContext, address: Address) -> Result<bool, RpcError> {
    Ok(ctx.node.is_voter(address).await?)
}

/// Handle vote_isBlockMaker RPC method
pub async fn handle_is_block_maker(ctx: &RpcContext, address: Address) -> Result<bool, RpcError> {
    Ok(ctx.node.is_block_maker(address).await?)
}

/// Handle vote_pendingBlock RPC method
pub fn handle_pending_block(ctx: &RpcContext) -> Result<PendingBlockInfo, RpcError> {
    let (block, _) = ctx
        .node
        .pending()
        .ok_or(RpcError::Consensus(ConsensusError::NoPendingState))?;

    Ok(PendingBlockInfo {
        number: block.number(),
        parent_hash: block.parent_hash(),
        timestamp: block.timestamp(),
        coinbase: block.header.coinbase,
        gas_limit: block.header.gas_limit,
        gas_used: block.header.gas_used,
        transactions: block.transactions.iter().map(SignedTransaction::hash).collect(),
    })
}

/// Handle sendTransaction RPC method
pub fn handle_send_transaction(ctx: &RpcContext, raw: &str) -> Result<H256, RpcError> {
    let bytes = hex::decode(raw.strip_prefix("0x").unwrap_or(raw))
        .map_err(|_| RpcError::InvalidParams("Invalid hex encoding".to_string()))?;
    let tx = SignedTransaction::from_bytes(&bytes)
        .map_err(|_| RpcError::InvalidParams("Invalid transaction format".to_string()))?;

    Ok(ctx.pool.add(tx)?)
}

/// Handle getHealth RPC method
pub fn handle_get_health() -> Result<String, RpcError> {
    Ok("ok".to_string())
}

async fn with_timeout<F>(timeout: Duration, what: &'static str, request: F) -> Result<H256, RpcError>
where
    F: Future<Output = Result<H256, ConsensusError>>,
{
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(RpcError::Consensus(ConsensusError::Timeout(what))),
    }
}

// ============ Error Types ============

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("Internal error: {0}")]
    InternalError(String),
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error("Transaction rejected: {0}")]
    Pool(#[from] PoolError),
}
