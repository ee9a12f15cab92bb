//! RPC Server - administrative JSON-RPC for the voting node
//!
//! HTTP JSON-RPC methods:
//! - vote_vote, vote_makeBlock, vote_canonicalHash
//! - vote_nodeInfo, vote_isVoter, vote_isBlockMaker
//! - vote_pauseBlockMaker, vote_resumeBlockMaker, vote_pendingBlock
//! - sendTransaction, getHealth

pub mod http_server;
pub mod methods;

pub use http_server::HttpRpcServer;
pub use methods::{RpcContext, RpcError, DEFAULT_REQUEST_TIMEOUT};

use serde::{Deserialize, Serialize};

/// RPC Server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcServerConfig {
    /// HTTP RPC bind address
    pub http_addr: String,
    /// Seconds a vote or block request may wait for the node
    pub request_timeout_secs: u64,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8545".to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
        }
    }
}
