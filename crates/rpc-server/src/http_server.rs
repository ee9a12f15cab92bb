//! HTTP JSON-RPC Server
//!
//! Provides HTTP endpoint for JSON-RPC methods.

use crate::methods::{
    handle_canonical_hash, handle_get_health, handle_is_block_maker, handle_is_voter,
    handle_make_block, handle_node_info, handle_pending_block, handle_send_transaction,
    handle_vote, RpcContext, RpcError,
};
use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use vote_consensus::ConsensusError;

/// JSON-RPC request
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC response
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

/// HTTP RPC Server
pub struct HttpRpcServer {
    context: Arc<RpcContext>,
}

impl HttpRpcServer {
    /// Create a new HTTP RPC server
    pub fn new(context: Arc<RpcContext>) -> Self {
        Self { context }
    }

    /// Create the Axum router
    pub fn router(self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

        Router::new()
            .route("/", post(handle_rpc))
            .layer(cors)
            .with_state(self.context)
    }

    /// Run the server
    pub async fn run(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("HTTP RPC server listening on {}", addr);

        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

/// Handle JSON-RPC request
async fn handle_rpc(
    State(context): State<Arc<RpcContext>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let result = dispatch_method(&context, &request.method, request.params).await;

    let response = match result {
        Ok(value) => JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: request.id,
            result: Some(value),
            error: None,
        },
        Err(e) => {
            tracing::debug!("RPC method {} failed: {}", request.method, e);
            JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id: request.id,
                result: None,
                error: Some(JsonRpcError {
                    code: error_code(&e),
                    message: e.to_string(),
                }),
            }
        }
    };

    (StatusCode::OK, Json(response))
}

/// Dispatch to appropriate method handler
async fn dispatch_method(ctx: &RpcContext, method: &str, params: Value) -> Result<Value, RpcError> {
    tracing::info!("RPC method called: {}", method);
    let params: Vec<Value> = serde_json::from_value(params).unwrap_or_default();

    match method {
        "vote_canonicalHash" => {
            let height: u64 = param(&params, 0, "height")?;
            to_value(handle_canonical_hash(ctx, height).await?)
        }

        "vote_vote" => {
            let hash = param(&params, 0, "block hash")?;
            to_value(handle_vote(ctx, hash).await?)
        }

        "vote_makeBlock" => to_value(handle_make_block(ctx).await?),

        "vote_nodeInfo" => to_value(handle_node_info(ctx).await?),

        "vote_isVoter" => {
            let address = param(&params, 0, "address")?;
            Ok(json!(handle_is_voter(ctx, address).await?))
        }

        "vote_isBlockMaker" => {
            let address = param(&params, 0, "address")?;
            Ok(json!(handle_is_block_maker(ctx, address).await?))
        }

        "vote_pauseBlockMaker" => {
            ctx.node.pause_block_maker();
            Ok(Value::Null)
        }

        "vote_resumeBlockMaker" => {
            ctx.node.resume_block_maker();
            Ok(Value::Null)
        }

        "vote_pendingBlock" => to_value(handle_pending_block(ctx)?),

        "sendTransaction" => {
            let transaction = params
                .first()
                .and_then(|v| v.as_str())
                .ok_or_else(|| RpcError::InvalidParams("Missing transaction".to_string()))?;
            to_value(handle_send_transaction(ctx, transaction)?)
        }

        "getHealth" => {
            let health = handle_get_health()?;
            Ok(json!(health))
        }

        "getVersion" => Ok(json!({
            "vote-node": env!("CARGO_PKG_VERSION"),
        })),

        _ => Err(RpcError::MethodNotFound(method.to_string())),
    }
}

/// Positional parameter `index`, decoded as `T`
fn param<T: DeserializeOwned>(params: &[Value], index: usize, name: &str) -> Result<T, RpcError> {
    let value = params
        .get(index)
        .cloned()
        .ok_or_else(|| RpcError::InvalidParams(format!("Missing {}", name)))?;
    serde_json::from_value(value).map_err(|e| RpcError::InvalidParams(format!("Invalid {}: {}", name, e)))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::InternalError(e.to_string()))
}

/// Map error to JSON-RPC error code
fn error_code(error: &RpcError) -> i32 {
    match error {
        RpcError::InvalidParams(_) => -32602,
        RpcError::MethodNotFound(_) => -32601,
        RpcError::InternalError(_) => -32603,
        RpcError::Pool(_) => -32003,
        RpcError::Consensus(e) => match e {
            ConsensusError::NotSynced => -32010,
            ConsensusError::NotConfiguredForVoting
            | ConsensusError::NotConfiguredForBlockCreation
            | ConsensusError::NotAuthorized(_) => -32011,
            ConsensusError::CanonicalMismatch { .. } | ConsensusError::NoCanonicalHash(_) => -32012,
            ConsensusError::Timeout(_) => -32013,
            ConsensusError::NotStarted | ConsensusError::NoPendingState => -32014,
            _ => -32000,
        },
    }
}
