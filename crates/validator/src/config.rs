//! Validator Configuration

use anyhow::Context;
use ed25519_dalek::SigningKey;
use rpc_server::RpcServerConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use vote_consensus::{NodeConfig, StrategyConfig};
use vote_runtime::Address;

/// Validator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub rpc: RpcServerConfig,
    pub ledger: LedgerConfig,
    pub strategy: StrategyConfig,
    pub node: NodeConfig,
    /// Genesis balances
    pub alloc: BTreeMap<Address, u128>,
    /// Hex-encoded ed25519 secret used to sign votes
    pub vote_key: Option<String>,
    /// Hex-encoded ed25519 secret used to seal blocks
    pub block_maker_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint of the voting ledger
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8546".to_string(),
            timeout_secs: 10,
        }
    }
}

impl ValidatorConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn vote_signing_key(&self) -> anyhow::Result<Option<SigningKey>> {
        self.vote_key.as_deref().map(parse_key).transpose()
    }

    pub fn block_maker_signing_key(&self) -> anyhow::Result<Option<SigningKey>> {
        self.block_maker_key.as_deref().map(parse_key).transpose()
    }
}

pub fn parse_key(hex_key: &str) -> anyhow::Result<SigningKey> {
    let bytes = hex::decode(hex_key.strip_prefix("0x").unwrap_or(hex_key)).context("key is not hex")?;
    let secret: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("key must be 32 bytes"))?;
    Ok(SigningKey::from_bytes(&secret))
}
