//! Voting ledger client
//!
//! The voting ledger is the on-chain oracle that tracks voters, block makers
//! and per-height vote tallies. The node only consumes it: eligibility and
//! canonical-hash queries go through a `LedgerTransport`, and votes are signed
//! transactions addressed to the ledger.

use async_trait::async_trait;
use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::SigningKey;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use std::sync::Arc;
use std::time::Duration;
use vote_runtime::txpool::TxSource;
use vote_runtime::{Address, SignedTransaction, Transaction, H256};

/// Gas limit attached to vote transactions
pub const VOTE_GAS_LIMIT: u64 = 100_000;

/// Well-known address of the voting ledger
pub const DEFAULT_LEDGER_ADDRESS: Address = Address([
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x20,
]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger rpc failed: {0}")]
    Rpc(String),
    #[error("invalid ledger response: {0}")]
    InvalidResponse(String),
    #[error("ledger rejected transaction: {0}")]
    Rejected(String),
}

impl From<jsonrpsee::core::ClientError> for LedgerError {
    fn from(e: jsonrpsee::core::ClientError) -> Self {
        LedgerError::Rpc(e.to_string())
    }
}

/// Payload of a vote transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VoteCall {
    pub height: u64,
    pub hash: H256,
}

impl VoteCall {
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("VoteCall serialization should not fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

/// Access to the voting ledger
#[async_trait]
pub trait LedgerTransport: Send + Sync {
    /// Whether `address` may vote right now
    async fn can_vote(&self, address: Address) -> Result<bool, LedgerError>;

    async fn is_voter(&self, address: Address) -> Result<bool, LedgerError>;

    async fn is_block_maker(&self, address: Address) -> Result<bool, LedgerError>;

    /// Winning hash for `height`; zero when no hash has enough votes
    async fn canonical_hash(&self, height: u64) -> Result<H256, LedgerError>;

    async fn gas_price(&self) -> Result<u128, LedgerError>;

    /// Submit a signed transaction, returning its hash
    async fn send_transaction(&self, tx: SignedTransaction) -> Result<H256, LedgerError>;
}

/// Ledger transport over JSON-RPC/HTTP
pub struct HttpLedgerTransport {
    client: HttpClient,
    url: String,
}

impl HttpLedgerTransport {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let client = HttpClientBuilder::default().request_timeout(timeout).build(url)?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl LedgerTransport for HttpLedgerTransport {
    async fn can_vote(&self, address: Address) -> Result<bool, LedgerError> {
        Ok(self.client.request("voting_canVote", rpc_params![address]).await?)
    }

    async fn is_voter(&self, address: Address) -> Result<bool, LedgerError> {
        Ok(self.client.request("voting_isVoter", rpc_params![address]).await?)
    }

    async fn is_block_maker(&self, address: Address) -> Result<bool, LedgerError> {
        Ok(self.client.request("voting_isBlockMaker", rpc_params![address]).await?)
    }

    async fn canonical_hash(&self, height: u64) -> Result<H256, LedgerError> {
        Ok(self.client.request("voting_getCanonHash", rpc_params![height]).await?)
    }

    async fn gas_price(&self) -> Result<u128, LedgerError> {
        let price: String = self.client.request("eth_gasPrice", rpc_params![]).await?;
        parse_quantity(&price)
    }

    async fn send_transaction(&self, tx: SignedTransaction) -> Result<H256, LedgerError> {
        let raw = format!("0x{}", hex::encode(tx.to_bytes()));
        Ok(self.client.request("eth_sendRawTransaction", rpc_params![raw]).await?)
    }
}

/// Parse a `0x` hex or plain decimal quantity
fn parse_quantity(value: &str) -> Result<u128, LedgerError> {
    let parsed = match value.strip_prefix("0x") {
        Some(digits) => u128::from_str_radix(digits, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| LedgerError::InvalidResponse(format!("quantity {:?}: {}", value, e)))
}

/// Vote submission for the node's voting key
pub struct LedgerClient {
    transport: Arc<dyn LedgerTransport>,
    pool: Arc<dyn TxSource>,
    ledger_address: Address,
    vote_key: Option<SigningKey>,
    last_nonce: Option<u64>,
}

impl LedgerClient {
    pub fn new(
        transport: Arc<dyn LedgerTransport>,
        pool: Arc<dyn TxSource>,
        ledger_address: Address,
        vote_key: Option<SigningKey>,
    ) -> Self {
        Self {
            transport,
            pool,
            ledger_address,
            vote_key,
            last_nonce: None,
        }
    }

    pub fn transport(&self) -> &Arc<dyn LedgerTransport> {
        &self.transport
    }

    pub fn voter(&self) -> Option<Address> {
        self.vote_key.as_ref().map(Address::from_signing_key)
    }

    /// Sign and submit a vote for `hash` at `height`
    pub async fn vote(&mut self, height: u64, hash: H256) -> Result<H256, crate::ConsensusError> {
        let key = self
            .vote_key
            .as_ref()
            .ok_or(crate::ConsensusError::NotConfiguredForVoting)?;
        let voter = Address::from_signing_key(key);

        if !self.transport.can_vote(voter).await? {
            return Err(crate::ConsensusError::NotAuthorized(voter));
        }

        // The pool may not have seen our previous vote yet
        let pool_nonce = self.pool.next_nonce(&voter);
        let nonce = match self.last_nonce {
            Some(last) => pool_nonce.max(last + 1),
            None => pool_nonce,
        };
        let gas_price = self.transport.gas_price().await?;

        let tx = Transaction {
            nonce,
            gas_price,
            gas_limit: VOTE_GAS_LIMIT,
            to: self.ledger_address,
            value: 0,
            data: VoteCall { height, hash }.to_bytes(),
        }
        .sign(key);

        let tx_hash = self.transport.send_transaction(tx).await?;
        self.last_nonce = Some(nonce);
        tracing::debug!(
            "Voted for {} at height {} (tx {}, nonce {})",
            hash,
            height,
            tx_hash,
            nonce
        );
        Ok(tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_call_encoding() {
        let call = VoteCall {
            height: 11,
            hash: H256([7; 32]),
        };
        let bytes = call.to_bytes();
        assert_eq!(bytes.len(), 8 + 32);
        assert_eq!(VoteCall::from_bytes(&bytes).unwrap(), call);
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x4a817c800").unwrap(), 20_000_000_000);
        assert_eq!(parse_quantity("1000").unwrap(), 1000);
        assert!(matches!(parse_quantity("0xzz"), Err(LedgerError::InvalidResponse(_))));
    }
}
