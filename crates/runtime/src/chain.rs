//! Chain store
//!
//! `ChainStore` is the interface the block maker needs from the chain: the
//! current head, state lookups, block insertion and head/sync notifications.
//! `MemoryChain` keeps everything in memory and validates inserted blocks by
//! re-executing them on their parent state.

use crate::processor::{execute_block, ExecutionError};
use crate::state::{StateError, WorldState};
use crate::types::{receipts_root, Address, Block, Bloom, Header, SealError, H256};
use crate::unix_now;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Default block gas limit at genesis
pub const GENESIS_GAS_LIMIT: u64 = 4_712_388;

#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// Synchronisation with the network started
    SyncStarted,
    /// Synchronisation finished
    SyncDone,
    /// Synchronisation aborted
    SyncFailed,
    /// A new block became the head of the chain
    HeadChanged(Block),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("unknown parent block {0}")]
    UnknownParent(H256),
    #[error("no state available for block {0}")]
    UnknownState(H256),
    #[error("invalid block number: parent {parent}, block {number}")]
    InvalidNumber { parent: u64, number: u64 },
    #[error("timestamp {timestamp} not after parent timestamp {parent}")]
    InvalidTimestamp { parent: u64, timestamp: u64 },
    #[error("invalid seal: {0}")]
    InvalidSeal(#[from] SealError),
    #[error("coinbase {coinbase} does not match seal signer {signer}")]
    CoinbaseMismatch { coinbase: Address, signer: Address },
    #[error("{field} mismatch: header {header}, computed {computed}")]
    RootMismatch {
        field: &'static str,
        header: H256,
        computed: H256,
    },
    #[error("gas used mismatch: header {header}, computed {computed}")]
    GasUsedMismatch { header: u64, computed: u64 },
    #[error("invalid transaction in block: {0}")]
    Execution(#[from] ExecutionError),
    #[error("block reward failed: {0}")]
    Reward(#[from] StateError),
}

pub trait ChainStore: Send + Sync {
    fn current_head(&self) -> Block;

    /// State after executing `block`
    fn state_at(&self, block: &Block) -> Result<WorldState, ChainError>;

    fn block_by_hash(&self, hash: &H256) -> Option<Block>;

    /// Validate and import a block
    fn insert_block(&self, block: Block) -> Result<(), ChainError>;

    fn subscribe(&self) -> broadcast::Receiver<ChainEvent>;
}

/// Genesis allocation and parameters
#[derive(Debug, Clone)]
pub struct Genesis {
    pub alloc: BTreeMap<Address, u128>,
    pub gas_limit: u64,
    pub timestamp: u64,
}

impl Default for Genesis {
    fn default() -> Self {
        Self {
            alloc: BTreeMap::new(),
            gas_limit: GENESIS_GAS_LIMIT,
            timestamp: 0,
        }
    }
}

impl Genesis {
    pub fn to_block(&self) -> (Block, WorldState) {
        let state = WorldState::from_alloc(self.alloc.iter().map(|(a, b)| (*a, *b)));
        let header = Header {
            number: 0,
            timestamp: self.timestamp,
            state_root: state.state_root(),
            tx_root: Block::default().tx_root(),
            receipts_root: receipts_root(&[]),
            gas_limit: self.gas_limit,
            ..Default::default()
        };
        (Block::new(header, Vec::new()), state)
    }
}

/// Credit the block reward to the block's coinbase
pub fn accumulate_rewards(state: &mut WorldState, header: &Header, reward: u128) -> Result<(), StateError> {
    if reward > 0 {
        state.add_balance(header.coinbase, reward)?;
    }
    state.commit();
    Ok(())
}

/// In-memory chain store
pub struct MemoryChain {
    blocks: DashMap<H256, Block>,
    states: DashMap<H256, WorldState>,
    head: RwLock<Block>,
    genesis_hash: H256,
    block_reward: u128,
    events: broadcast::Sender<ChainEvent>,
}

impl MemoryChain {
    pub fn new(genesis: Genesis, block_reward: u128) -> Self {
        let (block, state) = genesis.to_block();
        let hash = block.hash();
        let (events, _) = broadcast::channel(256);

        let blocks = DashMap::new();
        blocks.insert(hash, block.clone());
        let states = DashMap::new();
        states.insert(hash, state);

        tracing::info!("Initialised chain with genesis {}", hash);

        Self {
            blocks,
            states,
            head: RwLock::new(block),
            genesis_hash: hash,
            block_reward,
            events,
        }
    }

    pub fn genesis_hash(&self) -> H256 {
        self.genesis_hash
    }

    pub fn block_reward(&self) -> u128 {
        self.block_reward
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn notify_sync_started(&self) {
        let _ = self.events.send(ChainEvent::SyncStarted);
    }

    pub fn notify_sync_done(&self) {
        let _ = self.events.send(ChainEvent::SyncDone);
    }

    pub fn notify_sync_failed(&self) {
        let _ = self.events.send(ChainEvent::SyncFailed);
    }

    fn validate(&self, block: &Block, parent: &Block) -> Result<WorldState, ChainError> {
        let header = &block.header;
        if header.number != parent.number() + 1 {
            return Err(ChainError::InvalidNumber {
                parent: parent.number(),
                number: header.number,
            });
        }
        if header.timestamp <= parent.timestamp() {
            return Err(ChainError::InvalidTimestamp {
                parent: parent.timestamp(),
                timestamp: header.timestamp,
            });
        }

        let signer = header.seal_signer()?;
        if signer != header.coinbase {
            return Err(ChainError::CoinbaseMismatch {
                coinbase: header.coinbase,
                signer,
            });
        }

        let mut state = self.state_at(parent)?;
        let mut context = Header {
            gas_used: 0,
            ..header.clone()
        };
        let receipts = execute_block(&mut state, &mut context, &block.transactions)?;
        accumulate_rewards(&mut state, header, self.block_reward)?;

        if context.gas_used != header.gas_used {
            return Err(ChainError::GasUsedMismatch {
                header: header.gas_used,
                computed: context.gas_used,
            });
        }
        let checks = [
            ("state root", header.state_root, state.state_root()),
            ("transaction root", header.tx_root, block.tx_root()),
            ("receipts root", header.receipts_root, receipts_root(&receipts)),
        ];
        for (field, in_header, computed) in checks {
            if in_header != computed {
                return Err(ChainError::RootMismatch {
                    field,
                    header: in_header,
                    computed,
                });
            }
        }
        let bloom = Bloom::from_receipts(&receipts);
        if bloom != header.bloom {
            tracing::warn!("Block {} bloom differs from its receipts", block.hash());
        }

        Ok(state)
    }
}

impl ChainStore for MemoryChain {
    fn current_head(&self) -> Block {
        self.head.read().clone()
    }

    fn state_at(&self, block: &Block) -> Result<WorldState, ChainError> {
        let hash = block.hash();
        self.states
            .get(&hash)
            .map(|s| s.copy())
            .ok_or(ChainError::UnknownState(hash))
    }

    fn block_by_hash(&self, hash: &H256) -> Option<Block> {
        self.blocks.get(hash).map(|b| b.value().clone())
    }

    fn insert_block(&self, block: Block) -> Result<(), ChainError> {
        let hash = block.hash();
        if self.blocks.contains_key(&hash) {
            tracing::debug!("Ignoring known block {}", hash);
            return Ok(());
        }

        let parent = self
            .block_by_hash(&block.parent_hash())
            .ok_or(ChainError::UnknownParent(block.parent_hash()))?;
        let state = self.validate(&block, &parent)?;

        self.states.insert(hash, state);
        self.blocks.insert(hash, block.clone());

        let became_head = {
            let mut head = self.head.write();
            if block.number() > head.number() {
                *head = block.clone();
                true
            } else {
                false
            }
        };

        tracing::info!(
            "Imported block #{} {} ({} txs, {} gas){}",
            block.number(),
            hash,
            block.transactions.len(),
            block.header.gas_used,
            if became_head { ", new head" } else { "" }
        );

        if became_head {
            let _ = self.events.send(ChainEvent::HeadChanged(block));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }
}

/// Default timestamp for a dev genesis
pub fn dev_genesis(alloc: BTreeMap<Address, u128>) -> Genesis {
    Genesis {
        alloc,
        timestamp: unix_now().saturating_sub(1),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{apply_transaction, GasPool};
    use crate::types::{SignedTransaction, Transaction};
    use ed25519_dalek::SigningKey;

    fn sealed_child(chain: &MemoryChain, maker: &SigningKey, txs: Vec<SignedTransaction>) -> Block {
        let parent = chain.current_head();
        let mut state = chain.state_at(&parent).unwrap();
        let mut header = Header {
            parent_hash: parent.hash(),
            number: parent.number() + 1,
            timestamp: parent.timestamp() + 1,
            coinbase: Address::from_signing_key(maker),
            gas_limit: parent.header.gas_limit,
            ..Default::default()
        };
        let mut pool = GasPool::new(header.gas_limit);
        let mut receipts = Vec::new();
        for (i, tx) in txs.iter().enumerate() {
            let (r, _) = apply_transaction(&mut state, &mut header, &mut pool, tx, i as u32).unwrap();
            receipts.push(r);
        }
        accumulate_rewards(&mut state, &header, chain.block_reward()).unwrap();
        let mut block = Block::new(header, txs);
        block.header.state_root = state.state_root();
        block.header.tx_root = block.tx_root();
        block.header.receipts_root = receipts_root(&receipts);
        block.header.bloom = Bloom::from_receipts(&receipts);
        block.header.seal(maker);
        block
    }

    #[tokio::test]
    async fn test_insert_advances_head() {
        let user = SigningKey::from_bytes(&[1; 32]);
        let maker = SigningKey::from_bytes(&[2; 32]);
        let alloc = BTreeMap::from([(Address::from_signing_key(&user), 1_000_000u128)]);
        let chain = MemoryChain::new(Genesis { alloc, ..Default::default() }, 5);
        let mut events = chain.subscribe();

        let tx = Transaction {
            nonce: 0,
            gas_price: 1,
            gas_limit: 21_000,
            to: Address([7; 20]),
            value: 3,
            data: vec![],
        }
        .sign(&user);
        let block = sealed_child(&chain, &maker, vec![tx]);
        chain.insert_block(block.clone()).unwrap();

        assert_eq!(chain.current_head().hash(), block.hash());
        match events.recv().await.unwrap() {
            ChainEvent::HeadChanged(b) => assert_eq!(b.hash(), block.hash()),
            other => panic!("unexpected event {:?}", other),
        }
        let state = chain.state_at(&block).unwrap();
        assert_eq!(state.balance(&Address([7; 20])), 3);
        assert_eq!(state.balance(&Address::from_signing_key(&maker)), 5 + 21_000);
    }

    #[test]
    fn test_rejects_bad_blocks() {
        let maker = SigningKey::from_bytes(&[2; 32]);
        let chain = MemoryChain::new(Genesis::default(), 0);

        let mut wrong_root = sealed_child(&chain, &maker, vec![]);
        wrong_root.header.state_root = H256([1; 32]);
        wrong_root.header.seal(&maker);
        assert!(matches!(
            chain.insert_block(wrong_root),
            Err(ChainError::RootMismatch { field: "state root", .. })
        ));

        let mut unsealed = sealed_child(&chain, &maker, vec![]);
        unsealed.header.extra.clear();
        assert_eq!(chain.insert_block(unsealed), Err(ChainError::InvalidSeal(SealError::Missing)));

        let mut orphan = sealed_child(&chain, &maker, vec![]);
        orphan.header.parent_hash = H256([9; 32]);
        orphan.header.seal(&maker);
        assert!(matches!(chain.insert_block(orphan), Err(ChainError::UnknownParent(_))));

        assert_eq!(chain.len(), 1);
    }
}
