//! Voting node scenarios against an in-memory chain and a scripted ledger


use crate::ledger::{LedgerError, LedgerTransport, VoteCall};
use crate::strategy::{BlockMakerStrategy, StrategyContext};
use crate::types::StrategyStatus;
use crate::{ConsensusError, NodeConfig, VotingNode};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vote_runtime::{
    Address, Block, ChainStore, Genesis, LocalKeystore, MemoryChain, PendingConfig, PendingState,
    SignedTransaction, Transaction, TxPool, H256,
};

pub(crate) const REWARD: u128 = 5;

/// Ledger whose answers are set by the test
#[derive(Default)]
pub(crate) struct MockLedger {
    calls: AtomicUsize,
    unreachable: AtomicBool,
    voters: Mutex<HashSet<Address>>,
    block_makers: Mutex<HashSet<Address>>,
    canonical: Mutex<HashMap<u64, H256>>,
    sent: Mutex<Vec<SignedTransaction>>,
}

impl MockLedger {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn allow_voter(&self, address: Address) {
        self.voters.lock().insert(address);
    }

    pub fn allow_block_maker(&self, address: Address) {
        self.block_makers.lock().insert(address);
    }

    pub fn set_canonical(&self, height: u64, hash: H256) {
        self.canonical.lock().insert(height, hash);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SignedTransaction> {
        self.sent.lock().clone()
    }

    /// Decoded votes in submission order
    pub fn votes(&self) -> Vec<VoteCall> {
        self.sent
            .lock()
            .iter()
            .map(|tx| VoteCall::from_bytes(&tx.tx.data).unwrap())
            .collect()
    }

    fn call(&self) -> Result<(), LedgerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(LedgerError::Rpc("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerTransport for MockLedger {
    async fn can_vote(&self, address: Address) -> Result<bool, LedgerError> {
        self.call()?;
        Ok(self.voters.lock().contains(&address))
    }

    async fn is_voter(&self, address: Address) -> Result<bool, LedgerError> {
        self.call()?;
        Ok(self.voters.lock().contains(&address))
    }

    async fn is_block_maker(&self, address: Address) -> Result<bool, LedgerError> {
        self.call()?;
        Ok(self.block_makers.lock().contains(&address))
    }

    async fn canonical_hash(&self, height: u64) -> Result<H256, LedgerError> {
        self.call()?;
        Ok(self.canonical.lock().get(&height).copied().unwrap_or_default())
    }

    async fn gas_price(&self) -> Result<u128, LedgerError> {
        self.call()?;
        Ok(1)
    }

    async fn send_transaction(&self, tx: SignedTransaction) -> Result<H256, LedgerError> {
        self.call()?;
        let hash = tx.hash();
        self.sent.lock().push(tx);
        Ok(hash)
    }
}

/// Strategy that never fires on its own
#[derive(Default)]
pub(crate) struct ManualStrategy {
    paused: AtomicBool,
}

impl BlockMakerStrategy for ManualStrategy {
    fn start(&self, _ctx: StrategyContext) -> Result<(), ConsensusError> {
        Ok(())
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn status(&self) -> StrategyStatus {
        if self.paused.load(Ordering::SeqCst) {
            StrategyStatus::Paused
        } else {
            StrategyStatus::Active
        }
    }
}

pub(crate) struct TestNode {
    pub node: VotingNode,
    pub chain: Arc<MemoryChain>,
    pub pool: Arc<TxPool>,
    pub ledger: Arc<MockLedger>,
    pub strategy: Arc<ManualStrategy>,
    pub voter: SigningKey,
    pub maker: SigningKey,
    pub user: SigningKey,
}

impl TestNode {
    pub fn voter_address(&self) -> Address {
        Address::from_signing_key(&self.voter)
    }

    pub fn maker_address(&self) -> Address {
        Address::from_signing_key(&self.maker)
    }

    /// Build and import a child of the current head sealed by another maker
    pub fn import_foreign_block(&self) -> Block {
        let outsider = SigningKey::from_bytes(&[42; 32]);
        let parent = self.chain.current_head();
        let state = self.chain.state_at(&parent).unwrap();
        let pending = PendingState::new(
            parent.clone(),
            state,
            parent.timestamp() + 1,
            Some(Address::from_signing_key(&outsider)),
            HashSet::new(),
        );
        let (block, _) = pending.finalize(REWARD, &outsider).unwrap();
        self.chain.insert_block(block.clone()).unwrap();
        block
    }
}

pub(crate) fn config() -> NodeConfig {
    NodeConfig {
        pending: PendingConfig {
            min_gas_price: 1,
            max_future_secs: 4,
            block_reward: REWARD,
        },
        ..Default::default()
    }
}

pub(crate) fn transfer(key: &SigningKey, nonce: u64) -> SignedTransaction {
    Transaction {
        nonce,
        gas_price: 2,
        gas_limit: 21_000,
        to: Address([0xbb; 20]),
        value: 10,
        data: vec![],
    }
    .sign(key)
}

/// Node with a voting and a block-making key, both allowed by the ledger
pub(crate) async fn start_node() -> TestNode {
    let harness = build_node();
    harness.ledger.allow_voter(harness.voter_address());
    harness.ledger.allow_block_maker(harness.maker_address());
    harness
        .node
        .start(
            harness.ledger.clone(),
            harness.strategy.clone(),
            Some(harness.voter.clone()),
            Some(harness.maker.clone()),
        )
        .await
        .unwrap();
    harness
}

/// Node that has not been started yet
pub(crate) fn build_node() -> TestNode {
    let voter = SigningKey::from_bytes(&[1; 32]);
    let maker = SigningKey::from_bytes(&[2; 32]);
    let user = SigningKey::from_bytes(&[3; 32]);

    let alloc = BTreeMap::from([
        (Address::from_signing_key(&user), 1_000_000_000u128),
        (Address::from_signing_key(&voter), 1_000_000_000u128),
    ]);
    let chain = Arc::new(MemoryChain::new(Genesis { alloc, ..Default::default() }, REWARD));
    let pool = Arc::new(TxPool::new());
    let keys = Arc::new(LocalKeystore::new());

    let node = VotingNode::builder()
        .config(config())
        .build(chain.clone(), pool.clone(), keys);

    TestNode {
        node,
        chain,
        pool,
        ledger: Arc::new(MockLedger::default()),
        strategy: Arc::new(ManualStrategy::default()),
        voter,
        maker,
        user,
    }
}

/// Poll `condition` until it holds, failing the test after two seconds
pub(crate) async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Give the event loop time to process anything still queued
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
