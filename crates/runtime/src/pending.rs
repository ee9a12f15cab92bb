//! Pending state - the speculative block built on top of the current head
//!
//! The pending state holds a draft header, the state after every transaction
//! applied so far, the remaining gas budget and the receipts. It is rebuilt
//! wholesale when a new head arrives and extended one transaction at a time as
//! transactions enter the pool.

use crate::chain::{accumulate_rewards, ChainError, ChainStore};
use crate::keys::KeyManager;
use crate::processor::{apply_transaction, ExecutionError, GasPool};
use crate::state::{StateError, WorldState};
use crate::txpool::{TxSource, TxsByPriceAndNonce};
use crate::types::{receipts_root, Address, Block, Bloom, Header, Log, Receipt, SignedTransaction, H256};
use crate::{unix_now, GWEI};
use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Gas limit adjustment divisor
pub const GAS_LIMIT_BOUND_DIVISOR: u64 = 1024;
/// Lowest gas limit a block may have
pub const MIN_GAS_LIMIT: u64 = 5000;
/// Gas limit blocks drift toward while below it
pub const TARGET_GAS_LIMIT: u64 = 4_712_388;

/// Pending-state configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingConfig {
    /// Transactions priced below this are skipped unless sent by a local account
    pub min_gas_price: u128,
    /// How far ahead of the wall clock a draft timestamp may be, in seconds
    pub max_future_secs: u64,
    /// Reward credited to the block maker
    pub block_reward: u128,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            min_gas_price: 20 * GWEI,
            max_future_secs: 4,
            block_reward: 5 * crate::ETHER,
        }
    }
}

/// Notifications published after a batch changed the pending state
#[derive(Debug, Clone)]
pub enum PendingEvent {
    StateChanged { tx_count: usize },
    Logs(Vec<Log>),
}

/// Transactions a batch left out, to be purged from the pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Excluded {
    pub underpriced: Vec<SignedTransaction>,
    pub failed: Vec<SignedTransaction>,
}

impl Excluded {
    pub fn is_empty(&self) -> bool {
        self.underpriced.is_empty() && self.failed.is_empty()
    }

    pub fn hashes(&self) -> Vec<H256> {
        self.underpriced
            .iter()
            .chain(self.failed.iter())
            .map(SignedTransaction::hash)
            .collect()
    }
}

/// Gas limit for a child of `parent`
pub fn calc_gas_limit(parent: &Header) -> u64 {
    let contrib = parent.gas_used * 3 / 2 / GAS_LIMIT_BOUND_DIVISOR;
    let decay = (parent.gas_limit / GAS_LIMIT_BOUND_DIVISOR).saturating_sub(1);

    let mut limit = (parent.gas_limit - decay + contrib).max(MIN_GAS_LIMIT);
    if limit < TARGET_GAS_LIMIT {
        limit = (parent.gas_limit + decay).min(TARGET_GAS_LIMIT);
    }
    limit
}

/// Timestamp for a child of a block stamped `parent_time`.
///
/// Never goes backwards; if that would put the block more than
/// `max_future_secs` ahead of the clock, waits until it no longer does.
pub async fn draft_timestamp(parent_time: u64, max_future_secs: u64) -> u64 {
    let now = unix_now();
    let timestamp = if parent_time >= now { parent_time + 1 } else { now };
    if timestamp > now + max_future_secs {
        let wait = Duration::from_secs(timestamp - now);
        tracing::info!("Draft block too far in the future, waiting {:?}", wait);
        tokio::time::sleep(wait).await;
    }
    timestamp
}

/// Speculative block state
#[derive(Debug, Clone)]
pub struct PendingState {
    parent: Block,
    header: Header,
    gas_pool: GasPool,
    state: WorldState,
    txs: Vec<SignedTransaction>,
    receipts: Vec<Receipt>,
    logs: Vec<Log>,
    underpriced: Vec<SignedTransaction>,
    failed: Vec<SignedTransaction>,
    seen: HashSet<H256>,
    owned_accounts: HashSet<Address>,
    created_at: DateTime<Utc>,
}

impl PendingState {
    pub fn new(
        parent: Block,
        state: WorldState,
        timestamp: u64,
        coinbase: Option<Address>,
        owned_accounts: HashSet<Address>,
    ) -> Self {
        let header = Header {
            parent_hash: parent.hash(),
            number: parent.number() + 1,
            timestamp,
            coinbase: coinbase.unwrap_or_default(),
            gas_limit: calc_gas_limit(&parent.header),
            ..Default::default()
        };
        Self {
            gas_pool: GasPool::new(header.gas_limit),
            parent,
            header,
            state,
            txs: Vec::new(),
            receipts: Vec::new(),
            logs: Vec::new(),
            underpriced: Vec::new(),
            failed: Vec::new(),
            seen: HashSet::new(),
            owned_accounts,
            created_at: Utc::now(),
        }
    }

    /// Apply transactions from `txs` until it is exhausted.
    ///
    /// Per-transaction failures never abort the pass. Returns what was left
    /// out so the caller can purge it from the pool.
    pub fn apply_transactions(
        &mut self,
        txs: &mut TxsByPriceAndNonce,
        config: &PendingConfig,
        events: &broadcast::Sender<PendingEvent>,
    ) -> Excluded {
        let mut excluded = Excluded::default();
        let mut coalesced_logs = Vec::new();
        let mut committed = 0usize;

        while let Some(tx) = txs.peek().cloned() {
            let hash = tx.hash();
            if self.seen.contains(&hash) {
                txs.shift();
                continue;
            }

            let from = tx.sender();
            if tx.effective_price() < config.min_gas_price && !self.owned_accounts.contains(&from) {
                let dropped = txs.pop_sender();
                tracing::debug!(
                    "Skipping {} underpriced transactions from {} (price {})",
                    dropped.len(),
                    from,
                    tx.effective_price()
                );
                self.seen.extend(dropped.iter().map(SignedTransaction::hash));
                excluded.underpriced.extend(dropped);
                continue;
            }

            let tx_index = self.txs.len() as u32;
            match apply_transaction(&mut self.state, &mut self.header, &mut self.gas_pool, &tx, tx_index) {
                Err(e) if e.is_gas_limit() => {
                    tracing::debug!("Gas limit reached for {} in this block, trying smaller transactions", from);
                    txs.pop();
                }
                Err(ExecutionError::NonceTooHigh { expected, got }) => {
                    // Stays pooled until the gap closes
                    tracing::debug!("Skipping {} from {}: nonce {} ahead of {}", hash, from, got, expected);
                    txs.pop();
                }
                Err(e) => {
                    tracing::debug!("Transaction {} failed, will be removed: {}", hash, e);
                    self.seen.insert(hash);
                    excluded.failed.push(tx);
                    txs.pop();
                }
                Ok((mut receipt, _)) => {
                    for log in receipt.logs.iter_mut() {
                        log.log_index = self.logs.len() as u32;
                        self.logs.push(log.clone());
                        coalesced_logs.push(log.clone());
                    }
                    self.seen.insert(hash);
                    self.receipts.push(receipt);
                    self.txs.push(tx);
                    committed += 1;
                    txs.shift();
                }
            }
        }

        self.underpriced.extend(excluded.underpriced.iter().cloned());
        self.failed.extend(excluded.failed.iter().cloned());

        // Nobody listening is not an error
        if !coalesced_logs.is_empty() {
            let _ = events.send(PendingEvent::Logs(coalesced_logs));
        }
        if committed > 0 {
            let _ = events.send(PendingEvent::StateChanged { tx_count: committed });
        }

        excluded
    }

    pub fn parent(&self) -> &Block {
        &self.parent
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn state(&self) -> &WorldState {
        &self.state
    }

    pub fn gas_remaining(&self) -> u64 {
        self.gas_pool.gas()
    }

    pub fn transactions(&self) -> &[SignedTransaction] {
        &self.txs
    }

    pub fn receipts(&self) -> &[Receipt] {
        &self.receipts
    }

    pub fn logs(&self) -> &[Log] {
        &self.logs
    }

    pub fn underpriced(&self) -> &[SignedTransaction] {
        &self.underpriced
    }

    pub fn failed(&self) -> &[SignedTransaction] {
        &self.failed
    }

    pub fn owned_accounts(&self) -> &HashSet<Address> {
        &self.owned_accounts
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Draft block as it currently stands
    pub fn block(&self) -> Block {
        Block::new(self.header.clone(), self.txs.clone())
    }

    /// Copy of the draft block and its state for readers
    pub fn snapshot(&self) -> (Block, WorldState) {
        (self.block(), self.state.copy())
    }

    /// Assemble the final block: credit the reward, fill in the roots and
    /// bloom, sign the header and stamp the block hash into the logs.
    ///
    /// `key` must belong to the draft's coinbase or the chain rejects the seal.
    /// Works on copies; the pending state itself is left untouched.
    pub fn finalize(&self, block_reward: u128, key: &SigningKey) -> Result<(Block, Vec<Receipt>), StateError> {
        let mut state = self.state.copy();
        accumulate_rewards(&mut state, &self.header, block_reward)?;

        let mut receipts = self.receipts.clone();
        let mut block = Block::new(self.header.clone(), self.txs.clone());
        block.header.state_root = state.state_root();
        block.header.tx_root = block.tx_root();
        block.header.receipts_root = receipts_root(&receipts);
        block.header.bloom = Bloom::from_receipts(&receipts);
        block.header.seal(key);

        let block_hash = block.hash();
        for log in receipts.iter_mut().flat_map(|r| r.logs.iter_mut()) {
            log.block_hash = block_hash;
        }

        Ok((block, receipts))
    }
}

/// Builds and maintains pending states
pub struct PendingBuilder {
    chain: Arc<dyn ChainStore>,
    pool: Arc<dyn TxSource>,
    keys: Arc<dyn KeyManager>,
    config: PendingConfig,
    coinbase: Option<Address>,
    events: broadcast::Sender<PendingEvent>,
}

impl PendingBuilder {
    pub fn new(
        chain: Arc<dyn ChainStore>,
        pool: Arc<dyn TxSource>,
        keys: Arc<dyn KeyManager>,
        config: PendingConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            chain,
            pool,
            keys,
            config,
            coinbase: None,
            events,
        }
    }

    /// Address credited in draft headers
    pub fn set_coinbase(&mut self, coinbase: Option<Address>) {
        self.coinbase = coinbase;
    }

    pub fn config(&self) -> &PendingConfig {
        &self.config
    }

    pub fn chain(&self) -> &Arc<dyn ChainStore> {
        &self.chain
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PendingEvent> {
        self.events.subscribe()
    }

    /// Build a fresh pending state on top of `parent` and fill it from the pool
    pub async fn rebuild(&self, parent: Block) -> Result<PendingState, ChainError> {
        let state = self.chain.state_at(&parent)?;
        self.pool.reset(&state);
        let timestamp = draft_timestamp(parent.timestamp(), self.config.max_future_secs).await;
        let owned: HashSet<Address> = self.keys.accounts().into_iter().collect();

        let mut pending = PendingState::new(parent, state, timestamp, self.coinbase, owned);
        let mut txs = TxsByPriceAndNonce::new(self.pool.pending());
        let excluded = pending.apply_transactions(&mut txs, &self.config, &self.events);
        self.purge(&excluded);

        tracing::debug!(
            "Rebuilt pending block #{} on {}: {} txs, {} gas left",
            pending.number(),
            pending.parent().hash(),
            pending.transactions().len(),
            pending.gas_remaining()
        );
        Ok(pending)
    }

    /// Apply a single newly pooled transaction
    pub fn apply_one(&self, pending: &mut PendingState, tx: SignedTransaction) -> Excluded {
        let mut txs = TxsByPriceAndNonce::single(tx);
        let excluded = pending.apply_transactions(&mut txs, &self.config, &self.events);
        self.purge(&excluded);
        excluded
    }

    fn purge(&self, excluded: &Excluded) {
        if !excluded.is_empty() {
            self.pool.remove_batch(&excluded.hashes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Genesis, MemoryChain};
    use crate::keys::LocalKeystore;
    use crate::processor::TX_GAS;
    use crate::txpool::TxPool;
    use crate::types::Transaction;
    use std::collections::BTreeMap;

    const PRICE: u128 = 10;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn tx(k: &SigningKey, nonce: u64, price: u128) -> SignedTransaction {
        Transaction {
            nonce,
            gas_price: price,
            gas_limit: TX_GAS + 100,
            to: Address([0xee; 20]),
            value: 1,
            data: vec![nonce as u8 + 1],
        }
        .sign(k)
    }

    struct Fixture {
        chain: Arc<MemoryChain>,
        pool: Arc<TxPool>,
        keys: Arc<LocalKeystore>,
        builder: PendingBuilder,
    }

    fn fixture(funded: &[&SigningKey], config: PendingConfig) -> Fixture {
        let alloc: BTreeMap<_, _> = funded
            .iter()
            .map(|k| (Address::from_signing_key(k), 1_000_000_000u128))
            .collect();
        let chain = Arc::new(MemoryChain::new(Genesis { alloc, ..Default::default() }, 0));
        let pool = Arc::new(TxPool::new());
        let keys = Arc::new(LocalKeystore::new());
        let builder = PendingBuilder::new(chain.clone(), pool.clone(), keys.clone(), config);
        Fixture { chain, pool, keys, builder }
    }

    fn config(min_gas_price: u128) -> PendingConfig {
        PendingConfig {
            min_gas_price,
            max_future_secs: 4,
            block_reward: 0,
        }
    }

    #[test]
    fn test_calc_gas_limit() {
        let below = Header {
            gas_limit: 1_000_000,
            ..Default::default()
        };
        // below target: grow by parent/1024 - 1
        assert_eq!(calc_gas_limit(&below), 1_000_000 + 1_000_000 / 1024 - 1);

        let at_target = Header {
            gas_limit: TARGET_GAS_LIMIT,
            gas_used: 0,
            ..Default::default()
        };
        assert_eq!(calc_gas_limit(&at_target), TARGET_GAS_LIMIT);

        let busy = Header {
            gas_limit: 10_000_000,
            gas_used: 10_000_000,
            ..Default::default()
        };
        let decay = 10_000_000 / 1024 - 1;
        let contrib = 10_000_000 * 3 / 2 / 1024;
        assert_eq!(calc_gas_limit(&busy), 10_000_000 - decay + contrib);
    }

    #[tokio::test]
    async fn test_draft_timestamp_moves_forward() {
        let now = unix_now();
        assert!(draft_timestamp(0, 4).await >= now);
        assert_eq!(draft_timestamp(now + 2, 4).await, now + 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_draft_timestamp_waits_when_far_ahead() {
        let now = unix_now();
        let start = tokio::time::Instant::now();
        let ts = draft_timestamp(now + 10, 4).await;
        assert_eq!(ts, now + 11);
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_rebuild_skips_underpriced_sender_and_purges() {
        let a = key(1);
        let b = key(2);
        let f = fixture(&[&a, &b], config(PRICE));

        let a0 = tx(&a, 0, PRICE);
        let a1 = tx(&a, 1, PRICE);
        let b0 = tx(&b, 0, PRICE - 1);
        let b1 = tx(&b, 1, PRICE * 5);
        for t in [&a0, &a1, &b0, &b1] {
            f.pool.add(t.clone()).unwrap();
        }

        let pending = f.builder.rebuild(f.chain.current_head()).await.unwrap();

        assert_eq!(pending.transactions(), &[a0.clone(), a1.clone()]);
        assert_eq!(pending.underpriced(), &[b0.clone(), b1.clone()]);
        assert!(pending.failed().is_empty());
        assert!(!f.pool.contains(&b0.hash()) && !f.pool.contains(&b1.hash()));
        assert!(f.pool.contains(&a0.hash()));
        assert_eq!(pending.header().parent_hash, f.chain.current_head().hash());
        assert_eq!(pending.logs().iter().map(|l| l.log_index).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_owned_accounts_bypass_price_floor() {
        let a = key(1);
        let f = fixture(&[&a], config(PRICE));
        f.keys.insert(a.clone());

        let cheap = tx(&a, 0, 1);
        f.pool.add(cheap.clone()).unwrap();

        let pending = f.builder.rebuild(f.chain.current_head()).await.unwrap();
        assert_eq!(pending.transactions(), &[cheap]);
    }

    #[tokio::test]
    async fn test_failed_transaction_is_isolated() {
        let a = key(1);
        let poor = key(3);
        let f = fixture(&[&a], config(0));

        let ok = tx(&a, 0, PRICE);
        let broke = tx(&poor, 0, PRICE);
        f.pool.add(ok.clone()).unwrap();
        f.pool.add(broke.clone()).unwrap();

        let pending = f.builder.rebuild(f.chain.current_head()).await.unwrap();

        assert_eq!(pending.transactions(), &[ok]);
        assert_eq!(pending.failed(), &[broke.clone()]);
        assert!(!f.pool.contains(&broke.hash()));
        let poor_addr = Address::from_signing_key(&poor);
        assert_eq!(pending.state().nonce(&poor_addr), 0);
        assert_eq!(pending.state().balance(&poor_addr), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_nonces_apply_once_gap_closes() {
        let a = key(1);
        let f = fixture(&[&a], config(0));
        let mut announced = f.pool.subscribe();
        let mut pending = f.builder.rebuild(f.chain.current_head()).await.unwrap();

        let a0 = tx(&a, 0, PRICE);
        let a1 = tx(&a, 1, PRICE);
        f.pool.add(a1.clone()).unwrap();
        assert!(announced.try_recv().is_err());

        // Ahead of the account nonce: skipped but kept
        assert!(f.builder.apply_one(&mut pending, a1.clone()).is_empty());
        assert!(pending.transactions().is_empty());
        assert!(pending.failed().is_empty());
        assert!(f.pool.contains(&a1.hash()));

        f.pool.add(a0.clone()).unwrap();
        while let Ok(t) = announced.try_recv() {
            f.builder.apply_one(&mut pending, t);
        }
        assert_eq!(pending.transactions(), &[a0.clone(), a1.clone()]);

        let rebuilt = f.builder.rebuild(f.chain.current_head()).await.unwrap();
        assert_eq!(rebuilt.transactions(), &[a0, a1]);
    }

    #[tokio::test]
    async fn test_rebuild_leaves_gapped_transactions_pooled() {
        let a = key(1);
        let f = fixture(&[&a], config(0));

        let a0 = tx(&a, 0, PRICE);
        let a2 = tx(&a, 2, PRICE);
        f.pool.add(a0.clone()).unwrap();
        f.pool.add(a2.clone()).unwrap();

        let mut pending = f.builder.rebuild(f.chain.current_head()).await.unwrap();
        assert_eq!(pending.transactions(), &[a0]);
        assert!(pending.failed().is_empty());
        assert!(f.pool.contains(&a2.hash()));

        // Handed a gapped transaction directly, the builder still keeps it
        let mut txs = TxsByPriceAndNonce::single(a2.clone());
        let (events, _) = broadcast::channel(4);
        assert!(pending.apply_transactions(&mut txs, &config(0), &events).is_empty());
        assert_eq!(pending.transactions().len(), 1);
    }

    #[tokio::test]
    async fn test_gas_exhaustion_stops_only_that_sender() {
        let a = key(1);
        let b = key(2);
        let f = fixture(&[&a, &b], config(0));

        let mut pending = f.builder.rebuild(f.chain.current_head()).await.unwrap();
        let budget = pending.gas_remaining();

        let big = Transaction {
            nonce: 0,
            gas_price: PRICE * 2,
            gas_limit: budget + 1,
            to: Address([1; 20]),
            value: 0,
            data: vec![],
        }
        .sign(&a);
        let small = tx(&b, 0, PRICE);

        let mut groups = std::collections::HashMap::new();
        groups.insert(Address::from_signing_key(&a), vec![big.clone()]);
        groups.insert(Address::from_signing_key(&b), vec![small.clone()]);
        let mut txs = TxsByPriceAndNonce::new(groups);
        let (events, _) = broadcast::channel(4);
        let excluded = pending.apply_transactions(&mut txs, &config(0), &events);

        assert!(excluded.is_empty());
        assert_eq!(pending.transactions(), &[small]);
        assert!(pending.header().gas_used <= pending.header().gas_limit);
        assert_eq!(pending.gas_remaining(), budget - TX_GAS - 68);
    }

    #[tokio::test]
    async fn test_apply_one_publishes_and_ignores_duplicates() {
        let a = key(1);
        let f = fixture(&[&a], config(0));
        let mut events = f.builder.subscribe();
        let mut pending = f.builder.rebuild(f.chain.current_head()).await.unwrap();

        let t = tx(&a, 0, PRICE);
        assert!(f.builder.apply_one(&mut pending, t.clone()).is_empty());
        assert!(f.builder.apply_one(&mut pending, t.clone()).is_empty());
        assert_eq!(pending.transactions().len(), 1);

        assert!(matches!(events.recv().await.unwrap(), PendingEvent::Logs(logs) if logs.len() == 1));
        assert!(matches!(events.recv().await.unwrap(), PendingEvent::StateChanged { tx_count: 1 }));
    }

    #[tokio::test]
    async fn test_finalized_block_imports() {
        let a = key(1);
        let maker = key(9);
        let mut f = fixture(&[&a], PendingConfig { block_reward: 7, ..config(0) });
        f.builder.set_coinbase(Some(Address::from_signing_key(&maker)));
        f.pool.add(tx(&a, 0, PRICE)).unwrap();

        let pending = f.builder.rebuild(f.chain.current_head()).await.unwrap();
        let (block, receipts) = pending.finalize(7, &maker).unwrap();

        assert_eq!(receipts[0].logs[0].block_hash, block.hash());
        assert_eq!(pending.header().extra, Vec::<u8>::new());

        let chain = MemoryChain::new(
            Genesis {
                alloc: BTreeMap::from([(Address::from_signing_key(&a), 1_000_000_000u128)]),
                ..Default::default()
            },
            7,
        );
        chain.insert_block(block.clone()).unwrap();
        assert_eq!(chain.current_head().hash(), block.hash());
        let state = chain.state_at(&block).unwrap();
        assert_eq!(state.balance(&Address::from_signing_key(&maker)), 7 + (TX_GAS as u128 + 68) * PRICE);
    }
}
