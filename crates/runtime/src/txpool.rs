//! Transaction source
//!
//! `TxSource` is what the pending-state builder drains. `TxPool` is the
//! in-memory implementation used by the node and the tests.

use crate::state::WorldState;
use crate::types::{Address, SignedTransaction, H256};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use tokio::sync::broadcast;

/// Default pool capacity
pub const MAX_POOL_TXS: usize = 4096;

pub trait TxSource: Send + Sync {
    /// Executable transactions grouped by sender: each group is the gapless
    /// nonce run starting at the sender's account nonce
    fn pending(&self) -> HashMap<Address, Vec<SignedTransaction>>;

    /// Drop the given transactions from the pool
    fn remove_batch(&self, hashes: &[H256]);

    /// Next usable nonce for `address`, counting pooled transactions
    fn next_nonce(&self, address: &Address) -> u64;

    /// Subscribe to transactions as they become executable
    fn subscribe(&self) -> broadcast::Receiver<SignedTransaction>;

    /// Re-anchor on the state a new pending block builds on
    fn reset(&self, state: &WorldState);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("invalid transaction signature")]
    InvalidSignature,
    #[error("nonce too low: account at {expected}, transaction has {got}")]
    NonceTooLow { expected: u64, got: u64 },
    #[error("replacement transaction underpriced")]
    ReplacementUnderpriced,
    #[error("transaction {0} already known")]
    AlreadyKnown(H256),
    #[error("transaction pool is full")]
    PoolFull,
}

#[derive(Default)]
struct PoolInner {
    by_sender: HashMap<Address, BTreeMap<u64, SignedTransaction>>,
    by_hash: HashMap<H256, (Address, u64)>,
    /// Account nonces of the state the pool was last reset to
    base_nonces: HashMap<Address, u64>,
}

impl PoolInner {
    fn base_nonce(&self, address: &Address) -> u64 {
        self.base_nonces.get(address).copied().unwrap_or(0)
    }

    /// End of the gapless nonce run starting at the account nonce
    fn executable_end(&self, address: &Address) -> u64 {
        let mut nonce = self.base_nonce(address);
        if let Some(txs) = self.by_sender.get(address) {
            while txs.contains_key(&nonce) {
                nonce += 1;
            }
        }
        nonce
    }

    fn remove(&mut self, hash: &H256) -> bool {
        let Some((sender, nonce)) = self.by_hash.remove(hash) else {
            return false;
        };
        if let Some(txs) = self.by_sender.get_mut(&sender) {
            txs.remove(&nonce);
            if txs.is_empty() {
                self.by_sender.remove(&sender);
            }
        }
        true
    }
}

/// In-memory transaction pool
pub struct TxPool {
    inner: RwLock<PoolInner>,
    capacity: usize,
    new_txs: broadcast::Sender<SignedTransaction>,
}

impl TxPool {
    pub fn new() -> Self {
        Self::with_capacity(MAX_POOL_TXS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (new_txs, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(PoolInner::default()),
            capacity,
            new_txs,
        }
    }

    /// Validate and add a transaction.
    ///
    /// A transaction behind a nonce gap is queued silently. Once it is
    /// executable it is announced together with any queued successors it
    /// promotes.
    pub fn add(&self, tx: SignedTransaction) -> Result<H256, PoolError> {
        tx.verify().map_err(|_| PoolError::InvalidSignature)?;

        let hash = tx.hash();
        let sender = tx.sender();
        let nonce = tx.nonce();
        let promoted: Vec<SignedTransaction> = {
            let mut inner = self.inner.write();
            if inner.by_hash.contains_key(&hash) {
                return Err(PoolError::AlreadyKnown(hash));
            }
            let expected = inner.base_nonce(&sender);
            if nonce < expected {
                return Err(PoolError::NonceTooLow {
                    expected,
                    got: nonce,
                });
            }

            let existing = inner
                .by_sender
                .get(&sender)
                .and_then(|txs| txs.get(&nonce))
                .map(|old| (old.hash(), old.effective_price()));
            match existing {
                Some((_, old_price)) if old_price >= tx.effective_price() => {
                    return Err(PoolError::ReplacementUnderpriced);
                }
                Some((old_hash, _)) => {
                    inner.remove(&old_hash);
                    tracing::debug!("Replacing {} from {} at nonce {}", old_hash, sender, nonce);
                }
                None if inner.by_hash.len() >= self.capacity => return Err(PoolError::PoolFull),
                None => {}
            }

            inner.by_hash.insert(hash, (sender, nonce));
            inner
                .by_sender
                .entry(sender)
                .or_default()
                .insert(nonce, tx);

            let end = inner.executable_end(&sender);
            if nonce < end {
                inner
                    .by_sender
                    .get(&sender)
                    .map(|txs| txs.range(nonce..end).map(|(_, t)| t.clone()).collect())
                    .unwrap_or_default()
            } else {
                tracing::debug!("Queued {} from {} behind nonce gap at {}", hash, sender, end);
                Vec::new()
            }
        };

        // Ignore send errors when nobody is subscribed
        for tx in promoted {
            let _ = self.new_txs.send(tx);
        }
        Ok(hash)
    }

    pub fn contains(&self, hash: &H256) -> bool {
        self.inner.read().by_hash.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TxPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TxSource for TxPool {
    fn pending(&self) -> HashMap<Address, Vec<SignedTransaction>> {
        let inner = self.inner.read();
        inner
            .by_sender
            .iter()
            .filter_map(|(sender, txs)| {
                let run: Vec<_> = txs
                    .range(inner.base_nonce(sender)..inner.executable_end(sender))
                    .map(|(_, tx)| tx.clone())
                    .collect();
                (!run.is_empty()).then_some((*sender, run))
            })
            .collect()
    }

    fn remove_batch(&self, hashes: &[H256]) {
        let mut inner = self.inner.write();
        for hash in hashes {
            inner.remove(hash);
        }
    }

    fn next_nonce(&self, address: &Address) -> u64 {
        self.inner.read().executable_end(address)
    }

    fn subscribe(&self) -> broadcast::Receiver<SignedTransaction> {
        self.new_txs.subscribe()
    }

    /// Drops transactions the state has already included
    fn reset(&self, state: &WorldState) {
        let mut inner = self.inner.write();
        inner.base_nonces = state
            .accounts()
            .map(|(address, account)| (*address, account.nonce))
            .collect();

        let stale: Vec<H256> = inner
            .by_hash
            .iter()
            .filter(|(_, (sender, nonce))| *nonce < inner.base_nonce(sender))
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &stale {
            inner.remove(hash);
        }
        if !stale.is_empty() {
            tracing::debug!("Pool reset dropped {} included transactions", stale.len());
        }
    }
}

struct Head(SignedTransaction);

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    // Max-heap: highest price first, then lowest nonce, then hash for determinism
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .effective_price()
            .cmp(&other.0.effective_price())
            .then_with(|| other.0.nonce().cmp(&self.0.nonce()))
            .then_with(|| other.0.hash().cmp(&self.0.hash()))
    }
}

/// Transactions ordered by descending price across senders while keeping
/// each sender's transactions in nonce order.
pub struct TxsByPriceAndNonce {
    remaining: HashMap<Address, VecDeque<SignedTransaction>>,
    heads: BinaryHeap<Head>,
}

impl TxsByPriceAndNonce {
    pub fn new(groups: HashMap<Address, Vec<SignedTransaction>>) -> Self {
        let mut remaining = HashMap::with_capacity(groups.len());
        let mut heads = BinaryHeap::with_capacity(groups.len());
        for (sender, mut txs) in groups {
            txs.sort_by_key(SignedTransaction::nonce);
            let mut queue: VecDeque<_> = txs.into();
            if let Some(first) = queue.pop_front() {
                heads.push(Head(first));
                remaining.insert(sender, queue);
            }
        }
        Self { remaining, heads }
    }

    pub fn single(tx: SignedTransaction) -> Self {
        Self::new(HashMap::from([(tx.sender(), vec![tx])]))
    }

    /// Best transaction currently available
    pub fn peek(&self) -> Option<&SignedTransaction> {
        self.heads.peek().map(|h| &h.0)
    }

    /// Drop the best transaction and replace it with the sender's next one
    pub fn shift(&mut self) {
        if let Some(Head(tx)) = self.heads.pop() {
            let next = self
                .remaining
                .get_mut(&tx.sender())
                .and_then(VecDeque::pop_front);
            if let Some(next) = next {
                self.heads.push(Head(next));
            }
        }
    }

    /// Drop the best transaction and stop considering its sender
    pub fn pop(&mut self) {
        if let Some(Head(tx)) = self.heads.pop() {
            self.remaining.remove(&tx.sender());
        }
    }

    /// Like `pop`, but hand back the head and every later transaction of its sender
    pub fn pop_sender(&mut self) -> Vec<SignedTransaction> {
        let Some(Head(tx)) = self.heads.pop() else {
            return Vec::new();
        };
        let rest = self.remaining.remove(&tx.sender()).unwrap_or_default();
        std::iter::once(tx).chain(rest).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }
}
