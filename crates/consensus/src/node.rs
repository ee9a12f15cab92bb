//! Voting node - the consensus orchestrator
//!
//! A single event loop owns the pending state and the sync flag. Chain
//! events, new pool transactions and commands (from the strategy or from
//! callers) are merged into one stream and handled strictly in arrival order,
//! so a rebuild always completes before the next transaction is applied.

use crate::ledger::{LedgerClient, LedgerTransport, DEFAULT_LEDGER_ADDRESS};
use crate::strategy::{BlockMakerStrategy, StrategyContext};
use crate::types::{Command, CommandSender, NodeEvent, NodeInfo, NodeStats, Reply};
use crate::ConsensusError;
use ed25519_dalek::SigningKey;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use vote_runtime::{
    Address, Block, ChainEvent, ChainStore, KeyManager, PendingBuilder, PendingConfig, PendingState,
    SignedTransaction, TxSource, WorldState, H256,
};

/// Voting node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub pending: PendingConfig,
    /// Address vote transactions are sent to
    pub ledger_address: Address,
    /// Capacity of the merged event stream
    pub event_queue: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            pending: PendingConfig::default(),
            ledger_address: DEFAULT_LEDGER_ADDRESS,
            event_queue: 1024,
        }
    }
}

/// State shared between the event loop and readers
struct Shared {
    chain: Arc<dyn ChainStore>,
    pool: Arc<dyn TxSource>,
    keys: Arc<dyn KeyManager>,
    pending: RwLock<Option<PendingState>>,
    stats: RwLock<NodeStats>,
    synced: AtomicBool,
    mined: broadcast::Sender<Block>,
}

/// Collaborators handed over by `start`
struct Running {
    transport: Arc<dyn LedgerTransport>,
    strategy: Arc<dyn BlockMakerStrategy>,
    voter: Option<Address>,
    block_maker: Option<Address>,
}

/// Voting-based block maker
pub struct VotingNode {
    shared: Arc<Shared>,
    config: NodeConfig,
    events_tx: mpsc::Sender<NodeEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<NodeEvent>>>,
    running: RwLock<Option<Running>>,
    cancel: CancellationToken,
}

impl VotingNode {
    pub fn new(
        chain: Arc<dyn ChainStore>,
        pool: Arc<dyn TxSource>,
        keys: Arc<dyn KeyManager>,
        config: NodeConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue.max(1));
        let (mined, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                chain,
                pool,
                keys,
                pending: RwLock::new(None),
                stats: RwLock::new(NodeStats::default()),
                synced: AtomicBool::new(true),
                mined,
            }),
            config,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            running: RwLock::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn builder() -> VotingNodeBuilder {
        VotingNodeBuilder::new()
    }

    /// Build the initial pending state, start the strategy and run the event loop.
    ///
    /// Either key may be absent: a node can vote, make blocks, both or neither.
    /// Fails if the ledger cannot be reached. Callable once.
    pub async fn start(
        &self,
        transport: Arc<dyn LedgerTransport>,
        strategy: Arc<dyn BlockMakerStrategy>,
        vote_key: Option<SigningKey>,
        block_maker_key: Option<SigningKey>,
    ) -> Result<(), ConsensusError> {
        if self.running.read().is_some() {
            return Err(ConsensusError::AlreadyStarted);
        }

        let shared = &self.shared;
        let head = shared.chain.current_head();
        if let Err(e) = transport.canonical_hash(head.number()).await {
            tracing::error!("Voting ledger unreachable: {}", e);
            return Err(e.into());
        }

        let events = self
            .events_rx
            .lock()
            .take()
            .ok_or(ConsensusError::AlreadyStarted)?;

        let voter = vote_key.as_ref().map(Address::from_signing_key);
        let block_maker = block_maker_key.as_ref().map(Address::from_signing_key);
        if let Some(address) = block_maker {
            tracing::info!("Node configured for block creation: {}", address);
        }
        if let Some(address) = voter {
            tracing::info!("Node configured for block voting: {}", address);
        }

        // Subscribe before reading the head so no head change is missed
        let chain_events = shared.chain.subscribe();
        let pool_events = shared.pool.subscribe();

        let mut builder = PendingBuilder::new(
            shared.chain.clone(),
            shared.pool.clone(),
            shared.keys.clone(),
            self.config.pending.clone(),
        );
        builder.set_coinbase(block_maker);
        let pending = builder.rebuild(shared.chain.current_head()).await?;
        *shared.pending.write() = Some(pending);
        shared.stats.write().pending_rebuilds += 1;

        tokio::spawn(forward_chain_events(
            shared.chain.clone(),
            chain_events,
            self.events_tx.clone(),
            self.cancel.clone(),
        ));
        tokio::spawn(forward_pool_events(
            pool_events,
            self.events_tx.clone(),
            self.cancel.clone(),
        ));

        strategy.start(StrategyContext {
            commands: self.commands(),
            chain_events: shared.chain.subscribe(),
            cancel: self.cancel.child_token(),
        })?;

        let event_loop = EventLoop {
            shared: shared.clone(),
            builder,
            ledger: LedgerClient::new(
                transport.clone(),
                shared.pool.clone(),
                self.config.ledger_address,
                vote_key,
            ),
            block_maker_key,
            block_reward: self.config.pending.block_reward,
            strategy: strategy.clone(),
            synced: shared.synced.load(Ordering::SeqCst),
            events,
            cancel: self.cancel.clone(),
        };
        tokio::spawn(event_loop.run());

        *self.running.write() = Some(Running {
            transport,
            strategy,
            voter,
            block_maker,
        });
        tracing::info!("Voting node started");
        Ok(())
    }

    /// Copy of the pending block and its state
    pub fn pending(&self) -> Option<(Block, WorldState)> {
        self.shared.pending.read().as_ref().map(PendingState::snapshot)
    }

    /// Number of the pending block
    pub fn pending_number(&self) -> Option<u64> {
        self.shared.pending.read().as_ref().map(PendingState::number)
    }

    pub fn handle(&self) -> VotingNodeHandle {
        VotingNodeHandle {
            commands: self.commands(),
        }
    }

    /// Raw command stream, for alternative strategies
    pub fn commands(&self) -> CommandSender {
        CommandSender(self.events_tx.clone())
    }

    /// Vote for `hash` at the height of the pending block
    pub async fn vote_head(&self, hash: H256) -> Result<H256, ConsensusError> {
        let height = self.pending_number().ok_or(ConsensusError::NoPendingState)?;
        self.handle().vote(height, hash).await
    }

    pub async fn canonical_hash(&self, height: u64) -> Result<H256, ConsensusError> {
        Ok(self.transport()?.canonical_hash(height).await?)
    }

    pub async fn is_voter(&self, address: Address) -> Result<bool, ConsensusError> {
        Ok(self.transport()?.is_voter(address).await?)
    }

    pub async fn is_block_maker(&self, address: Address) -> Result<bool, ConsensusError> {
        Ok(self.transport()?.is_block_maker(address).await?)
    }

    /// Configured accounts, their eligibility and the strategy parameters
    pub async fn node_info(&self) -> Result<NodeInfo, ConsensusError> {
        let (transport, strategy, voter, block_maker) = {
            let running = self.running.read();
            let running = running.as_ref().ok_or(ConsensusError::NotStarted)?;
            (
                running.transport.clone(),
                running.strategy.clone(),
                running.voter,
                running.block_maker,
            )
        };

        let mut info = NodeInfo {
            synced: self.is_synced(),
            ..Default::default()
        };
        if let Some(address) = block_maker {
            info.block_maker_account = Some(address);
            info.can_create_blocks = Some(transport.is_block_maker(address).await.unwrap_or(false));
            info.block_make_strategy = strategy.info();
        }
        if let Some(address) = voter {
            info.vote_account = Some(address);
            info.can_vote = Some(transport.is_voter(address).await.unwrap_or(false));
        }
        Ok(info)
    }

    pub fn pause_block_maker(&self) {
        if let Some(running) = self.running.read().as_ref() {
            running.strategy.pause();
        }
    }

    pub fn resume_block_maker(&self) {
        if let Some(running) = self.running.read().as_ref() {
            running.strategy.resume();
        }
    }

    pub fn is_synced(&self) -> bool {
        self.shared.synced.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> NodeStats {
        self.shared.stats.read().clone()
    }

    /// Blocks created by this node
    pub fn subscribe_mined(&self) -> broadcast::Receiver<Block> {
        self.shared.mined.subscribe()
    }

    pub fn chain(&self) -> &Arc<dyn ChainStore> {
        &self.shared.chain
    }

    /// Stop the event loop, the forwarders and the strategy timers
    pub fn shutdown(&self) {
        tracing::info!("Shutting down voting node");
        self.cancel.cancel();
    }

    fn transport(&self) -> Result<Arc<dyn LedgerTransport>, ConsensusError> {
        self.running
            .read()
            .as_ref()
            .map(|r| r.transport.clone())
            .ok_or(ConsensusError::NotStarted)
    }
}

/// Builder for VotingNode
pub struct VotingNodeBuilder {
    config: NodeConfig,
}

impl VotingNodeBuilder {
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
        }
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pending(mut self, pending: PendingConfig) -> Self {
        self.config.pending = pending;
        self
    }

    pub fn ledger_address(mut self, address: Address) -> Self {
        self.config.ledger_address = address;
        self
    }

    pub fn build(
        self,
        chain: Arc<dyn ChainStore>,
        pool: Arc<dyn TxSource>,
        keys: Arc<dyn KeyManager>,
    ) -> VotingNode {
        VotingNode::new(chain, pool, keys, self.config)
    }
}

impl Default for VotingNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable access to the node's commands
#[derive(Debug, Clone)]
pub struct VotingNodeHandle {
    commands: CommandSender,
}

impl VotingNodeHandle {
    /// Vote for `hash` at `height`; a zero hash votes for the local head
    pub async fn vote(&self, height: u64, hash: H256) -> Result<H256, ConsensusError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Vote {
                height,
                hash,
                reply: Some(reply),
            })
            .await?;
        rx.await.map_err(|_| ConsensusError::Shutdown)?
    }

    /// Create a block from the pending state, returning its hash
    pub async fn create_block(&self) -> Result<H256, ConsensusError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::CreateBlock { reply: Some(reply) })
            .await?;
        rx.await.map_err(|_| ConsensusError::Shutdown)?
    }
}

struct EventLoop {
    shared: Arc<Shared>,
    builder: PendingBuilder,
    ledger: LedgerClient,
    block_maker_key: Option<SigningKey>,
    block_reward: u128,
    strategy: Arc<dyn BlockMakerStrategy>,
    synced: bool,
    events: mpsc::Receiver<NodeEvent>,
    cancel: CancellationToken,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event).await;
        }
        tracing::info!("Voting node event loop stopped");
    }

    async fn handle(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Chain(ChainEvent::SyncStarted) => {
                self.set_synced(false);
                self.strategy.pause();
            }
            NodeEvent::Chain(ChainEvent::SyncDone) | NodeEvent::Chain(ChainEvent::SyncFailed) => {
                self.set_synced(true);
                self.strategy.resume();
            }
            NodeEvent::Chain(ChainEvent::HeadChanged(head)) => {
                let (number, hash) = (head.number(), head.hash());
                self.reset_pending(head).await;
                if self.synced {
                    // Liveness vote, best effort
                    if let Err(e) = self.vote(number + 1, hash).await {
                        log_failure("vote for new head", &e);
                    }
                }
            }
            NodeEvent::PoolTx(tx) => self.apply_transaction(tx),
            NodeEvent::Command(Command::Vote { height, hash, reply }) => {
                let result = if self.synced {
                    self.vote_request(height, hash).await
                } else {
                    Err(ConsensusError::NotSynced)
                };
                deliver("vote", reply, result);
            }
            NodeEvent::Command(Command::CreateBlock { reply }) => {
                let result = if self.synced {
                    self.create_block().await
                } else {
                    Err(ConsensusError::NotSynced)
                };
                let recover = matches!(&result, Err(e) if !e.is_configuration());
                {
                    let mut stats = self.shared.stats.write();
                    match result {
                        Ok(_) => stats.blocks_created += 1,
                        Err(_) => stats.block_failures += 1,
                    }
                }
                deliver("create block", reply, result);
                if recover {
                    self.recover().await;
                }
            }
        }
    }

    fn set_synced(&mut self, synced: bool) {
        self.synced = synced;
        self.shared.synced.store(synced, Ordering::SeqCst);
        tracing::info!("Chain sync {}", if synced { "finished" } else { "started" });
    }

    async fn reset_pending(&mut self, parent: Block) {
        let parent_hash = parent.hash();
        match self.builder.rebuild(parent).await {
            Ok(pending) => {
                *self.shared.pending.write() = Some(pending);
                self.shared.stats.write().pending_rebuilds += 1;
            }
            Err(e) => tracing::error!("Unable to rebuild pending state on {}: {}", parent_hash, e),
        }
    }

    fn apply_transaction(&mut self, tx: SignedTransaction) {
        let mut pending = self.shared.pending.write();
        let Some(pending) = pending.as_mut() else {
            return;
        };
        let before = pending.transactions().len();
        self.builder.apply_one(pending, tx);
        let applied = (pending.transactions().len() - before) as u64;
        if applied > 0 {
            self.shared.stats.write().txs_applied += applied;
        }
    }

    fn pending_parent(&self) -> Option<Block> {
        self.shared.pending.read().as_ref().map(|p| p.parent().clone())
    }

    async fn vote_request(&mut self, height: u64, hash: H256) -> Result<H256, ConsensusError> {
        if !hash.is_zero() {
            return self.vote(height, hash).await;
        }
        let parent = self.pending_parent().ok_or(ConsensusError::NoPendingState)?;
        self.vote(parent.number() + 1, parent.hash()).await
    }

    async fn vote(&mut self, height: u64, hash: H256) -> Result<H256, ConsensusError> {
        let result = self.ledger.vote(height, hash).await;
        let mut stats = self.shared.stats.write();
        match &result {
            Ok(_) => stats.votes_cast += 1,
            Err(_) => stats.vote_failures += 1,
        }
        result
    }

    async fn create_block(&mut self) -> Result<H256, ConsensusError> {
        let key = self
            .block_maker_key
            .clone()
            .ok_or(ConsensusError::NotConfiguredForBlockCreation)?;
        let maker = Address::from_signing_key(&key);
        if !self.ledger.transport().is_block_maker(maker).await? {
            return Err(ConsensusError::NotAuthorized(maker));
        }

        let (number, parent) = {
            let pending = self.shared.pending.read();
            let pending = pending.as_ref().ok_or(ConsensusError::NoPendingState)?;
            (pending.number(), pending.parent().hash())
        };

        let canonical = self.ledger.transport().canonical_hash(number).await?;
        if canonical.is_zero() {
            return Err(ConsensusError::NoCanonicalHash(number));
        }
        if canonical != parent {
            return Err(ConsensusError::CanonicalMismatch { canonical, parent });
        }

        let (block, _receipts) = {
            let pending = self.shared.pending.read();
            let pending = pending.as_ref().ok_or(ConsensusError::NoPendingState)?;
            pending.finalize(self.block_reward, &key)?
        };
        self.shared.chain.insert_block(block.clone())?;

        let hash = block.hash();
        tracing::info!(
            "Created block #{} {} ({} txs, {} gas)",
            block.number(),
            hash,
            block.transactions.len(),
            block.header.gas_used
        );
        // Nobody listening is not an error
        let _ = self.shared.mined.send(block);
        Ok(hash)
    }

    /// Vote again for the parent we still consider valid and rebuild on the current head
    async fn recover(&mut self) {
        if let Some(parent) = self.pending_parent() {
            if let Err(e) = self.vote(parent.number() + 1, parent.hash()).await {
                log_failure("re-vote for pending parent", &e);
            }
        }
        let head = self.shared.chain.current_head();
        self.reset_pending(head).await;
    }
}

fn deliver(what: &str, reply: Option<Reply>, result: Result<H256, ConsensusError>) {
    match reply {
        Some(reply) => {
            if reply.send(result).is_err() {
                tracing::debug!("Requester of {} went away before the result", what);
            }
        }
        None => {
            if let Err(e) = result {
                log_failure(what, &e);
            }
        }
    }
}

fn log_failure(what: &str, error: &ConsensusError) {
    if error.is_configuration() {
        tracing::debug!("Unable to {}: {}", what, error);
    } else {
        tracing::warn!("Unable to {}: {}", what, error);
    }
}

async fn forward_chain_events(
    chain: Arc<dyn ChainStore>,
    mut rx: broadcast::Receiver<ChainEvent>,
    tx: mpsc::Sender<NodeEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // A missed head change is recovered by rebuilding on the current head
                tracing::warn!("Voting node lagged {} chain events", skipped);
                ChainEvent::HeadChanged(chain.current_head())
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if tx.send(NodeEvent::Chain(event)).await.is_err() {
            break;
        }
    }
}

async fn forward_pool_events(
    mut rx: broadcast::Receiver<SignedTransaction>,
    tx: mpsc::Sender<NodeEvent>,
    cancel: CancellationToken,
) {
    loop {
        let pooled = tokio::select! {
            _ = cancel.cancelled() => break,
            pooled = rx.recv() => pooled,
        };
        match pooled {
            Ok(pooled) => {
                if tx.send(NodeEvent::PoolTx(pooled)).await.is_err() {
                    break;
                }
            }
            // Missed transactions are picked up by the next rebuild
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Voting node lagged {} pool transactions", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
