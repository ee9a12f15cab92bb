//! Block maker strategies
//!
//! A strategy decides when the node votes and when it tries to create a block.
//! It only issues commands; the node's event loop executes them.

use crate::types::{Command, CommandSender, StrategyInfo, StrategyStatus};
use crate::ConsensusError;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use vote_runtime::ChainEvent;

/// What a strategy gets when it is started
pub struct StrategyContext {
    pub commands: CommandSender,
    pub chain_events: broadcast::Receiver<ChainEvent>,
    pub cancel: CancellationToken,
}

pub trait BlockMakerStrategy: Send + Sync {
    /// Begin issuing commands
    fn start(&self, ctx: StrategyContext) -> Result<(), ConsensusError>;

    /// Stop issuing commands until resumed
    fn pause(&self);

    fn resume(&self);

    fn status(&self) -> StrategyStatus;

    /// Parameters for node info, if the strategy has any worth reporting
    fn info(&self) -> Option<StrategyInfo> {
        None
    }
}

/// Deadline ranges in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub min_block_time: u64,
    pub max_block_time: u64,
    pub min_vote_time: u64,
    pub max_vote_time: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            min_block_time: 3,
            max_block_time: 10,
            min_vote_time: 1,
            max_vote_time: 5,
        }
    }
}

/// Longest deadline a window may describe, one day
pub const MAX_DEADLINE_SECS: u64 = 24 * 60 * 60;

/// Half-open range `[min, max)` of whole seconds a deadline is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub min: u64,
    pub max: u64,
}

impl Window {
    /// Normalize so the range is non-empty and starts at one second or later
    pub fn new(min: u64, max: u64) -> Self {
        let (mut min, mut max) = if min > max { (max, min) } else { (min, max) };
        if max > MAX_DEADLINE_SECS {
            tracing::info!("Capping deadline interval at {} seconds", MAX_DEADLINE_SECS);
            min = min.min(MAX_DEADLINE_SECS - 1);
            max = MAX_DEADLINE_SECS;
        }
        if min == 0 {
            tracing::info!("Set minimum deadline interval to 1 second");
            min = 1;
        }
        if min >= max {
            max = min + 1;
        }
        Self { min, max }
    }

    fn draw(&self, rng: &mut StdRng) -> Duration {
        Duration::from_millis(rng.gen_range(self.min * 1000..self.max * 1000))
    }
}

struct Shared {
    active: Mutex<bool>,
    rng: Mutex<StdRng>,
}

impl Shared {
    fn is_active(&self) -> bool {
        *self.active.lock()
    }

    fn deadline(&self, window: Window) -> Instant {
        Instant::now() + window.draw(&mut self.rng.lock())
    }
}

/// Votes and creates blocks after random deadlines.
///
/// Two independent timers, one per command. Each is rearmed with a fresh
/// random deadline every time it fires, whether or not the strategy is
/// paused. A new chain head restarts only the block timer.
pub struct RandomDeadlineStrategy {
    block: Window,
    vote: Window,
    shared: Arc<Shared>,
    started: AtomicBool,
}

impl RandomDeadlineStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            block: Window::new(config.min_block_time, config.max_block_time),
            vote: Window::new(config.min_vote_time, config.max_vote_time),
            shared: Arc::new(Shared {
                active: Mutex::new(true),
                // Deadlines must not be predictable by other nodes
                rng: Mutex::new(StdRng::from_entropy()),
            }),
            started: AtomicBool::new(false),
        }
    }

    pub fn block_window(&self) -> Window {
        self.block
    }

    pub fn vote_window(&self) -> Window {
        self.vote
    }
}

impl BlockMakerStrategy for RandomDeadlineStrategy {
    fn start(&self, ctx: StrategyContext) -> Result<(), ConsensusError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConsensusError::AlreadyStarted);
        }
        tracing::info!(
            "Random deadline strategy configured with block=[{}s, {}s) vote=[{}s, {}s)",
            self.block.min,
            self.block.max,
            self.vote.min,
            self.vote.max
        );

        // Arm both timers now so their deadlines count from start
        let block_sleep = tokio::time::sleep_until(self.shared.deadline(self.block));
        let vote_sleep = tokio::time::sleep_until(self.shared.deadline(self.vote));

        tokio::spawn(run_timer(
            self.shared.clone(),
            self.block,
            Command::create_block,
            block_sleep,
            ctx.commands.clone(),
            Some(ctx.chain_events),
            ctx.cancel.clone(),
        ));
        tokio::spawn(run_timer(
            self.shared.clone(),
            self.vote,
            Command::vote_head,
            vote_sleep,
            ctx.commands,
            None,
            ctx.cancel,
        ));
        Ok(())
    }

    fn pause(&self) {
        *self.shared.active.lock() = false;
        tracing::info!("Block maker strategy paused");
    }

    fn resume(&self) {
        *self.shared.active.lock() = true;
        tracing::info!("Block maker strategy resumed");
    }

    fn status(&self) -> StrategyStatus {
        if self.shared.is_active() {
            StrategyStatus::Active
        } else {
            StrategyStatus::Paused
        }
    }

    fn info(&self) -> Option<StrategyInfo> {
        Some(StrategyInfo {
            kind: "deadline".to_string(),
            minblocktime: self.block.min,
            maxblocktime: self.block.max,
            minvotetime: self.vote.min,
            maxvotetime: self.vote.max,
            status: self.status(),
        })
    }
}

/// One deadline timer. With `head_events` the deadline restarts on every new head.
async fn run_timer(
    shared: Arc<Shared>,
    window: Window,
    command: fn() -> Command,
    sleep: Sleep,
    commands: CommandSender,
    mut head_events: Option<broadcast::Receiver<ChainEvent>>,
    cancel: CancellationToken,
) {
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut sleep => {
                if shared.is_active() {
                    if let Err(ConsensusError::Shutdown) = commands.try_send(command()) {
                        break;
                    }
                }
                sleep.as_mut().reset(shared.deadline(window));
            }
            event = recv_head(&mut head_events) => match event {
                Ok(ChainEvent::HeadChanged(_)) => sleep.as_mut().reset(shared.deadline(window)),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Strategy lagged {} chain events, restarting deadline", skipped);
                    sleep.as_mut().reset(shared.deadline(window));
                }
                Err(RecvError::Closed) => head_events = None,
            }
        }
    }
    tracing::debug!("Deadline timer stopped");
}

async fn recv_head(events: &mut Option<broadcast::Receiver<ChainEvent>>) -> Result<ChainEvent, RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeEvent;
    use tokio::sync::mpsc;
    use vote_runtime::Block;

    fn config(block: (u64, u64), vote: (u64, u64)) -> StrategyConfig {
        StrategyConfig {
            min_block_time: block.0,
            max_block_time: block.1,
            min_vote_time: vote.0,
            max_vote_time: vote.1,
        }
    }

    struct Harness {
        strategy: RandomDeadlineStrategy,
        rx: mpsc::Receiver<NodeEvent>,
        chain_tx: broadcast::Sender<ChainEvent>,
        cancel: CancellationToken,
    }

    fn started(config: StrategyConfig) -> Harness {
        let strategy = RandomDeadlineStrategy::new(config);
        let (tx, rx) = mpsc::channel(64);
        let (chain_tx, chain_rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        strategy
            .start(StrategyContext {
                commands: CommandSender(tx),
                chain_events: chain_rx,
                cancel: cancel.clone(),
            })
            .unwrap();
        Harness {
            strategy,
            rx,
            chain_tx,
            cancel,
        }
    }

    async fn next_create_block(rx: &mut mpsc::Receiver<NodeEvent>) {
        loop {
            match rx.recv().await {
                Some(NodeEvent::Command(Command::CreateBlock { .. })) => return,
                Some(_) => continue,
                None => panic!("strategy stopped"),
            }
        }
    }

    #[test]
    fn test_window_normalization() {
        assert_eq!(Window::new(0, 5), Window { min: 1, max: 5 });
        assert_eq!(Window::new(5, 5), Window { min: 5, max: 6 });
        assert_eq!(Window::new(9, 3), Window { min: 3, max: 9 });
        assert_eq!(Window::new(0, 0), Window { min: 1, max: 2 });
        assert_eq!(Window::new(0, 1), Window { min: 1, max: 2 });
    }

    #[test]
    fn test_window_caps_huge_values() {
        let huge = Window::new(u64::MAX, u64::MAX);
        assert_eq!(huge, Window { min: MAX_DEADLINE_SECS - 1, max: MAX_DEADLINE_SECS });
        assert_eq!(Window::new(3, u64::MAX), Window { min: 3, max: MAX_DEADLINE_SECS });

        let mut rng = StdRng::seed_from_u64(7);
        let d = huge.draw(&mut rng);
        assert!(d >= Duration::from_secs(MAX_DEADLINE_SECS - 1));
        assert!(d < Duration::from_secs(MAX_DEADLINE_SECS));
    }

    #[test]
    fn test_info_reports_normalized_parameters() {
        let strategy = RandomDeadlineStrategy::new(config((0, 0), (4, 2)));
        let info = strategy.info().unwrap();
        assert_eq!((info.minblocktime, info.maxblocktime), (1, 2));
        assert_eq!((info.minvotetime, info.maxvotetime), (2, 4));
        assert_eq!(info.status, StrategyStatus::Active);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["type"], "deadline");
        assert_eq!(json["status"], "active");
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_deadlines_fall_in_window() {
        let mut h = started(config((5, 5), (1000, 1000)));
        assert_eq!(h.strategy.block_window(), Window { min: 5, max: 6 });

        let mut last = Instant::now();
        for _ in 0..5 {
            next_create_block(&mut h.rx).await;
            let elapsed = last.elapsed();
            assert!(elapsed >= Duration::from_secs(5), "fired early: {:?}", elapsed);
            assert!(elapsed < Duration::from_secs(6), "fired late: {:?}", elapsed);
            last = Instant::now();
        }
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_strategy_stays_quiet() {
        let mut h = started(config((2, 3), (1, 2)));
        h.strategy.pause();
        assert_eq!(h.strategy.status(), StrategyStatus::Paused);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.rx.try_recv().is_err());

        h.strategy.resume();
        let resumed = Instant::now();
        next_create_block(&mut h.rx).await;
        assert!(resumed.elapsed() < Duration::from_secs(3));
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_head_restarts_block_deadline() {
        let mut h = started(config((5, 6), (1000, 1001)));
        let start = Instant::now();

        tokio::time::sleep(Duration::from_secs(4)).await;
        h.chain_tx.send(ChainEvent::HeadChanged(Block::default())).unwrap();
        // Sync events leave the deadline alone
        h.chain_tx.send(ChainEvent::SyncDone).unwrap();

        next_create_block(&mut h.rx).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(9), "deadline not restarted: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(10));
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_timers() {
        let mut h = started(config((1, 2), (1, 2)));
        next_create_block(&mut h.rx).await;

        h.cancel.cancel();
        // Both timer tasks drop their senders on exit
        while h.rx.recv().await.is_some() {}
        assert!(matches!(
            h.strategy.start(StrategyContext {
                commands: CommandSender(mpsc::channel(1).0),
                chain_events: h.chain_tx.subscribe(),
                cancel: CancellationToken::new(),
            }),
            Err(ConsensusError::AlreadyStarted)
        ));
    }
}
