//! Vote Node
//!
//! Runs a voting node against an in-memory chain: the block-maker strategy,
//! the voting ledger client and the administrative JSON-RPC server.

use anyhow::Result;
use clap::Parser;
use rpc_server::{methods::RpcContext, HttpRpcServer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vote_consensus::{HttpLedgerTransport, RandomDeadlineStrategy, VotingNode};
use vote_runtime::{dev_genesis, Address, LocalKeystore, MemoryChain, TxPool};

mod config;

use config::{parse_key, ValidatorConfig};

/// Voting-based block production node
#[derive(Parser, Debug)]
#[command(name = "vote-node")]
#[command(about = "Voting-based block producer", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// HTTP RPC bind address (overrides the config file)
    #[arg(long)]
    rpc_addr: Option<String>,

    /// Voting ledger JSON-RPC URL (overrides the config file)
    #[arg(long)]
    ledger_url: Option<String>,

    /// Hex-encoded secret key for signing votes
    #[arg(long)]
    vote_key: Option<String>,

    /// Hex-encoded secret key for sealing blocks
    #[arg(long)]
    block_maker_key: Option<String>,

    /// Generate fresh vote and block-maker keys
    #[arg(long)]
    dev: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => ValidatorConfig::load(path)?,
        None => ValidatorConfig::default(),
    };
    if let Some(addr) = args.rpc_addr.clone() {
        config.rpc.http_addr = addr;
    }
    if let Some(url) = args.ledger_url.clone() {
        config.ledger.url = url;
    }

    run(args, config).await
}

async fn run(args: Args, config: ValidatorConfig) -> Result<()> {
    let keys = Arc::new(LocalKeystore::new());
    let (vote_key, block_maker_key) = if args.dev {
        let (_, vote) = keys.generate();
        let (_, maker) = keys.generate();
        (Some(vote), Some(maker))
    } else {
        let vote = match &args.vote_key {
            Some(hex_key) => Some(parse_key(hex_key)?),
            None => config.vote_signing_key()?,
        };
        let maker = match &args.block_maker_key {
            Some(hex_key) => Some(parse_key(hex_key)?),
            None => config.block_maker_signing_key()?,
        };
        (vote, maker)
    };
    for key in vote_key.iter().chain(block_maker_key.iter()) {
        keys.insert(key.clone());
    }

    tracing::info!("Starting vote node");
    tracing::info!("  HTTP RPC: {}", config.rpc.http_addr);
    tracing::info!("  Voting ledger: {}", config.ledger.url);
    if let Some(key) = &vote_key {
        tracing::info!("  Vote account: {}", Address::from_signing_key(key));
    }
    if let Some(key) = &block_maker_key {
        tracing::info!("  Block maker account: {}", Address::from_signing_key(key));
    }
    tracing::info!(
        "  Block time: {}-{}s, vote time: {}-{}s",
        config.strategy.min_block_time,
        config.strategy.max_block_time,
        config.strategy.min_vote_time,
        config.strategy.max_vote_time
    );

    let chain = Arc::new(MemoryChain::new(
        dev_genesis(config.alloc.clone()),
        config.node.pending.block_reward,
    ));
    let pool = Arc::new(TxPool::new());

    let node = Arc::new(
        VotingNode::builder()
            .config(config.node.clone())
            .build(chain.clone(), pool.clone(), keys),
    );

    let transport = Arc::new(HttpLedgerTransport::new(
        &config.ledger.url,
        Duration::from_secs(config.ledger.timeout_secs),
    )?);
    let strategy = Arc::new(RandomDeadlineStrategy::new(config.strategy));
    node.start(transport, strategy, vote_key, block_maker_key).await?;

    // Log blocks made by this node
    let mut mined = node.subscribe_mined();
    let mined_logger = tokio::spawn(async move {
        while let Ok(block) = mined.recv().await {
            tracing::info!(
                "Block #{} {} sealed with {} transactions",
                block.number(),
                block.hash(),
                block.transactions.len()
            );
        }
    });

    // Start HTTP RPC server
    let mut rpc_context = RpcContext::new(node.clone(), pool.clone());
    rpc_context.request_timeout = Duration::from_secs(config.rpc.request_timeout_secs);
    let http_addr = config.rpc.http_addr.clone();
    let http_server = tokio::spawn(async move {
        let server = HttpRpcServer::new(Arc::new(rpc_context));
        if let Err(e) = server.run(&http_addr).await {
            tracing::error!("HTTP RPC server error: {}", e);
        }
    });

    tracing::info!("Vote node running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    node.shutdown();

    let stats = node.stats();
    tracing::info!(
        "Cast {} votes ({} failed), created {} blocks ({} failed)",
        stats.votes_cast,
        stats.vote_failures,
        stats.blocks_created,
        stats.block_failures
    );

    mined_logger.abort();
    http_server.abort();

    tracing::info!("Vote node stopped");

    Ok(())
}
