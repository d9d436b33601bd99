//! Node runtime: storage, engine, services and the RESP listener.

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use coal_engine::{Engine, EngineOptions, FjallStore};

use crate::counters::Counters;
use crate::locks::{LeaseLocks, DEFAULT_MAX_WAIT};
use crate::resp_server;
use crate::sequences::Sequences;

/// CLI options for running a node.
#[derive(Parser, Debug)]
pub struct NodeArgs {
    #[arg(long)]
    pub listen: SocketAddr,

    #[arg(long)]
    pub data_dir: PathBuf,

    /// Flush-loop idle sleep in microseconds. Lower values shrink update
    /// latency; higher values batch more updates per sync.
    #[arg(long, default_value_t = 1000)]
    pub flush_interval_us: u64,

    /// Periodic fjall background fsync in milliseconds (0 disables it; the
    /// engine's sync commits remain the durability points either way).
    #[arg(long, default_value_t = 0)]
    pub fjall_fsync_ms: u16,
}

/// Everything a connection handler needs.
pub struct NodeState {
    pub engine: Arc<Engine<FjallStore>>,
    pub counters: Counters<FjallStore>,
    pub sequences: Sequences<FjallStore>,
    pub locks: LeaseLocks,
}

/// Run a node until interrupted.
pub async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    run_node_with_shutdown(args, tokio::signal::ctrl_c()).await
}

/// Run a node until `shutdown` resolves, then drain the engine and return.
pub async fn run_node_with_shutdown<F>(args: NodeArgs, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
{
    fs::create_dir_all(&args.data_dir).context("create data dir")?;
    let storage_dir = args.data_dir.join("storage");

    let mut fjall_cfg = fjall::Config::new(&storage_dir).manual_journal_persist(true);
    if args.fjall_fsync_ms > 0 {
        fjall_cfg = fjall_cfg.fsync_ms(Some(args.fjall_fsync_ms));
    }
    let keyspace = Arc::new(fjall_cfg.open().context("open fjall keyspace")?);
    let store = FjallStore::with_keyspace(keyspace)?;

    let flush_interval_us = read_env_u64("COAL_FLUSH_INTERVAL_US", args.flush_interval_us).max(1);
    let engine = Arc::new(Engine::new(
        store,
        EngineOptions {
            idle_sleep: Duration::from_micros(flush_interval_us),
        },
    ));
    let flush = engine.start()?;

    let max_wait_ms = read_env_u64("COAL_LOCK_WAIT_MAX_MS", DEFAULT_MAX_WAIT.as_millis() as u64);
    let state = Arc::new(NodeState {
        counters: Counters::new(Arc::clone(&engine)),
        sequences: Sequences::new(Arc::clone(&engine)),
        locks: LeaseLocks::new(Duration::from_millis(max_wait_ms)),
        engine,
    });

    let listen = args.listen;
    let server = tokio::spawn({
        let state = Arc::clone(&state);
        async move {
            if let Err(err) = resp_server::run(listen, state).await {
                tracing::error!(error = ?err, "resp server failed");
            }
        }
    });

    tracing::info!(
        listen = %listen,
        data_dir = %args.data_dir.display(),
        flush_interval_us,
        "node started"
    );

    shutdown.await?;
    tracing::info!("shutdown requested, draining engine");
    server.abort();
    // Blocks until every in-flight update is durable and acknowledged.
    flush.shutdown();
    tracing::info!("engine drained");
    Ok(())
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(&v).ok())
        .unwrap_or(default)
}
