//! Key-value server binary
//!
//! Runs a single key-value node over an in-process replication log, serving
//! the client API over HTTP. The node leads its own single-member cluster.
//! Every committed entry is fsynced to `KV_DATA_DIR/log` before the write is
//! acknowledged; compaction moves it into `KV_DATA_DIR/snapshot`.
//!
//! Configuration comes from the environment:
//!   KV_NODE_ID               node id (required)
//!   KV_API_ADDR              client API address (default: 127.0.0.1:8080)
//!   KV_DATA_DIR              log and snapshot directory (default: ./data)
//!   KV_SUBMIT_TIMEOUT_MS     write commit timeout (default: 500)
//!   KV_SNAPSHOT_INTERVAL_MS  compaction check interval (default: 30000)
//!   KV_SNAPSHOT_THRESHOLD    log entries before compacting (default: 1000, 0 disables)
//!
//! Logging follows RUST_LOG (default: info).
//!
//! Example:
//!   KV_NODE_ID=1 KV_API_ADDR=127.0.0.1:9001 KV_DATA_DIR=/tmp/kv1 kv-server

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rsm_kv::api::create_client_router;
use rsm_kv::core::{KvNode, NodeConfig, Replica};
use rsm_kv::replication::{Durability, InMemoryCluster};
use rsm_kv::storage::{FileLogStore, FileSnapshotStore};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// Compact whenever the retained log reaches the threshold, until `shutdown` fires
async fn run_compaction(
    config: NodeConfig,
    cluster: InMemoryCluster,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(config.snapshot_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => return,
        }

        let retained = cluster.log_len() as u64;
        if config.snapshot_threshold == 0 || retained < config.snapshot_threshold {
            continue;
        }
        match cluster.compact(config.id) {
            Ok(metadata) => info!(
                last_applied = metadata.last_applied_index,
                entries = metadata.entry_count,
                "snapshot persisted"
            ),
            Err(err) => warn!(error = %err, "compaction failed"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = NodeConfig::from_env().context("loading configuration")?;
    info!(
        node_id = config.id,
        api_addr = %config.api_addr,
        data_dir = %config.data_dir.display(),
        snapshot_threshold = config.snapshot_threshold,
        "starting node"
    );

    let open_dir = || format!("opening data dir {}", config.data_dir.display());
    let durability = Durability {
        log: Box::new(FileLogStore::new(&config.data_dir).with_context(open_dir)?),
        snapshots: Box::new(FileSnapshotStore::new(&config.data_dir).with_context(open_dir)?),
    };
    let cluster = InMemoryCluster::recover(durability).context("recovering from data dir")?;
    info!(commit_index = cluster.commit_index(), "recovered log");

    let replica = Arc::new(Replica::new());
    let port = cluster.join(config.id, replica.clone())?;
    cluster.set_leader(Some(config.id))?;
    let node = Arc::new(KvNode::new(
        config.id,
        replica,
        Arc::new(port),
        config.submit_timeout,
    ));

    let (compaction_stop_tx, compaction_stop_rx) = oneshot::channel();
    let compaction = tokio::spawn(run_compaction(
        config.clone(),
        cluster.clone(),
        compaction_stop_rx,
    ));

    let listener = TcpListener::bind(config.api_addr)
        .await
        .with_context(|| format!("binding {}", config.api_addr))?;
    info!(addr = %config.api_addr, "client API listening");
    info!("  GET    /health      - Replica health");
    info!("  GET    /leader      - Leadership check");
    info!("  GET    /key/:key    - Read a key");
    info!("  POST   /key         - Write or delete a key");
    info!("  PUT    /key/:key    - Write or delete a key");
    info!("  DELETE /key/:key    - Delete a key");

    axum::serve(listener, create_client_router(node))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
        })
        .await?;

    let _ = compaction_stop_tx.send(());
    compaction.await?;
    Ok(())
}
