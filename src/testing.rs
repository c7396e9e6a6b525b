//! Testing utilities for cluster integration tests
//!
//! Provides `TestCluster` for spinning up in-process key-value nodes over an
//! `InMemoryCluster`, optionally serving each over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::api::client_http::create_client_router;
use crate::core::node::KvNode;
use crate::core::replica::Replica;
use crate::core::snapshot::{RestoreError, Snapshot};
use crate::replication::{
    CommittedEntry, InMemoryCluster, InMemoryReplicator, NodeId, ReplicationError,
};
use crate::state_machine::{Snapshotable, StateMachine};

/// A single test node in the cluster
pub struct TestNode {
    /// Node ID
    pub id: NodeId,
    /// Request-layer facade
    pub node: Arc<KvNode>,
    /// Replication handle, for waiting on delivery
    pub port: InMemoryReplicator,
    /// HTTP address, once serving
    pub addr: Option<SocketAddr>,
    /// HTTP server shutdown channel
    http_shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestNode {
    pub fn replica(&self) -> &Arc<Replica> {
        self.node.replica()
    }

    /// Get the node's HTTP address; panics if the node is not serving
    pub fn addr(&self) -> SocketAddr {
        self.addr.expect("node is not serving HTTP")
    }
}

/// A test cluster of key-value nodes sharing one in-memory log
pub struct TestCluster {
    /// The replication collaborator
    pub cluster: InMemoryCluster,
    /// All nodes in the cluster
    pub nodes: Vec<TestNode>,
    submit_timeout: Duration,
}

impl TestCluster {
    /// Create a 3-node cluster without a leader
    pub fn new() -> Self {
        Self::with_nodes(3)
    }

    /// Create a cluster with the specified number of nodes, IDs starting at 1
    pub fn with_nodes(count: usize) -> Self {
        Self::with_nodes_and_timeout(count, Duration::from_millis(500))
    }

    pub fn with_nodes_and_timeout(count: usize, submit_timeout: Duration) -> Self {
        let mut cluster = TestCluster {
            cluster: InMemoryCluster::new(),
            nodes: Vec::new(),
            submit_timeout,
        };
        for id in 1..=count as NodeId {
            cluster.add_node(id).unwrap();
        }
        cluster
    }

    /// Join a fresh replica; it catches up from the latest snapshot and log
    pub fn add_node(&mut self, id: NodeId) -> Result<&TestNode, ReplicationError> {
        let replica = Arc::new(Replica::new());
        let port = self.cluster.join(id, replica.clone())?;
        let node = Arc::new(KvNode::new(
            id,
            replica,
            Arc::new(port.clone()),
            self.submit_timeout,
        ));
        self.nodes.push(TestNode {
            id,
            node,
            port,
            addr: None,
            http_shutdown_tx: None,
        });
        Ok(&self.nodes[self.nodes.len() - 1])
    }

    /// Make `id` the leader
    pub fn elect(&self, id: NodeId) {
        self.cluster.set_leader(Some(id)).unwrap();
    }

    /// Get a node by ID; panics if it is not in the cluster
    pub fn node(&self, id: NodeId) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .unwrap_or_else(|| panic!("no node {}", id))
    }

    /// Wait until every node has applied everything committed so far
    pub async fn wait_converged(&self, timeout: Duration) -> bool {
        let target = self.cluster.commit_index();
        let all = async {
            for node in &self.nodes {
                if !node.port.wait_applied(target).await {
                    return false;
                }
            }
            true
        };
        tokio::time::timeout(timeout, all).await.unwrap_or(false)
    }

    /// Start an HTTP server for every node on an ephemeral port
    pub async fn serve(&mut self) {
        for node in &mut self.nodes {
            if node.http_shutdown_tx.is_some() {
                continue;
            }
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            node.addr = Some(listener.local_addr().unwrap());

            let app = create_client_router(node.node.clone());
            let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel();

            // Spawn the HTTP server with graceful shutdown
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = http_shutdown_rx.await;
                    })
                    .await
                    .unwrap();
            });
            node.http_shutdown_tx = Some(http_shutdown_tx);
        }
    }

    /// Get all node addresses as strings, for HTTP clients
    pub fn all_addr_strings(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.addr().to_string()).collect()
    }

    /// Stop every HTTP server
    pub async fn shutdown(mut self) {
        for node in &mut self.nodes {
            if let Some(tx) = node.http_shutdown_tx.take() {
                let _ = tx.send(());
            }
        }
        // Give servers time to shutdown
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps a replica and records every delivered index, in delivery order
#[derive(Default)]
pub struct RecordingStateMachine {
    inner: Replica,
    applied: Mutex<Vec<u64>>,
}

impl RecordingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replica(&self) -> &Replica {
        &self.inner
    }

    /// Indices delivered so far
    pub fn applied_indices(&self) -> Vec<u64> {
        self.applied.lock().clone()
    }
}

impl StateMachine for RecordingStateMachine {
    fn apply(&self, entry: &CommittedEntry) {
        self.applied.lock().push(entry.index);
        self.inner.apply(entry);
    }
}

impl Snapshotable for RecordingStateMachine {
    fn snapshot(&self) -> Snapshot {
        self.inner.snapshot()
    }

    fn restore(&self, snapshot: Snapshot) -> Result<(), RestoreError> {
        self.inner.restore(snapshot)
    }
}
