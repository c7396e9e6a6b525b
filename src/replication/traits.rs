//! Boundary between the state machine and the consensus log
//!
//! The consensus collaborator owns leader election, replication and the
//! durable log. The state machine only sees it through this trait (for
//! submitting writes) and through the `StateMachine` / `Snapshotable`
//! callbacks it invokes on every replica.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a replica in the cluster
pub type NodeId = u64;

/// Kind of a committed log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Client write command, decoded and applied by the state machine
    Command,
    /// No-op appended by a new leader
    Noop,
    /// Cluster membership change, internal to the collaborator
    Configuration,
}

/// A log entry the collaborator has durably committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedEntry {
    /// Position in the log (1-indexed, strictly increasing)
    pub index: u64,
    pub kind: EntryKind,
    /// Raw command bytes; empty for internal entries
    pub data: Vec<u8>,
}

impl CommittedEntry {
    pub fn command(index: u64, data: Vec<u8>) -> Self {
        CommittedEntry {
            index,
            kind: EntryKind::Command,
            data,
        }
    }

    pub fn noop(index: u64) -> Self {
        CommittedEntry {
            index,
            kind: EntryKind::Noop,
            data: Vec::new(),
        }
    }
}

/// Errors reported by `ReplicationPort::submit`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// This node is not (or is no longer) the leader
    #[error("not the leader")]
    NotLeader { leader_hint: Option<NodeId> },
    /// The command was not observed committed before the deadline.
    /// It may still commit later.
    #[error("timed out waiting for commit")]
    Timeout,
    /// The collaborator dropped the command before committing it
    #[error("submission aborted: {0}")]
    Aborted(String),
    /// The collaborator is shutting down
    #[error("replication collaborator shut down")]
    Shutdown,
}

/// Write side of the consensus collaborator
#[async_trait]
pub trait ReplicationPort: Send + Sync {
    /// Whether this node currently holds leadership
    fn is_leader(&self) -> bool;

    /// Best-known current leader, used for client redirects
    fn leader_hint(&self) -> Option<NodeId> {
        None
    }

    /// Propose a command for replication.
    ///
    /// Returns the committed log index once the entry is committed and has
    /// been applied on this node. Leadership is re-checked atomically with
    /// the proposal; a stale leadership view surfaces as `NotLeader`.
    async fn submit(&self, command: Vec<u8>, timeout: Duration) -> Result<u64, SubmitError>;
}
