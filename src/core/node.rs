//! KvNode - request-layer facade over one replica
//!
//! Reads hit the local replica directly. Writes go through the admission
//! gate and are applied only when the collaborator delivers them back as
//! committed entries.

use std::sync::Arc;
use std::time::Duration;

use super::admission::{Admission, AdmissionGate, Rejection};
use super::replica::Replica;
use crate::replication::{NodeId, ReplicationPort};
use crate::state_machine::Command;

/// Outcome of a client write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Committed { index: u64 },
    NotLeader { leader_hint: Option<NodeId> },
    /// Fate unknown; the write may still be applied later
    Timeout,
    InternalError(String),
}

impl From<Admission> for WriteOutcome {
    fn from(admission: Admission) -> Self {
        match admission {
            Admission::Ack { index } => WriteOutcome::Committed { index },
            Admission::Rejected(Rejection::NotLeader { leader_hint }) => {
                WriteOutcome::NotLeader { leader_hint }
            }
            Admission::Rejected(Rejection::Failed(reason)) => WriteOutcome::InternalError(reason),
            Admission::TimedOut => WriteOutcome::Timeout,
        }
    }
}

/// A key-value node: one replica plus its write path
pub struct KvNode {
    id: NodeId,
    replica: Arc<Replica>,
    gate: AdmissionGate,
    submit_timeout: Duration,
}

impl KvNode {
    pub fn new(
        id: NodeId,
        replica: Arc<Replica>,
        port: Arc<dyn ReplicationPort>,
        submit_timeout: Duration,
    ) -> Self {
        KvNode {
            id,
            replica,
            gate: AdmissionGate::new(port),
            submit_timeout,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    /// Local read; may be stale on followers
    pub fn get(&self, key: &str) -> Option<String> {
        self.replica.store().read(key)
    }

    pub async fn put(&self, key: impl Into<String>, value: impl Into<String>) -> WriteOutcome {
        self.write(Command::put(key, value)).await
    }

    pub async fn delete(&self, key: impl Into<String>) -> WriteOutcome {
        self.write(Command::delete(key)).await
    }

    pub async fn write(&self, command: Command) -> WriteOutcome {
        self.gate.admit(&command, self.submit_timeout).await.into()
    }

    pub fn is_leader(&self) -> bool {
        self.gate.is_leader()
    }

    pub fn leader_hint(&self) -> Option<NodeId> {
        self.gate.leader_hint()
    }

    /// False after a failed snapshot restore; the node must not serve as current
    pub fn is_current(&self) -> bool {
        self.replica.store().is_current()
    }

    pub fn last_applied(&self) -> u64 {
        self.replica.store().last_applied()
    }
}
