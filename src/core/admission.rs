//! Write admission: the single entry point for client writes
//!
//! A write is only proposed when the collaborator reports this node as
//! leader, and the caller waits at most `timeout` for it to commit.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::replication::{NodeId, ReplicationPort, SubmitError};
use crate::state_machine::Command;

/// Why a write was not accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Retry against the leader
    NotLeader { leader_hint: Option<NodeId> },
    /// Submission failed for another reason
    Failed(String),
}

/// Outcome of `AdmissionGate::admit`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Command committed at `index` and applied locally
    Ack { index: u64 },
    Rejected(Rejection),
    /// Gave up waiting; the command may or may not commit later
    TimedOut,
}

/// Leadership-gated, time-bounded command submission
#[derive(Clone)]
pub struct AdmissionGate {
    port: Arc<dyn ReplicationPort>,
}

impl AdmissionGate {
    pub fn new(port: Arc<dyn ReplicationPort>) -> Self {
        AdmissionGate { port }
    }

    pub fn is_leader(&self) -> bool {
        self.port.is_leader()
    }

    pub fn leader_hint(&self) -> Option<NodeId> {
        self.port.leader_hint()
    }

    pub async fn admit(&self, command: &Command, timeout: Duration) -> Admission {
        if !self.port.is_leader() {
            debug!(key = command.key(), "write rejected: not the leader");
            return Admission::Rejected(Rejection::NotLeader {
                leader_hint: self.port.leader_hint(),
            });
        }

        let bytes = match command.encode() {
            Ok(bytes) => bytes,
            Err(err) => return Admission::Rejected(Rejection::Failed(err.to_string())),
        };

        // The timeout is passed down and also enforced here, so a port that
        // ignores it cannot hold the caller past the deadline
        match tokio::time::timeout(timeout, self.port.submit(bytes, timeout)).await {
            Ok(Ok(index)) => Admission::Ack { index },
            Ok(Err(SubmitError::Timeout)) | Err(_) => {
                debug!(key = command.key(), ?timeout, "write timed out, outcome unknown");
                Admission::TimedOut
            }
            Ok(Err(SubmitError::NotLeader { leader_hint })) => {
                debug!(key = command.key(), "leadership lost during submission");
                Admission::Rejected(Rejection::NotLeader { leader_hint })
            }
            Ok(Err(err)) => {
                warn!(key = command.key(), error = %err, "write submission failed");
                Admission::Rejected(Rejection::Failed(err.to_string()))
            }
        }
    }
}
