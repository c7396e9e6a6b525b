//! Consensus collaborator boundary
//!
//! - `ReplicationPort`: what the write path needs from the consensus log
//! - `CommitSequencer`: in-order delivery of committed entries
//! - `InMemoryCluster`: single-process log used by the server binary and tests

pub mod memory;
pub mod sequencer;
pub mod traits;

pub use memory::{Durability, InMemoryCluster, InMemoryReplicator, ReplicationError};
pub use sequencer::{CommitSequencer, SequenceError};
pub use traits::{CommittedEntry, EntryKind, NodeId, ReplicationPort, SubmitError};
