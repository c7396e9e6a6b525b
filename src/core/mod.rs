//! Node-level components
//!
//! - `SnapshotManager`: snapshot capture and atomic restore
//! - `AdmissionGate`: leadership-gated write submission
//! - `Replica` / `KvNode`: the state machine and its request-layer facade

pub mod admission;
pub mod config;
pub mod node;
pub mod replica;
pub mod snapshot;

pub use admission::{Admission, AdmissionGate, Rejection};
pub use config::{ConfigError, NodeConfig};
pub use node::{KvNode, WriteOutcome};
pub use replica::Replica;
pub use snapshot::{RestoreError, Snapshot, SnapshotError, SnapshotManager, SnapshotMetadata};
