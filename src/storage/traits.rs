//! Persistence abstractions for the replicated log
//!
//! The consensus collaborator appends every entry to a `LogStore` before it
//! counts as committed. When it compacts, it hands the captured snapshot to
//! a `SnapshotStore` and drops the log entries the snapshot covers. On
//! restart it reads both back.

use thiserror::Error;

use crate::core::snapshot::{RestoreError, Snapshot, SnapshotError};
use crate::replication::CommittedEntry;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error (e.g., disk full, permission denied)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("data corruption: {0}")]
    Corruption(String),
    #[error(transparent)]
    Encode(#[from] SnapshotError),
    #[error("log entry serialization failed: {0}")]
    Entry(#[from] serde_json::Error),
    /// Stored bytes are intact but not a usable snapshot
    #[error(transparent)]
    Decode(#[from] RestoreError),
}

/// Keeps the most recent snapshot
///
/// Implementations must ensure durability: `save` returns only once the
/// snapshot would survive a crash, and a crash mid-save leaves the previous
/// snapshot readable.
pub trait SnapshotStore: Send {
    /// Replace the stored snapshot
    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// Load the most recent snapshot; `None` if nothing was saved
    fn load(&self) -> Result<Option<Snapshot>, StorageError>;
}

/// Durable, append-only record of committed entries
///
/// `append` returns only once the entry would survive a crash.
pub trait LogStore: Send {
    /// Append one entry; indices arrive strictly increasing
    fn append(&mut self, entry: &CommittedEntry) -> Result<(), StorageError>;

    /// All retained entries, in index order
    fn load(&self) -> Result<Vec<CommittedEntry>, StorageError>;

    /// Drop every entry with index <= `index` (now covered by a snapshot)
    fn compact_through(&mut self, index: u64) -> Result<(), StorageError>;
}
