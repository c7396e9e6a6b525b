//! State machine abstraction driven by the consensus collaborator
//!
//! When log entries are committed, the collaborator hands them to the state
//! machine one at a time, in commit order, on every replica.

use crate::core::snapshot::{RestoreError, Snapshot};
use crate::replication::CommittedEntry;

/// State machine trait - the application logic the log coordinates
///
/// Implementations must be deterministic: applying the same entries
/// in the same order must produce the same state on all nodes.
/// `apply` is never called concurrently with itself.
pub trait StateMachine: Send + Sync {
    /// Apply one committed entry. Failures are handled locally; the
    /// delivery stream must keep flowing.
    fn apply(&self, entry: &CommittedEntry);
}

/// Snapshotable state machine - supports log compaction and catch-up
pub trait Snapshotable: StateMachine {
    /// Capture a consistent copy of the current state
    fn snapshot(&self) -> Snapshot;

    /// Replace the current state with the snapshot's contents
    fn restore(&self, snapshot: Snapshot) -> Result<(), RestoreError>;
}
