//! Replica - the state machine as seen by the consensus collaborator

use std::sync::Arc;

use super::snapshot::{RestoreError, Snapshot, SnapshotManager};
use crate::replication::CommittedEntry;
use crate::state_machine::{KvStore, Snapshotable, StateMachine};

/// Local replica of the key-value state: applies committed entries and
/// serves snapshot capture/install
#[derive(Debug, Clone)]
pub struct Replica {
    store: Arc<KvStore>,
    snapshots: SnapshotManager,
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica {
    pub fn new() -> Self {
        let store = Arc::new(KvStore::new());
        Replica {
            snapshots: SnapshotManager::new(store.clone()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }
}

impl StateMachine for Replica {
    fn apply(&self, entry: &CommittedEntry) {
        self.store.apply(entry);
    }
}

impl Snapshotable for Replica {
    fn snapshot(&self) -> Snapshot {
        self.snapshots.capture()
    }

    fn restore(&self, snapshot: Snapshot) -> Result<(), RestoreError> {
        self.snapshots.restore(snapshot)
    }
}
