//! In-memory log and snapshot storage for testing
//!
//! Snapshots are kept as serialized bytes so loads go through the same
//! decode and validation path as the file store.

use super::{LogStore, SnapshotStore, StorageError};
use crate::core::snapshot::Snapshot;
use crate::replication::CommittedEntry;

/// In-memory log; nothing survives the process
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStore {
    entries: Vec<CommittedEntry>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryLogStore {
    fn append(&mut self, entry: &CommittedEntry) -> Result<(), StorageError> {
        self.entries.push(entry.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<CommittedEntry>, StorageError> {
        Ok(self.entries.clone())
    }

    fn compact_through(&mut self, index: u64) -> Result<(), StorageError> {
        self.entries.retain(|e| e.index > index);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    latest: Option<Vec<u8>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored bytes, for corruption tests
    pub fn raw_mut(&mut self) -> Option<&mut Vec<u8>> {
        self.latest.as_mut()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.latest = Some(snapshot.to_bytes()?);
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        match &self.latest {
            None => Ok(None),
            Some(bytes) => Ok(Some(Snapshot::from_bytes(bytes)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Replica;
    use crate::replication::CommittedEntry;
    use crate::state_machine::{Command, Snapshotable, StateMachine};

    #[test]
    fn test_memory_log_append_and_compact() {
        let mut log = MemoryLogStore::new();
        for index in 1..=4 {
            log.append(&CommittedEntry::noop(index)).unwrap();
        }

        log.compact_through(2).unwrap();

        let indices: Vec<u64> = log.load().unwrap().iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![3, 4]);
    }

    #[test]
    fn test_memory_store_empty() {
        let store = MemorySnapshotStore::new();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_memory_store_keeps_latest() {
        let replica = Replica::new();
        let mut store = MemorySnapshotStore::new();

        replica.apply(&CommittedEntry::command(1, Command::put("a", "1").encode().unwrap()));
        store.save(&replica.snapshot()).unwrap();
        replica.apply(&CommittedEntry::command(2, Command::put("a", "2").encode().unwrap()));
        store.save(&replica.snapshot()).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.get("a"), Some("2"));
        assert_eq!(loaded.last_applied_index(), 2);
    }

    #[test]
    fn test_memory_store_detects_garbage() {
        let replica = Replica::new();
        let mut store = MemorySnapshotStore::new();
        store.save(&replica.snapshot()).unwrap();

        if let Some(raw) = store.raw_mut() {
            raw.truncate(3);
        }

        assert!(matches!(store.load(), Err(StorageError::Decode(_))));
    }
}
