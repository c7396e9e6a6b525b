//! Gap-free, in-order delivery of committed entries
//!
//! The state machine never checks ordering itself; the delivery path runs
//! every entry through a `CommitSequencer` before calling `apply`.

use std::collections::BTreeMap;

use thiserror::Error;

use super::traits::CommittedEntry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    /// Entry was already delivered or is already buffered
    #[error("entry {index} is stale (last delivered {last_delivered})")]
    Stale { index: u64, last_delivered: u64 },
}

/// Buffers out-of-order entries and releases contiguous runs
#[derive(Debug, Default)]
pub struct CommitSequencer {
    last_delivered: u64,
    buffered: BTreeMap<u64, CommittedEntry>,
}

impl CommitSequencer {
    /// Start after `last_delivered` (0 for an empty log, or a snapshot index)
    pub fn new(last_delivered: u64) -> Self {
        CommitSequencer {
            last_delivered,
            buffered: BTreeMap::new(),
        }
    }

    pub fn last_delivered(&self) -> u64 {
        self.last_delivered
    }

    /// Number of entries held back waiting for a gap to fill
    pub fn pending(&self) -> usize {
        self.buffered.len()
    }

    /// Offer an entry; returns every entry that is now deliverable, in order
    pub fn offer(&mut self, entry: CommittedEntry) -> Result<Vec<CommittedEntry>, SequenceError> {
        if entry.index <= self.last_delivered || self.buffered.contains_key(&entry.index) {
            return Err(SequenceError::Stale {
                index: entry.index,
                last_delivered: self.last_delivered,
            });
        }
        self.buffered.insert(entry.index, entry);

        let mut ready = Vec::new();
        while let Some(next) = self.buffered.remove(&(self.last_delivered + 1)) {
            self.last_delivered = next.index;
            ready.push(next);
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indices(entries: &[CommittedEntry]) -> Vec<u64> {
        entries.iter().map(|e| e.index).collect()
    }

    #[test]
    fn test_in_order_passes_through() {
        let mut seq = CommitSequencer::new(0);
        assert_eq!(indices(&seq.offer(CommittedEntry::noop(1)).unwrap()), vec![1]);
        assert_eq!(indices(&seq.offer(CommittedEntry::noop(2)).unwrap()), vec![2]);
        assert_eq!(seq.last_delivered(), 2);
    }

    #[test]
    fn test_reorders_one_three_two() {
        let mut seq = CommitSequencer::new(0);

        assert_eq!(indices(&seq.offer(CommittedEntry::noop(1)).unwrap()), vec![1]);
        assert!(seq.offer(CommittedEntry::noop(3)).unwrap().is_empty());
        assert_eq!(seq.pending(), 1);
        assert_eq!(indices(&seq.offer(CommittedEntry::noop(2)).unwrap()), vec![2, 3]);
        assert_eq!(seq.pending(), 0);
    }

    #[test]
    fn test_rejects_duplicate_delivery() {
        let mut seq = CommitSequencer::new(0);
        seq.offer(CommittedEntry::noop(1)).unwrap();

        let result = seq.offer(CommittedEntry::noop(1));
        assert_eq!(
            result,
            Err(SequenceError::Stale {
                index: 1,
                last_delivered: 1
            })
        );
    }

    #[test]
    fn test_rejects_duplicate_buffered() {
        let mut seq = CommitSequencer::new(0);
        seq.offer(CommittedEntry::noop(5)).unwrap();
        assert!(seq.offer(CommittedEntry::noop(5)).is_err());
    }

    #[test]
    fn test_starts_after_snapshot_index() {
        let mut seq = CommitSequencer::new(10);
        assert!(seq.offer(CommittedEntry::noop(10)).is_err());
        assert_eq!(indices(&seq.offer(CommittedEntry::noop(11)).unwrap()), vec![11]);
    }
}
