//! Replicated key-value map
//!
//! Writes arrive only as committed log entries through `apply`. Reads go
//! straight to local state and may lag the leader on followers.
//!
//! One `RwLock` guards the whole applied state: `apply` and snapshot
//! install take it exclusively, reads and snapshot capture share it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{trace, warn};

use super::command::Command;
use super::traits::StateMachine;
use crate::replication::{CommittedEntry, EntryKind};

/// Map contents plus the position in the log they reflect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct AppliedState {
    pub(crate) last_applied: u64,
    pub(crate) data: BTreeMap<String, String>,
}

/// In-memory key-value store, one per replica
#[derive(Debug)]
pub struct KvStore {
    state: RwLock<AppliedState>,
    current: AtomicBool,
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore {
    pub fn new() -> Self {
        KvStore {
            state: RwLock::new(AppliedState::default()),
            current: AtomicBool::new(true),
        }
    }

    /// Apply a committed entry.
    ///
    /// Malformed commands are logged and skipped. Internal entries are not
    /// decoded. Every entry advances `last_applied`.
    pub fn apply(&self, entry: &CommittedEntry) {
        let command = match entry.kind {
            EntryKind::Command => match Command::decode(&entry.data) {
                Ok(command) => Some(command),
                Err(err) => {
                    warn!(index = entry.index, error = %err, "skipping malformed committed entry");
                    None
                }
            },
            EntryKind::Noop | EntryKind::Configuration => {
                trace!(index = entry.index, kind = ?entry.kind, "ignoring internal entry");
                None
            }
        };

        let mut state = self.state.write();
        if let Some(command) = command {
            match command.into_parts() {
                (key, Some(value)) => {
                    state.data.insert(key, value);
                }
                (key, None) => {
                    state.data.remove(&key);
                }
            }
        }
        state.last_applied = entry.index;
    }

    /// Latest applied value for `key`
    pub fn read(&self, key: &str) -> Option<String> {
        self.state.read().data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().data.is_empty()
    }

    /// Index of the last entry applied (or installed from a snapshot)
    pub fn last_applied(&self) -> u64 {
        self.state.read().last_applied
    }

    /// False after a failed snapshot restore, until a restore succeeds
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::Acquire)
    }

    pub(crate) fn mark_stale(&self) {
        self.current.store(false, Ordering::Release);
    }

    /// Copy of the whole state, taken under the shared lock
    pub(crate) fn copy_state(&self) -> AppliedState {
        self.state.read().clone()
    }

    /// Swap in a fully built state under the exclusive lock
    pub(crate) fn install(&self, state: AppliedState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        self.current.store(true, Ordering::Release);
        // Old map is freed after the lock is released
        drop(previous);
    }
}

impl StateMachine for KvStore {
    fn apply(&self, entry: &CommittedEntry) {
        KvStore::apply(self, entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::{HashMap, HashSet};
    use std::thread;

    fn put(index: u64, key: &str, value: &str) -> CommittedEntry {
        CommittedEntry::command(index, Command::put(key, value).encode().unwrap())
    }

    fn delete(index: u64, key: &str) -> CommittedEntry {
        CommittedEntry::command(index, Command::delete(key).encode().unwrap())
    }

    #[test]
    fn test_put_and_read() {
        let kv = KvStore::new();
        kv.apply(&put(1, "foo", "bar"));
        assert_eq!(kv.read("foo"), Some("bar".to_string()));
        assert_eq!(kv.last_applied(), 1);
    }

    #[test]
    fn test_read_not_found() {
        let kv = KvStore::new();
        assert_eq!(kv.read("nonexistent"), None);
    }

    #[test]
    fn test_delete() {
        let kv = KvStore::new();
        kv.apply(&put(1, "foo", "bar"));
        kv.apply(&delete(2, "foo"));
        assert_eq!(kv.read("foo"), None);
        assert!(kv.is_empty());
    }

    #[test]
    fn test_delete_absent_key_is_noop() {
        let kv = KvStore::new();
        kv.apply(&put(1, "keep", "me"));
        let before = kv.copy_state().data;

        kv.apply(&delete(2, "nonexistent"));

        assert_eq!(kv.copy_state().data, before);
        assert_eq!(kv.last_applied(), 2);
    }

    #[test]
    fn test_overwrite() {
        let kv = KvStore::new();
        kv.apply(&put(1, "key", "value1"));
        kv.apply(&put(2, "key", "value2"));
        assert_eq!(kv.read("key"), Some("value2".to_string()));
        assert_eq!(kv.len(), 1);
    }

    #[test]
    fn test_value_with_spaces() {
        let kv = KvStore::new();
        kv.apply(&put(1, "greeting", "hello world"));
        assert_eq!(kv.read("greeting"), Some("hello world".to_string()));
    }

    #[test]
    fn test_malformed_entry_skipped_and_stream_continues() {
        let kv = KvStore::new();
        kv.apply(&put(1, "a", "1"));
        kv.apply(&CommittedEntry::command(2, b"not json".to_vec()));
        kv.apply(&put(3, "b", "2"));

        assert_eq!(kv.read("a"), Some("1".to_string()));
        assert_eq!(kv.read("b"), Some("2".to_string()));
        assert_eq!(kv.len(), 2);
        assert_eq!(kv.last_applied(), 3);
    }

    #[test]
    fn test_internal_entries_not_decoded() {
        let kv = KvStore::new();
        // Payload would be a valid put if it were decoded
        let payload = Command::put("x", "y").encode().unwrap();
        kv.apply(&CommittedEntry {
            index: 1,
            kind: EntryKind::Configuration,
            data: payload,
        });
        kv.apply(&CommittedEntry::noop(2));

        assert!(kv.is_empty());
        assert_eq!(kv.last_applied(), 2);
    }

    #[test]
    fn test_deterministic_across_instances() {
        let mut rng = StdRng::seed_from_u64(7);
        let keys = ["a", "b", "c", "d", "e"];
        let entries: Vec<CommittedEntry> = (1..=500)
            .map(|index| {
                let key = keys[rng.random_range(0..keys.len())];
                if rng.random_bool(0.3) {
                    delete(index, key)
                } else {
                    put(index, key, &rng.random_range(0..1000).to_string())
                }
            })
            .collect();

        let kv1 = KvStore::new();
        let kv2 = KvStore::new();
        for entry in &entries {
            kv1.apply(entry);
        }
        for entry in &entries {
            kv2.apply(entry);
        }

        assert_eq!(kv1.copy_state(), kv2.copy_state());
    }

    #[test]
    fn test_reads_concurrent_with_apply() {
        let mut rng = StdRng::seed_from_u64(42);
        let keys = ["a", "b", "c", "d"];
        let mut written: HashMap<&str, HashSet<String>> = HashMap::new();
        let entries: Vec<CommittedEntry> = (1..=2000)
            .map(|index| {
                let key = keys[rng.random_range(0..keys.len())];
                if rng.random_bool(0.2) {
                    delete(index, key)
                } else {
                    let value = format!("{}-{}", key, index);
                    written.entry(key).or_default().insert(value.clone());
                    put(index, key, &value)
                }
            })
            .collect();

        let kv = KvStore::new();
        let done = AtomicBool::new(false);

        let observed: Vec<(&str, String)> = thread::scope(|s| {
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        let mut seen = Vec::new();
                        while !done.load(Ordering::Acquire) {
                            for key in keys {
                                if let Some(value) = kv.read(key) {
                                    seen.push((key, value));
                                }
                            }
                        }
                        seen
                    })
                })
                .collect();

            for entry in &entries {
                kv.apply(entry);
            }
            done.store(true, Ordering::Release);

            readers
                .into_iter()
                .flat_map(|r| r.join().unwrap())
                .collect()
        });

        for (key, value) in &observed {
            assert!(
                written[key].contains(value),
                "read {:?} for {} which was never written to it",
                value,
                key
            );
        }

        let sequential = KvStore::new();
        for entry in &entries {
            sequential.apply(entry);
        }
        assert_eq!(kv.copy_state(), sequential.copy_state());
        assert_eq!(kv.last_applied(), 2000);
    }

    #[test]
    fn test_store_trusts_delivery_order() {
        // The store does not reorder; ordering is the delivery path's job
        let in_order = KvStore::new();
        in_order.apply(&put(1, "k", "first"));
        in_order.apply(&put(2, "k", "second"));

        let swapped = KvStore::new();
        swapped.apply(&put(2, "k", "second"));
        swapped.apply(&put(1, "k", "first"));

        assert_eq!(in_order.read("k"), Some("second".to_string()));
        assert_eq!(swapped.read("k"), Some("first".to_string()));
    }

    #[test]
    fn test_install_replaces_state_and_marks_current() {
        let kv = KvStore::new();
        kv.apply(&put(1, "old", "data"));
        kv.mark_stale();
        assert!(!kv.is_current());

        let mut data = BTreeMap::new();
        data.insert("new".to_string(), "data".to_string());
        kv.install(AppliedState {
            last_applied: 9,
            data,
        });

        assert!(kv.is_current());
        assert_eq!(kv.read("old"), None);
        assert_eq!(kv.read("new"), Some("data".to_string()));
        assert_eq!(kv.last_applied(), 9);
    }
}
