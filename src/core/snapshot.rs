//! Snapshot types for log compaction
//!
//! A snapshot is a full, self-describing copy of the applied state at a
//! specific log index. No partial or delta snapshots exist.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::state_machine::kv::{AppliedState, KvStore};

/// Current on-disk snapshot format
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Errors while producing serialized snapshot bytes
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("snapshot write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors while decoding, validating or installing a snapshot.
/// On any of these the live state is left untouched.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("snapshot deserialization failed: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unsupported snapshot version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("snapshot declares {declared} entries but contains {actual}")]
    Inconsistent { declared: u64, actual: u64 },
    #[error("snapshot read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata about what's included in a snapshot
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub version: u32,
    /// Last log index reflected in this snapshot
    pub last_applied_index: u64,
    pub entry_count: u64,
}

/// Immutable point-in-time copy of the key-value state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    data: BTreeMap<String, String>,
}

impl Snapshot {
    pub(crate) fn from_state(state: AppliedState) -> Self {
        Snapshot {
            metadata: SnapshotMetadata {
                version: SNAPSHOT_FORMAT_VERSION,
                last_applied_index: state.last_applied,
                entry_count: state.data.len() as u64,
            },
            data: state.data,
        }
    }

    /// Decode and validate. Nothing is installed anywhere.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RestoreError> {
        let snapshot: Snapshot = serde_json::from_slice(bytes).map_err(RestoreError::Malformed)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Write the serialized snapshot to a persistence sink
    pub fn persist<W: Write>(&self, mut sink: W) -> Result<(), SnapshotError> {
        serde_json::to_writer(&mut sink, self)?;
        sink.flush()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), RestoreError> {
        if self.metadata.version != SNAPSHOT_FORMAT_VERSION {
            return Err(RestoreError::UnsupportedVersion {
                found: self.metadata.version,
                expected: SNAPSHOT_FORMAT_VERSION,
            });
        }
        let actual = self.data.len() as u64;
        if self.metadata.entry_count != actual {
            return Err(RestoreError::Inconsistent {
                declared: self.metadata.entry_count,
                actual,
            });
        }
        Ok(())
    }

    pub fn last_applied_index(&self) -> u64 {
        self.metadata.last_applied_index
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Captures and restores snapshots of a `KvStore`
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    store: Arc<KvStore>,
}

impl SnapshotManager {
    pub fn new(store: Arc<KvStore>) -> Self {
        SnapshotManager { store }
    }

    /// Copy the state under the shared lock; serialization happens later,
    /// without any lock held
    pub fn capture(&self) -> Snapshot {
        let snapshot = Snapshot::from_state(self.store.copy_state());
        debug!(
            last_applied = snapshot.metadata.last_applied_index,
            entries = snapshot.metadata.entry_count,
            "captured snapshot"
        );
        snapshot
    }

    /// Validate, then atomically replace the live state.
    ///
    /// On failure the state is untouched and the store is marked not current.
    pub fn restore(&self, snapshot: Snapshot) -> Result<(), RestoreError> {
        if let Err(err) = snapshot.validate() {
            return Err(self.reject(err));
        }

        let last_applied = snapshot.metadata.last_applied_index;
        let entries = snapshot.metadata.entry_count;
        self.store.install(AppliedState {
            last_applied,
            data: snapshot.data,
        });
        info!(last_applied, entries, "restored snapshot");
        Ok(())
    }

    /// Read a serialized snapshot to the end, decode it into a scratch
    /// value and only then install it
    pub fn restore_from_reader<R: Read>(&self, mut reader: R) -> Result<(), RestoreError> {
        let mut bytes = Vec::new();
        if let Err(err) = reader.read_to_end(&mut bytes) {
            return Err(self.reject(err.into()));
        }
        match Snapshot::from_bytes(&bytes) {
            Ok(snapshot) => self.restore(snapshot),
            Err(err) => Err(self.reject(err)),
        }
    }

    fn reject(&self, err: RestoreError) -> RestoreError {
        warn!(error = %err, "snapshot restore failed, keeping existing state");
        self.store.mark_stale();
        err
    }
}
