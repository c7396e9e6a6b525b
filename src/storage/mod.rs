//! Log and snapshot storage
//!
//! - `MemoryLogStore` / `MemorySnapshotStore`: in-memory, for tests
//! - `FileLogStore`: JSON lines, one checksum per line, fsynced on append
//! - `FileSnapshotStore`: single checksummed file, written atomically

pub mod file;
pub mod memory;
pub mod traits;

pub use file::{FileLogStore, FileSnapshotStore};
pub use memory::{MemoryLogStore, MemorySnapshotStore};
pub use traits::{LogStore, SnapshotStore, StorageError};
