//! File-based log and snapshot storage
//!
//! Two files live in the data directory:
//! - `log` - committed entries, JSON lines, each line `"{json} {crc32_hex}"`
//! - `snapshot` - the JSON snapshot followed by its CRC32
//!
//! Log appends are fsynced before returning. Rewrites (log compaction and
//! snapshot saves) go to a temp file which is fsynced and renamed.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{LogStore, SnapshotStore, StorageError};
use crate::core::snapshot::Snapshot;
use crate::replication::CommittedEntry;

/// Atomically write data to a file (write to temp, fsync, rename)
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;

    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Split `"{data} {checksum}"` and verify the checksum
fn verify_line<'a>(line: &'a [u8], location: &str) -> Result<&'a [u8], StorageError> {
    let split = line.iter().rposition(|&b| b == b' ').ok_or_else(|| {
        StorageError::Corruption(format!("invalid format in {}: missing checksum", location))
    })?;
    let (data, checksum) = (&line[..split], &line[split + 1..]);

    let stored_checksum = std::str::from_utf8(checksum)
        .ok()
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .ok_or_else(|| {
            StorageError::Corruption(format!("invalid checksum format in {}", location))
        })?;
    let computed_checksum = crc32fast::hash(data);
    if stored_checksum != computed_checksum {
        return Err(StorageError::Corruption(format!(
            "checksum mismatch in {}: stored {:08x}, computed {:08x}",
            location, stored_checksum, computed_checksum
        )));
    }
    Ok(data)
}

fn encode_line(entry: &CommittedEntry) -> Result<String, StorageError> {
    let json = serde_json::to_string(entry)?;
    let checksum = crc32fast::hash(json.as_bytes());
    Ok(format!("{} {:08x}\n", json, checksum))
}

/// Append-only log file
#[derive(Debug)]
pub struct FileLogStore {
    dir: PathBuf,
}

impl FileLogStore {
    /// Open the log in the given directory, creating it if needed.
    ///
    /// A final line without its newline is a torn append from a crash; it
    /// was never acknowledged and is cut off here.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let store = FileLogStore { dir };

        let path = store.log_path();
        if path.exists() {
            let content = fs::read(&path)?;
            let complete = content
                .iter()
                .rposition(|&b| b == b'\n')
                .map_or(0, |i| i + 1);
            if complete < content.len() {
                warn!(
                    path = %path.display(),
                    bytes = content.len() - complete,
                    "discarding torn log tail"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(complete as u64)?;
                file.sync_all()?;
            }
        }
        Ok(store)
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join("log")
    }
}

impl LogStore for FileLogStore {
    fn append(&mut self, entry: &CommittedEntry) -> Result<(), StorageError> {
        let line = encode_line(entry)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<CommittedEntry>, StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read(&path)?;
        let mut entries = Vec::new();
        for (line_num, line) in content.split(|&b| b == b'\n').enumerate() {
            if line.is_empty() {
                continue;
            }
            let location = format!("{:?} line {}", path, line_num + 1);
            let json = verify_line(line, &location)?;
            let entry: CommittedEntry = serde_json::from_slice(json).map_err(|e| {
                StorageError::Corruption(format!("invalid log entry in {}: {}", location, e))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn compact_through(&mut self, index: u64) -> Result<(), StorageError> {
        let entries = self.load()?;
        let mut content = String::new();
        let mut kept = 0;
        for entry in entries.iter().filter(|e| e.index > index) {
            content.push_str(&encode_line(entry)?);
            kept += 1;
        }
        atomic_write(&self.log_path(), content.as_bytes())?;
        debug!(through = index, kept, "compacted log file");
        Ok(())
    }
}

/// File-based snapshot storage
#[derive(Debug)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    /// Create a store in the given directory, creating it if needed
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(FileSnapshotStore { dir })
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot")
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let mut content = snapshot.to_bytes()?;
        let checksum = crc32fast::hash(&content);
        content.extend_from_slice(format!(" {:08x}\n", checksum).as_bytes());

        let path = self.snapshot_path();
        atomic_write(&path, &content)?;
        debug!(
            path = %path.display(),
            last_applied = snapshot.last_applied_index(),
            bytes = content.len(),
            "persisted snapshot"
        );
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read(&path)?;
        let content = content.strip_suffix(b"\n").unwrap_or(&content);
        if content.is_empty() {
            return Ok(None);
        }

        let data = verify_line(content, &format!("{:?}", path))?;
        Ok(Some(Snapshot::from_bytes(data)?))
    }
}
