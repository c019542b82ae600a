//! File-backed store implementation
//!
//! Persists two files inside a directory:
//! - `meta` - one JSON document holding the format version, database id,
//!   current term, voted-for, committed topology, and snapshot boundary.
//!   Rewritten atomically (temp file, fsync, rename) on every change.
//! - `log` - JSON lines, one entry per line, appended and fsynced as
//!   entries arrive; rewritten atomically on truncation or compaction.
//!
//! Every record carries a CRC32 suffix to detect torn writes. The full log
//! is mirrored in memory for reads and range scans.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::messages::{EntryFlags, LogEntry, NodeId};
use crate::core::snapshot::SnapshotMark;
use crate::core::topology::Topology;

use super::{LogPosition, PersistentStore, StoreError};

const META_FORMAT_VERSION: u32 = 1;

/// CRC32, IEEE polynomial.
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

fn io_err(err: std::io::Error) -> StoreError {
    StoreError::Io(err.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Meta {
    version: u32,
    db_id: String,
    current_term: u64,
    voted_for: Option<NodeId>,
    topology: Option<Topology>,
    snapshot: Option<SnapshotMark>,
}

impl Meta {
    fn fresh() -> Self {
        Meta {
            version: META_FORMAT_VERSION,
            db_id: uuid::Uuid::new_v4().to_string(),
            current_term: 0,
            voted_for: None,
            topology: None,
            snapshot: None,
        }
    }
}

#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    meta: Meta,
    log: BTreeMap<u64, LogEntry>,
}

impl FileStore {
    /// Open (or initialize) a store in `dir`, creating the directory if
    /// needed and verifying checksums on everything read back.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(io_err)?;

        let meta_path = dir.join("meta");
        let meta = match read_checked(&meta_path)? {
            Some(line) => serde_json::from_str(&line)
                .map_err(|e| StoreError::Corruption(format!("invalid meta document: {e}")))?,
            None => Meta::fresh(),
        };
        if meta.version != META_FORMAT_VERSION {
            return Err(StoreError::Corruption(format!(
                "unsupported meta format version {}",
                meta.version
            )));
        }

        let mut log = BTreeMap::new();
        let log_path = dir.join("log");
        if log_path.exists() {
            let content = fs::read_to_string(&log_path).map_err(io_err)?;
            for (line_no, line) in content.lines().enumerate() {
                if line.is_empty() {
                    continue;
                }
                let record = verify_checksum(line).map_err(|e| {
                    StoreError::Corruption(format!("log line {}: {e}", line_no + 1))
                })?;
                let entry: LogEntry = serde_json::from_str(record).map_err(|e| {
                    StoreError::Corruption(format!("log line {}: {e}", line_no + 1))
                })?;
                log.insert(entry.index, entry);
            }
        }

        let mut store = FileStore { dir, meta, log };
        if !meta_path.exists() {
            store.write_meta()?;
        }
        Ok(store)
    }

    /// Stable identity stamped into the metadata on first open.
    pub fn db_id(&self) -> &str {
        &self.meta.db_id
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log")
    }

    fn write_meta(&mut self) -> Result<(), StoreError> {
        let doc = serde_json::to_string(&self.meta)
            .map_err(|e| StoreError::Io(format!("meta encode: {e}")))?;
        atomic_write(&self.meta_path(), checked_line(&doc).as_bytes())
    }

    fn append_log_lines(&self, entries: &[LogEntry]) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .map_err(io_err)?;
        for entry in entries {
            let record = serde_json::to_string(entry)
                .map_err(|e| StoreError::Io(format!("log encode: {e}")))?;
            file.write_all(checked_line(&record).as_bytes()).map_err(io_err)?;
        }
        file.sync_all().map_err(io_err)?;
        Ok(())
    }

    fn rewrite_log(&self) -> Result<(), StoreError> {
        let mut buf = String::new();
        for entry in self.log.values() {
            let record = serde_json::to_string(entry)
                .map_err(|e| StoreError::Io(format!("log encode: {e}")))?;
            buf.push_str(&checked_line(&record));
        }
        atomic_write(&self.log_path(), buf.as_bytes())
    }
}

/// `"{record} {crc32_hex}\n"`.
fn checked_line(record: &str) -> String {
    format!("{} {:08x}\n", record, crc32(record.as_bytes()))
}

fn verify_checksum(line: &str) -> Result<&str, String> {
    let (record, checksum) = line
        .rsplit_once(' ')
        .ok_or_else(|| "missing checksum".to_string())?;
    let stored = u32::from_str_radix(checksum, 16).map_err(|_| "invalid checksum".to_string())?;
    let computed = crc32(record.as_bytes());
    if stored != computed {
        return Err(format!("checksum mismatch: stored {stored:08x}, computed {computed:08x}"));
    }
    Ok(record)
}

fn read_checked(path: &Path) -> Result<Option<String>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(io_err)?;
    let content = content.trim();
    if content.is_empty() {
        return Ok(None);
    }
    verify_checksum(content)
        .map(|record| Some(record.to_string()))
        .map_err(|e| StoreError::Corruption(format!("{path:?}: {e}")))
}

/// Write to a temp file, fsync, rename into place.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path).map_err(io_err)?;
    file.write_all(data).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    fs::rename(&temp_path, path).map_err(io_err)?;
    Ok(())
}

impl PersistentStore for FileStore {
    fn current_term(&self) -> u64 {
        self.meta.current_term
    }

    fn voted_for(&self) -> Option<NodeId> {
        self.meta.voted_for.clone()
    }

    fn increment_term_and_vote_for(&mut self, id: &str) -> Result<u64, StoreError> {
        self.meta.current_term += 1;
        self.meta.voted_for = Some(id.to_string());
        self.write_meta()?;
        Ok(self.meta.current_term)
    }

    fn update_term_to(&mut self, term: u64) -> Result<(), StoreError> {
        self.meta.current_term = term;
        self.meta.voted_for = None;
        self.write_meta()
    }

    fn record_vote_for(&mut self, id: &str) -> Result<(), StoreError> {
        self.meta.voted_for = Some(id.to_string());
        self.write_meta()
    }

    fn append_to_leader_log(
        &mut self,
        term: u64,
        data: Vec<u8>,
        flags: EntryFlags,
    ) -> Result<u64, StoreError> {
        let index = self.last_log_entry().index + 1;
        let entry = LogEntry { index, term, data, flags };
        self.append_log_lines(std::slice::from_ref(&entry))?;
        self.log.insert(index, entry);
        Ok(index)
    }

    fn append_to_log(
        &mut self,
        entries: &[LogEntry],
        remove_all_after: u64,
    ) -> Result<(), StoreError> {
        let old_last = self.log.keys().next_back().copied().unwrap_or(0);
        if entries.is_empty() && remove_all_after >= old_last {
            // Heartbeat at or past our tail: nothing to prune or persist.
            return Ok(());
        }
        let pure_append = remove_all_after >= old_last
            && entries.iter().all(|entry| entry.index > old_last);

        let tail = self.log.split_off(&(remove_all_after + 1));
        let mut fresh = Vec::new();
        for entry in entries {
            let keep = match tail.get(&entry.index) {
                Some(existing) if existing.term == entry.term => existing.clone(),
                _ => entry.clone(),
            };
            if pure_append {
                fresh.push(keep.clone());
            }
            self.log.insert(keep.index, keep);
        }

        if pure_append {
            self.append_log_lines(&fresh)
        } else {
            self.rewrite_log()
        }
    }

    fn last_log_entry(&self) -> LogPosition {
        if let Some((_, entry)) = self.log.iter().next_back() {
            return LogPosition {
                index: entry.index,
                term: entry.term,
                topology_change: entry.flags.topology_change,
            };
        }
        match self.meta.snapshot {
            Some(mark) => LogPosition { index: mark.index, term: mark.term, topology_change: false },
            None => LogPosition::default(),
        }
    }

    fn term_for(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if let Some(mark) = self.meta.snapshot {
            if index == mark.index {
                return Some(mark.term);
            }
        }
        self.log.get(&index).map(|entry| entry.term)
    }

    fn entries_between(&self, from: u64, up_to: u64) -> Result<Vec<LogEntry>, StoreError> {
        if up_to <= from {
            return Ok(Vec::new());
        }
        Ok(self.log.range(from + 1..=up_to).map(|(_, e)| e.clone()).collect())
    }

    fn entry_at(&self, index: u64) -> Result<Option<LogEntry>, StoreError> {
        Ok(self.log.get(&index).cloned())
    }

    fn last_topology_change_entry(&self) -> Result<Option<LogEntry>, StoreError> {
        Ok(self
            .log
            .values()
            .rev()
            .find(|entry| entry.flags.topology_change)
            .cloned())
    }

    fn current_topology(&self) -> Option<Topology> {
        self.meta.topology.clone()
    }

    fn set_current_topology(&mut self, topology: &Topology) -> Result<(), StoreError> {
        self.meta.topology = Some(topology.clone());
        self.write_meta()
    }

    fn last_snapshot(&self) -> Option<SnapshotMark> {
        self.meta.snapshot
    }

    fn mark_snapshot_for(
        &mut self,
        index: u64,
        term: u64,
        max_trailing_to_keep: u64,
    ) -> Result<(), StoreError> {
        self.meta.snapshot = Some(SnapshotMark { index, term });
        // Meta lands first: a crash between the two writes leaves stale
        // entries below the boundary, which reload tolerates.
        self.write_meta()?;
        let cutoff = index.saturating_sub(max_trailing_to_keep);
        self.log = self.log.split_off(&(cutoff + 1));
        self.rewrite_log()
    }

    fn committed_entries_count(&self, up_to: u64) -> u64 {
        self.log.range(..=up_to).count() as u64
    }
}
