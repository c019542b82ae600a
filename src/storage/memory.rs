//! In-memory store implementation for testing
//!
//! Fast, no side effects, nothing survives a restart. Keeps the log in a
//! `BTreeMap` keyed by index so range scans match the durable layout.

use std::collections::BTreeMap;

use crate::core::messages::{EntryFlags, LogEntry, NodeId};
use crate::core::snapshot::SnapshotMark;
use crate::core::topology::Topology;

use super::{LogPosition, PersistentStore, StoreError};

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    term: u64,
    voted_for: Option<NodeId>,
    log: BTreeMap<u64, LogEntry>,
    topology: Option<Topology>,
    snapshot: Option<SnapshotMark>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Number of entries currently held, snapshot-compacted ones excluded.
    pub fn log_len(&self) -> usize {
        self.log.len()
    }
}

impl PersistentStore for MemoryStore {
    fn current_term(&self) -> u64 {
        self.term
    }

    fn voted_for(&self) -> Option<NodeId> {
        self.voted_for.clone()
    }

    fn increment_term_and_vote_for(&mut self, id: &str) -> Result<u64, StoreError> {
        self.term += 1;
        self.voted_for = Some(id.to_string());
        Ok(self.term)
    }

    fn update_term_to(&mut self, term: u64) -> Result<(), StoreError> {
        self.term = term;
        self.voted_for = None;
        Ok(())
    }

    fn record_vote_for(&mut self, id: &str) -> Result<(), StoreError> {
        self.voted_for = Some(id.to_string());
        Ok(())
    }

    fn append_to_leader_log(
        &mut self,
        term: u64,
        data: Vec<u8>,
        flags: EntryFlags,
    ) -> Result<u64, StoreError> {
        let index = self.last_log_entry().index + 1;
        self.log.insert(index, LogEntry { index, term, data, flags });
        Ok(index)
    }

    fn append_to_log(
        &mut self,
        entries: &[LogEntry],
        remove_all_after: u64,
    ) -> Result<(), StoreError> {
        let tail = self.log.split_off(&(remove_all_after + 1));
        for entry in entries {
            let keep = match tail.get(&entry.index) {
                // Same index and term: keep what we already persisted.
                Some(existing) if existing.term == entry.term => existing.clone(),
                _ => entry.clone(),
            };
            self.log.insert(keep.index, keep);
        }
        Ok(())
    }

    fn last_log_entry(&self) -> LogPosition {
        if let Some((_, entry)) = self.log.iter().next_back() {
            return LogPosition {
                index: entry.index,
                term: entry.term,
                topology_change: entry.flags.topology_change,
            };
        }
        match self.snapshot {
            Some(mark) => LogPosition { index: mark.index, term: mark.term, topology_change: false },
            None => LogPosition::default(),
        }
    }

    fn term_for(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if let Some(mark) = self.snapshot {
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
        self.topology.clone()
    }

    fn set_current_topology(&mut self, topology: &Topology) -> Result<(), StoreError> {
        self.topology = Some(topology.clone());
        Ok(())
    }

    fn last_snapshot(&self) -> Option<SnapshotMark> {
        self.snapshot
    }

    fn mark_snapshot_for(
        &mut self,
        index: u64,
        term: u64,
        max_trailing_to_keep: u64,
    ) -> Result<(), StoreError> {
        self.snapshot = Some(SnapshotMark { index, term });
        let cutoff = index.saturating_sub(max_trailing_to_keep);
        self.log = self.log.split_off(&(cutoff + 1));
        Ok(())
    }

    fn committed_entries_count(&self, up_to: u64) -> u64 {
        self.log.range(..=up_to).count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            data: format!("cmd-{index}").into_bytes(),
            flags: EntryFlags::default(),
        }
    }

    #[test]
    fn test_term_and_vote_round_trip() {
        let mut store = MemoryStore::new();
        assert_eq!(store.current_term(), 0);
        assert_eq!(store.voted_for(), None);

        let term = store.increment_term_and_vote_for("n1").unwrap();
        assert_eq!(term, 1);
        assert_eq!(store.voted_for(), Some("n1".to_string()));

        store.update_term_to(5).unwrap();
        assert_eq!(store.current_term(), 5);
        assert_eq!(store.voted_for(), None);

        store.record_vote_for("n2").unwrap();
        assert_eq!(store.voted_for(), Some("n2".to_string()));
    }

    #[test]
    fn test_leader_append_assigns_dense_indexes() {
        let mut store = MemoryStore::new();
        assert_eq!(store.append_to_leader_log(1, vec![1], EntryFlags::default()).unwrap(), 1);
        assert_eq!(store.append_to_leader_log(1, vec![2], EntryFlags::default()).unwrap(), 2);
        assert_eq!(store.append_to_leader_log(2, vec![3], EntryFlags::default()).unwrap(), 3);
        assert_eq!(store.last_log_entry().index, 3);
        assert_eq!(store.last_log_entry().term, 2);
    }

    #[test]
    fn test_append_to_log_is_idempotent_on_matching_terms() {
        let mut store = MemoryStore::new();
        let batch = vec![entry(1, 1), entry(2, 1)];
        store.append_to_log(&batch, 0).unwrap();
        store.append_to_log(&batch, 0).unwrap();
        assert_eq!(store.log_len(), 2);
        assert_eq!(store.term_for(2), Some(1));
    }

    #[test]
    fn test_append_to_log_truncates_conflicting_suffix() {
        let mut store = MemoryStore::new();
        store.append_to_log(&[entry(1, 1), entry(2, 1), entry(3, 1)], 0).unwrap();

        // New leader overwrites index 2 with a term-2 entry.
        store.append_to_log(&[entry(2, 2)], 1).unwrap();

        assert_eq!(store.log_len(), 2);
        assert_eq!(store.term_for(2), Some(2));
        assert_eq!(store.term_for(3), None);
    }

    #[test]
    fn test_append_to_log_removes_entries_above_remove_all_after() {
        let mut store = MemoryStore::new();
        store.append_to_log(&[entry(1, 1), entry(2, 1), entry(3, 1)], 0).unwrap();

        // Batch covering only index 2: index 3 is not in the batch and goes.
        store.append_to_log(&[entry(2, 1)], 1).unwrap();
        assert_eq!(store.last_log_entry().index, 2);
    }

    #[test]
    fn test_last_log_entry_falls_back_to_snapshot() {
        let mut store = MemoryStore::new();
        assert_eq!(store.last_log_entry(), LogPosition::default());

        store.append_to_log(&[entry(1, 1), entry(2, 1)], 0).unwrap();
        store.mark_snapshot_for(2, 1, 0).unwrap();

        assert_eq!(store.log_len(), 0);
        let last = store.last_log_entry();
        assert_eq!(last.index, 2);
        assert_eq!(last.term, 1);
    }

    #[test]
    fn test_term_for_snapshot_boundary_and_gaps() {
        let mut store = MemoryStore::new();
        store.append_to_log(&[entry(1, 1), entry(2, 1), entry(3, 2)], 0).unwrap();
        store.mark_snapshot_for(2, 1, 0).unwrap();

        assert_eq!(store.term_for(0), Some(0));
        assert_eq!(store.term_for(1), None); // compacted away
        assert_eq!(store.term_for(2), Some(1)); // snapshot boundary
        assert_eq!(store.term_for(3), Some(2));
        assert_eq!(store.term_for(4), None); // beyond the log
    }

    #[test]
    fn test_mark_snapshot_keeps_trailing_buffer() {
        let mut store = MemoryStore::new();
        let batch: Vec<LogEntry> = (1..=10).map(|i| entry(i, 1)).collect();
        store.append_to_log(&batch, 0).unwrap();

        store.mark_snapshot_for(8, 1, 3).unwrap();

        // Entries <= 8 - 3 = 5 are gone, 6..=10 remain.
        assert_eq!(store.term_for(5), None);
        assert_eq!(store.term_for(6), Some(1));
        assert_eq!(store.committed_entries_count(10), 5);
    }

    #[test]
    fn test_entries_between_bounds() {
        let mut store = MemoryStore::new();
        let batch: Vec<LogEntry> = (1..=5).map(|i| entry(i, 1)).collect();
        store.append_to_log(&batch, 0).unwrap();

        let slice = store.entries_between(1, 3).unwrap();
        assert_eq!(slice.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3]);
        assert!(store.entries_between(3, 3).unwrap().is_empty());
        assert!(store.entries_between(5, 2).unwrap().is_empty());
    }

    #[test]
    fn test_last_topology_change_entry_scans_backward() {
        let mut store = MemoryStore::new();
        let change = EntryFlags { topology_change: true, noop: false };
        store.append_to_leader_log(1, vec![], change).unwrap();
        store.append_to_leader_log(1, vec![], EntryFlags::default()).unwrap();
        store.append_to_leader_log(1, b"newer".to_vec(), change).unwrap();
        store.append_to_leader_log(1, vec![], EntryFlags::default()).unwrap();

        let found = store.last_topology_change_entry().unwrap().unwrap();
        assert_eq!(found.index, 3);
        assert_eq!(found.data, b"newer".to_vec());
    }

    #[test]
    fn test_topology_round_trip() {
        let mut store = MemoryStore::new();
        assert!(store.current_topology().is_none());

        let topology = Topology::new(["n1".to_string(), "n2".to_string()]);
        store.set_current_topology(&topology).unwrap();
        assert_eq!(store.current_topology(), Some(topology));
    }
}
