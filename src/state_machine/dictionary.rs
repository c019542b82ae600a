//! Dictionary state machine: a string-to-integer map.
//!
//! Commands are JSON-encoded [`DictionaryCommand`] values. Snapshots are the
//! JSON-encoded map plus the applied watermark, kept in memory. Re-applying
//! an entry at or below the watermark is a no-op, which makes `apply`
//! idempotent against duplicate delivery.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::messages::LogEntry;
use crate::core::snapshot::SnapshotBlob;

use super::{SharedStateMachine, StateMachine, StateMachineError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DictionaryCommand {
    Set { key: String, value: i64 },
    Remove { key: String },
}

impl DictionaryCommand {
    pub fn set(key: impl Into<String>, value: i64) -> Self {
        DictionaryCommand::Set { key: key.into(), value }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Infallible for this enum shape.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Snapshot payload: the whole map plus the watermark it covers.
#[derive(Debug, Serialize, Deserialize)]
struct DictionarySnapshot {
    data: BTreeMap<String, i64>,
    applied_index: u64,
}

#[derive(Debug, Default)]
pub struct DictionaryStateMachine {
    data: BTreeMap<String, i64>,
    applied_index: u64,
    snapshot: Option<SnapshotBlob>,
}

impl DictionaryStateMachine {
    pub fn new() -> Self {
        DictionaryStateMachine::default()
    }

    /// Build a machine already wrapped for handing to the engine, returning
    /// the concrete handle for direct reads in tests and host code.
    pub fn shared() -> (Arc<Mutex<DictionaryStateMachine>>, SharedStateMachine) {
        let machine = Arc::new(Mutex::new(DictionaryStateMachine::new()));
        let shared: SharedStateMachine = machine.clone();
        (machine, shared)
    }

    /// Read a value directly; reads bypass the replicated log.
    pub fn get(&self, key: &str) -> Option<i64> {
        self.data.get(key).copied()
    }

    pub fn data(&self) -> &BTreeMap<String, i64> {
        &self.data
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }
}

impl StateMachine for DictionaryStateMachine {
    fn apply(&mut self, entry: &LogEntry, command: &[u8]) -> Result<(), StateMachineError> {
        if entry.index <= self.applied_index {
            return Ok(());
        }
        let command: DictionaryCommand = serde_json::from_slice(command)
            .map_err(|e| StateMachineError::Serialization(e.to_string()))?;
        match command {
            DictionaryCommand::Set { key, value } => {
                self.data.insert(key, value);
            }
            DictionaryCommand::Remove { key } => {
                self.data.remove(&key);
            }
        }
        self.applied_index = entry.index;
        Ok(())
    }

    fn supports_snapshots(&self) -> bool {
        true
    }

    fn create_snapshot(&mut self, up_to_index: u64, term: u64) -> Result<(), StateMachineError> {
        let payload = DictionarySnapshot { data: self.data.clone(), applied_index: up_to_index };
        let data = serde_json::to_vec(&payload)
            .map_err(|e| StateMachineError::Snapshot(e.to_string()))?;
        self.snapshot = Some(SnapshotBlob { index: up_to_index, term, data });
        Ok(())
    }

    fn latest_snapshot(&self) -> Result<Option<SnapshotBlob>, StateMachineError> {
        Ok(self.snapshot.clone())
    }

    fn apply_snapshot(
        &mut self,
        term: u64,
        index: u64,
        data: &[u8],
    ) -> Result<(), StateMachineError> {
        let payload: DictionarySnapshot = serde_json::from_slice(data)
            .map_err(|e| StateMachineError::Snapshot(e.to_string()))?;
        self.data = payload.data;
        self.applied_index = index;
        self.snapshot = Some(SnapshotBlob { index, term, data: data.to_vec() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::messages::EntryFlags;

    fn entry(index: u64) -> LogEntry {
        LogEntry { index, term: 1, data: Vec::new(), flags: EntryFlags::default() }
    }

    #[test]
    fn test_set_and_get() {
        let mut dict = DictionaryStateMachine::new();
        let cmd = DictionaryCommand::set("a", 1).encode();
        dict.apply(&entry(1), &cmd).unwrap();
        assert_eq!(dict.get("a"), Some(1));
        assert_eq!(dict.get("missing"), None);
    }

    #[test]
    fn test_set_overwrites() {
        let mut dict = DictionaryStateMachine::new();
        dict.apply(&entry(1), &DictionaryCommand::set("k", 1).encode()).unwrap();
        dict.apply(&entry(2), &DictionaryCommand::set("k", 2).encode()).unwrap();
        assert_eq!(dict.get("k"), Some(2));
    }

    #[test]
    fn test_remove() {
        let mut dict = DictionaryStateMachine::new();
        dict.apply(&entry(1), &DictionaryCommand::set("k", 1).encode()).unwrap();
        dict.apply(&entry(2), &DictionaryCommand::Remove { key: "k".into() }.encode()).unwrap();
        assert_eq!(dict.get("k"), None);
    }

    #[test]
    fn test_reapplying_same_index_is_idempotent() {
        let mut dict = DictionaryStateMachine::new();
        dict.apply(&entry(1), &DictionaryCommand::set("k", 1).encode()).unwrap();
        // Duplicate delivery of index 1 with a different payload is ignored.
        dict.apply(&entry(1), &DictionaryCommand::set("k", 99).encode()).unwrap();
        assert_eq!(dict.get("k"), Some(1));
        assert_eq!(dict.applied_index(), 1);
    }

    #[test]
    fn test_invalid_command_is_a_serialization_error() {
        let mut dict = DictionaryStateMachine::new();
        let result = dict.apply(&entry(1), b"not json");
        assert!(matches!(result, Err(StateMachineError::Serialization(_))));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut source = DictionaryStateMachine::new();
        source.apply(&entry(1), &DictionaryCommand::set("a", 1).encode()).unwrap();
        source.apply(&entry(2), &DictionaryCommand::set("b", 2).encode()).unwrap();
        source.create_snapshot(2, 1).unwrap();

        let blob = source.latest_snapshot().unwrap().unwrap();
        assert_eq!(blob.index, 2);

        let mut target = DictionaryStateMachine::new();
        target.apply(&entry(1), &DictionaryCommand::set("stale", 9).encode()).unwrap();
        target.apply_snapshot(blob.term, blob.index, &blob.data).unwrap();

        assert_eq!(target.get("a"), Some(1));
        assert_eq!(target.get("b"), Some(2));
        assert_eq!(target.get("stale"), None);
        assert_eq!(target.applied_index(), 2);
    }

    #[test]
    fn test_snapshot_restore_rejects_garbage() {
        let mut dict = DictionaryStateMachine::new();
        let result = dict.apply_snapshot(1, 5, b"garbage");
        assert!(matches!(result, Err(StateMachineError::Snapshot(_))));
    }
}
