//! State machine abstraction.
//!
//! The state machine is the application logic the engine coordinates.
//! Implementations must be deterministic: applying the same commands in the
//! same order must produce the same state on every node. `apply` must be
//! idempotent against re-application of the same `(index, term)`.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::core::messages::LogEntry;
use crate::core::snapshot::SnapshotBlob;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateMachineError {
    /// The command payload could not be decoded. Fatal to the engine:
    /// skipping a committed command would fork the replicated state.
    #[error("command deserialization failed: {0}")]
    Serialization(String),
    /// The command was understood but cannot be applied.
    #[error("command rejected: {0}")]
    Rejected(String),
    /// Snapshot creation, lookup, or installation failed.
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

pub trait StateMachine: Send {
    /// Apply a committed application command.
    fn apply(&mut self, entry: &LogEntry, command: &[u8]) -> Result<(), StateMachineError>;

    /// Whether this machine can create and install snapshots. Compaction is
    /// skipped entirely when false.
    fn supports_snapshots(&self) -> bool {
        false
    }

    /// Persist a snapshot of the state through `up_to_index`.
    fn create_snapshot(&mut self, up_to_index: u64, term: u64) -> Result<(), StateMachineError> {
        let _ = (up_to_index, term);
        Err(StateMachineError::Snapshot("snapshots not supported".into()))
    }

    /// The most recent snapshot, ready to stream to a peer.
    fn latest_snapshot(&self) -> Result<Option<SnapshotBlob>, StateMachineError> {
        Ok(None)
    }

    /// Replace all state with the snapshot contents.
    fn apply_snapshot(
        &mut self,
        term: u64,
        index: u64,
        data: &[u8],
    ) -> Result<(), StateMachineError> {
        let _ = (term, index, data);
        Err(StateMachineError::Snapshot("snapshots not supported".into()))
    }
}

/// The engine and its background snapshot tasks share the machine through
/// a mutex; the engine only takes the lock for short, bounded calls.
pub type SharedStateMachine = Arc<Mutex<dyn StateMachine>>;

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Records applied entries for assertions.
    pub(crate) struct RecordingStateMachine {
        pub applied: Vec<(u64, Vec<u8>)>,
        pub snapshot: Option<SnapshotBlob>,
        pub with_snapshots: bool,
    }

    impl RecordingStateMachine {
        pub(crate) fn new() -> Self {
            RecordingStateMachine { applied: Vec::new(), snapshot: None, with_snapshots: false }
        }

        pub(crate) fn with_snapshots() -> Self {
            RecordingStateMachine { with_snapshots: true, ..Self::new() }
        }
    }

    impl StateMachine for RecordingStateMachine {
        fn apply(&mut self, entry: &LogEntry, command: &[u8]) -> Result<(), StateMachineError> {
            self.applied.push((entry.index, command.to_vec()));
            Ok(())
        }

        fn supports_snapshots(&self) -> bool {
            self.with_snapshots
        }

        fn create_snapshot(&mut self, up_to_index: u64, term: u64) -> Result<(), StateMachineError> {
            let data = serde_json::to_vec(&self.applied)
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
            self.applied = serde_json::from_slice(data)
                .map_err(|e| StateMachineError::Snapshot(e.to_string()))?;
            self.snapshot = Some(SnapshotBlob { index, term, data: data.to_vec() });
            Ok(())
        }
    }
}
