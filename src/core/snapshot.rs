//! Snapshot boundary types for log compaction.

use serde::{Deserialize, Serialize};

/// Persisted boundary of the most recent snapshot: the last log index it
/// covers and the term of the entry at that index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMark {
    pub index: u64,
    pub term: u64,
}

/// A materialized snapshot ready to be streamed to a peer.
#[derive(Debug, Clone)]
pub struct SnapshotBlob {
    pub index: u64,
    pub term: u64,
    /// Serialized state machine contents through `index`.
    pub data: Vec<u8>,
}
