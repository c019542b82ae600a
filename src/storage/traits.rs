//! Persistent store contract.
//!
//! The engine assumes every mutating operation is atomically durable before
//! it returns: a crash immediately after the call must leave the store in
//! the post-operation state. Any error from the store is fatal to the
//! engine; silent corruption must never be masked.

use thiserror::Error;

use crate::core::messages::{EntryFlags, LogEntry, NodeId};
use crate::core::snapshot::SnapshotMark;
use crate::core::topology::Topology;

/// Errors raised by a persistent store. All of them terminate the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("storage i/o error: {0}")]
    Io(String),
    #[error("storage corruption: {0}")]
    Corruption(String),
}

/// Position of the last entry a node knows about, falling back to the
/// snapshot boundary when the log has been fully compacted and to
/// `{0, 0}` on a fresh store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogPosition {
    pub index: u64,
    pub term: u64,
    pub topology_change: bool,
}

/// Durable storage for the log, term/vote bookkeeping, the committed
/// topology, and the snapshot boundary.
pub trait PersistentStore: Send {
    /// Highest term this node has seen. 0 on a fresh store.
    fn current_term(&self) -> u64;

    /// Candidate granted a vote in the current term, if any.
    fn voted_for(&self) -> Option<NodeId>;

    /// Atomically advance the term by one and vote for `id` (election entry
    /// point). Returns the new term.
    fn increment_term_and_vote_for(&mut self, id: &str) -> Result<u64, StoreError>;

    /// Adopt a higher term observed from a peer; clears the recorded vote.
    fn update_term_to(&mut self, term: u64) -> Result<(), StoreError>;

    /// Record a vote granted in the current term.
    fn record_vote_for(&mut self, id: &str) -> Result<(), StoreError>;

    /// Append a leader-created entry at the next dense index with the given
    /// term, payload, and flags. Returns the assigned index.
    fn append_to_leader_log(
        &mut self,
        term: u64,
        data: Vec<u8>,
        flags: EntryFlags,
    ) -> Result<u64, StoreError>;

    /// Apply a replicated batch: an existing entry with a conflicting term
    /// is removed together with everything after it; an existing entry with
    /// a matching term is kept as-is. Entries strictly above
    /// `remove_all_after` that are not part of the batch are removed.
    fn append_to_log(&mut self, entries: &[LogEntry], remove_all_after: u64)
        -> Result<(), StoreError>;

    /// Last log position (see [`LogPosition`] for the fallbacks).
    fn last_log_entry(&self) -> LogPosition;

    /// Term of the entry at `index`. `Some(0)` for index 0, the snapshot
    /// term at the snapshot boundary, `None` for indexes truncated away or
    /// beyond the log.
    fn term_for(&self, index: u64) -> Option<u64>;

    /// Entries with `from < index <= up_to`, in order.
    fn entries_between(&self, from: u64, up_to: u64) -> Result<Vec<LogEntry>, StoreError>;

    /// The entry at `index`, if still present in the log.
    fn entry_at(&self, index: u64) -> Result<Option<LogEntry>, StoreError>;

    /// The most recent topology-change entry still in the log, committed or
    /// not. Used to recover an in-flight membership change after restart.
    fn last_topology_change_entry(&self) -> Result<Option<LogEntry>, StoreError>;

    /// Latest committed topology, if one has been persisted.
    fn current_topology(&self) -> Option<Topology>;

    fn set_current_topology(&mut self, topology: &Topology) -> Result<(), StoreError>;

    /// Boundary of the most recent snapshot, if any.
    fn last_snapshot(&self) -> Option<SnapshotMark>;

    /// Record a snapshot boundary at `(index, term)`, then delete entries
    /// with `i <= index - max_trailing_to_keep`. A trailing value of 0
    /// drops everything through `index` (snapshot install).
    fn mark_snapshot_for(
        &mut self,
        index: u64,
        term: u64,
        max_trailing_to_keep: u64,
    ) -> Result<(), StoreError>;

    /// Number of entries still persisted with index `<= up_to`. Drives the
    /// compaction trigger.
    fn committed_entries_count(&self, up_to: u64) -> u64;
}
