//! Protocol messages exchanged between cluster nodes.
//!
//! Field layouts are normative for every transport implementation; the wire
//! encoding is left to the transport. All messages carry `from`, the sender
//! identity, which receivers use as the reply address.

use serde::{Deserialize, Serialize};

use crate::core::topology::Topology;
use crate::transport::SnapshotSource;

/// Node identity. Must be globally unique within a cluster.
pub type NodeId = String;

/// Flags distinguishing system entries from application commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFlags {
    /// Entry carries a membership change command.
    pub topology_change: bool,
    /// Entry is a leader-generated no-op appended on election.
    pub noop: bool,
}

/// A single replicated log entry. Indexes are 1-based and dense.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    /// Term in which the entry was created by a leader.
    pub term: u64,
    /// Opaque command payload; interpreted by the engine for system entries
    /// and passed through to the state machine otherwise.
    pub data: Vec<u8>,
    pub flags: EntryFlags,
}

/// Vote solicitation broadcast by candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub from: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
    pub from: NodeId,
    /// Optional human-readable refusal reason.
    pub message: Option<String>,
}

/// Log replication and heartbeat. Empty `entries` is a valid heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub leader_commit: u64,
    pub entries: Vec<LogEntry>,
    pub from: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// On success, the index of the last entry the follower now holds; on
    /// failure, the follower's last log index, hinting where to back up to.
    pub last_log_index: u64,
    pub leader_id: Option<NodeId>,
    pub from: NodeId,
    pub message: Option<String>,
}

/// Probe asking whether a lagging follower would accept a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanInstallSnapshotRequest {
    pub term: u64,
    /// Index of the snapshot the leader would send.
    pub index: u64,
    pub leader_id: NodeId,
    pub from: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanInstallSnapshotResponse {
    pub success: bool,
    /// Set when the receiver is already draining another snapshot.
    pub is_currently_installing: bool,
    pub term: u64,
    /// On refusal, the receiver's last applied index so the leader can
    /// resume normal replication past it.
    pub index: u64,
    pub from: NodeId,
}

/// Header of a snapshot transfer; the body arrives as the envelope's
/// byte stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub leader_id: NodeId,
    /// Voting topology as of the snapshot, installed on the receiver.
    pub topology: Topology,
    pub from: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub last_log_index: u64,
    pub success: bool,
    pub from: NodeId,
}

/// Step-down accelerator: tells the most up-to-date follower to start an
/// election immediately instead of waiting out its timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutNow {
    pub term: u64,
    pub from: NodeId,
}

/// Every message a node can receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntries),
    AppendEntriesResponse(AppendEntriesResponse),
    CanInstallSnapshot(CanInstallSnapshotRequest),
    CanInstallSnapshotResponse(CanInstallSnapshotResponse),
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
    TimeoutNow(TimeoutNow),
}

impl Message {
    /// Sender identity.
    pub fn from(&self) -> &NodeId {
        match self {
            Message::RequestVote(m) => &m.from,
            Message::RequestVoteResponse(m) => &m.from,
            Message::AppendEntries(m) => &m.from,
            Message::AppendEntriesResponse(m) => &m.from,
            Message::CanInstallSnapshot(m) => &m.from,
            Message::CanInstallSnapshotResponse(m) => &m.from,
            Message::InstallSnapshot(m) => &m.from,
            Message::InstallSnapshotResponse(m) => &m.from,
            Message::TimeoutNow(m) => &m.from,
        }
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestVote(_) => "RequestVote",
            Message::RequestVoteResponse(_) => "RequestVoteResponse",
            Message::AppendEntries(_) => "AppendEntries",
            Message::AppendEntriesResponse(_) => "AppendEntriesResponse",
            Message::CanInstallSnapshot(_) => "CanInstallSnapshot",
            Message::CanInstallSnapshotResponse(_) => "CanInstallSnapshotResponse",
            Message::InstallSnapshot(_) => "InstallSnapshot",
            Message::InstallSnapshotResponse(_) => "InstallSnapshotResponse",
            Message::TimeoutNow(_) => "TimeoutNow",
        }
    }
}

/// A received message plus, for snapshot transfers, the readable body.
pub struct Envelope {
    pub message: Message,
    pub snapshot: Option<SnapshotSource>,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Envelope { message, snapshot: None }
    }

    pub fn with_snapshot(message: Message, source: SnapshotSource) -> Self {
        Envelope { message, snapshot: Some(source) }
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("message", &self.message)
            .field("snapshot", &self.snapshot.is_some())
            .finish()
    }
}
