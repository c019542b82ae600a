//! Per-role volatile state.
//!
//! The active role is a tagged variant; each variant owns the state that
//! dies with it (a candidate's vote tally, a leader's replication indexes).
//! The protocol handlers live on the engine and match on the variant, with
//! the common RequestVote/AppendEntries rules shared across roles.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::core::messages::NodeId;
use crate::core::server::RaftError;

/// Role discriminant, visible to observers and status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Follower,
    Candidate,
    Leader,
    InstallingSnapshot,
    SteppingDown,
    /// Terminal state entered when the node is removed from the topology
    /// or hits a fatal storage error.
    Stopped,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoleKind::Follower => "Follower",
            RoleKind::Candidate => "Candidate",
            RoleKind::Leader => "Leader",
            RoleKind::InstallingSnapshot => "InstallingSnapshot",
            RoleKind::SteppingDown => "SteppingDown",
            RoleKind::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

/// A client append waiting for its entry to commit. Resolved in FIFO order
/// as the commit index passes `index`.
pub(crate) struct PendingCommit {
    pub index: u64,
    pub done: oneshot::Sender<Result<u64, RaftError>>,
}

pub(crate) struct FollowerState {
    /// Election timeout drawn on entry and re-drawn on every heartbeat.
    pub timeout: Duration,
}

pub(crate) struct CandidateState {
    /// Voters that granted us their vote this term, self included.
    pub votes: HashSet<NodeId>,
    pub timeout: Duration,
}

pub(crate) struct LeaderState {
    /// Next log index to ship to each peer.
    pub next_index: HashMap<NodeId, u64>,
    /// Highest index known replicated on each peer.
    pub match_index: HashMap<NodeId, u64>,
    /// Client appends awaiting commit, FIFO by index.
    pub pending: VecDeque<PendingCommit>,
    /// Peers with a snapshot stream currently in flight; normal replication
    /// to them is suppressed until the stream finishes.
    pub snapshots_in_flight: HashSet<NodeId>,
    /// Index of the last client command accepted during this leadership,
    /// used as the drain target when stepping down.
    pub last_client_index: u64,
}

impl LeaderState {
    pub(crate) fn new(peers: impl IntoIterator<Item = NodeId>, last_log_index: u64) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for peer in peers {
            next_index.insert(peer.clone(), last_log_index + 1);
            match_index.insert(peer, 0);
        }
        LeaderState {
            next_index,
            match_index,
            pending: VecDeque::new(),
            snapshots_in_flight: HashSet::new(),
            last_client_index: 0,
        }
    }

    /// Register a peer that joined the replication set mid-leadership.
    pub(crate) fn track_peer(&mut self, peer: &str, last_log_index: u64) {
        self.next_index.entry(peer.to_string()).or_insert(last_log_index + 1);
        self.match_index.entry(peer.to_string()).or_insert(0);
    }
}

pub(crate) struct InstallingState {
    /// Last included index of the snapshot being drained.
    pub index: u64,
    pub timeout: Duration,
}

pub(crate) struct SteppingDownState {
    /// Replication continues exactly as under leadership while draining.
    pub leader: LeaderState,
    /// Step-down completes once the commit index reaches this.
    pub drain_to: u64,
    pub done: Option<oneshot::Sender<Result<(), RaftError>>>,
}

pub(crate) enum Role {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
    InstallingSnapshot(InstallingState),
    SteppingDown(SteppingDownState),
    Stopped,
}

impl Role {
    pub(crate) fn kind(&self) -> RoleKind {
        match self {
            Role::Follower(_) => RoleKind::Follower,
            Role::Candidate(_) => RoleKind::Candidate,
            Role::Leader(_) => RoleKind::Leader,
            Role::InstallingSnapshot(_) => RoleKind::InstallingSnapshot,
            Role::SteppingDown(_) => RoleKind::SteppingDown,
            Role::Stopped => RoleKind::Stopped,
        }
    }

    /// Replication state shared by the Leader and SteppingDown roles.
    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderState> {
        match self {
            Role::Leader(state) => Some(state),
            Role::SteppingDown(state) => Some(&mut state.leader),
            _ => None,
        }
    }

    pub(crate) fn leader_state(&self) -> Option<&LeaderState> {
        match self {
            Role::Leader(state) => Some(state),
            Role::SteppingDown(state) => Some(&state.leader),
            _ => None,
        }
    }
}
