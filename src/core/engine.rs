//! The consensus protocol state machine.
//!
//! [`Engine`] holds everything a node knows: the persistent store, the
//! cached term and vote, the committed and in-flight topologies, the commit
//! and apply watermarks, and the active role. It is synchronous and
//! single-threaded; all mutation happens on the event-loop task that owns
//! it. Handlers record outbound messages and background-task requests as
//! [`Effect`]s, which the driver drains after every call. Background tasks
//! re-enter through driver callbacks, never by touching the engine
//! directly.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::config::EngineConfig;
use crate::core::events::{Event, Observers};
use crate::core::messages::{
    AppendEntries, AppendEntriesResponse, CanInstallSnapshotRequest, CanInstallSnapshotResponse,
    EntryFlags, Envelope, InstallSnapshotRequest, InstallSnapshotResponse, LogEntry, Message,
    NodeId, RequestVote, RequestVoteResponse, TimeoutNow,
};
use crate::core::roles::{
    CandidateState, FollowerState, InstallingState, LeaderState, PendingCommit, Role, RoleKind,
    SteppingDownState,
};
use crate::core::server::{RaftError, Status};
use crate::core::topology::Topology;
use crate::state_machine::{SharedStateMachine, StateMachineError};
use crate::storage::PersistentStore;
use crate::transport::SnapshotSource;

/// Commands the engine itself writes into the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum EngineCommand {
    /// Appended by a new leader to anchor its term in the log.
    Noop,
    /// Replaces the voting set once committed.
    ChangeTopology { members: BTreeSet<NodeId> },
}

impl EngineCommand {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, RaftError> {
        serde_json::to_vec(self).map_err(|e| RaftError::Serialization(e.to_string()))
    }

    pub(crate) fn decode(data: &[u8]) -> Result<EngineCommand, RaftError> {
        serde_json::from_slice(data).map_err(|e| RaftError::Serialization(e.to_string()))
    }
}

/// Side effects recorded by handlers and executed by the driver.
pub(crate) enum Effect {
    /// Fire-and-forget message send.
    Send { to: NodeId, message: Message },
    /// Ask the state machine for a snapshot through `up_to` on a background
    /// task, then report back via `Engine::finish_snapshot_creation`.
    CreateSnapshot { up_to: u64, term: u64 },
    /// Stream the latest snapshot to a lagging peer on a background task,
    /// then report back via `Engine::snapshot_send_finished`.
    SendSnapshot { to: NodeId, term: u64, leader_id: NodeId, topology: Topology },
    /// Drain an inbound snapshot body on a background task, then report
    /// back via `Engine::finish_snapshot_install`.
    InstallSnapshot { request: InstallSnapshotRequest, source: Option<SnapshotSource> },
    /// Terminate the event loop.
    Halt,
}

pub(crate) struct Engine {
    pub(crate) id: NodeId,
    pub(crate) config: EngineConfig,
    pub(crate) store: Box<dyn PersistentStore>,
    pub(crate) state_machine: SharedStateMachine,
    pub(crate) role: Role,
    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<NodeId>,
    /// Latest committed voting set.
    pub(crate) topology: Topology,
    /// Requested voting set while a membership change is in flight. Joint
    /// consensus: elections and commits need quorum here too.
    pub(crate) changing_topology: Option<Topology>,
    pub(crate) commit_index: u64,
    pub(crate) last_applied: u64,
    pub(crate) current_leader: Option<NodeId>,
    /// Reset on leader contact (followers) or on heartbeat broadcast
    /// (leaders); the loop computes the next timeout against it.
    pub(crate) last_heartbeat: Instant,
    pub(crate) observers: Observers,
    pub(crate) effects: Vec<Effect>,
    /// At most one snapshot creation task at a time.
    snapshot_running: bool,
}

impl Engine {
    pub(crate) fn new(
        config: EngineConfig,
        mut store: Box<dyn PersistentStore>,
        state_machine: SharedStateMachine,
    ) -> Result<Self, RaftError> {
        let current_term = store.current_term();
        let voted_for = store.voted_for();
        let snapshot_index = store.last_snapshot().map(|mark| mark.index).unwrap_or(0);

        let topology = match store.current_topology() {
            Some(persisted) if !config.force_new_topology => persisted,
            _ => {
                let bootstrap = Topology::new(config.all_voting_nodes.iter().cloned());
                store.set_current_topology(&bootstrap)?;
                bootstrap
            }
        };

        // A topology-change entry above the committed topology means the
        // change was still in flight when we went down; re-arm it so joint
        // quorum rules keep applying.
        let changing_topology = match store.last_topology_change_entry()? {
            Some(entry) => {
                let requested = decode_topology(&entry.data)?;
                (requested != topology).then_some(requested)
            }
            None => None,
        };

        let timeout = config.follower_timeout();
        Ok(Engine {
            id: config.name.clone(),
            config,
            store,
            state_machine,
            role: Role::Follower(FollowerState { timeout }),
            current_term,
            voted_for,
            topology,
            changing_topology,
            commit_index: snapshot_index,
            last_applied: snapshot_index,
            current_leader: None,
            last_heartbeat: Instant::now(),
            observers: Observers::new(),
            effects: Vec::new(),
            snapshot_running: false,
        })
    }

    pub(crate) fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub(crate) fn role_timeout(&self) -> Duration {
        match &self.role {
            Role::Follower(state) => state.timeout,
            Role::Candidate(state) => state.timeout,
            Role::Leader(_) | Role::SteppingDown(_) => self.config.effective_heartbeat(),
            Role::InstallingSnapshot(state) => state.timeout,
            Role::Stopped => Duration::from_secs(3600),
        }
    }

    pub(crate) fn status(&self) -> Status {
        Status {
            id: self.id.clone(),
            role: self.role.kind(),
            term: self.current_term,
            leader: self.current_leader.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.store.last_log_entry().index,
            topology: self.topology.clone(),
        }
    }

    fn emit(&self, event: Event) {
        self.observers.emit(&event);
    }

    fn touch(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    fn send_to(&mut self, to: &str, message: Message) {
        self.effects.push(Effect::Send { to: to.to_string(), message });
    }

    /// Everyone in the committed and in-flight voting sets except us.
    fn peers(&self) -> BTreeSet<NodeId> {
        let mut peers: BTreeSet<NodeId> = self.topology.members().cloned().collect();
        if let Some(changing) = &self.changing_topology {
            peers.extend(changing.members().cloned());
        }
        peers.remove(&self.id);
        peers
    }

    fn is_voter(&self, id: &str) -> bool {
        self.topology.contains(id)
            || self.changing_topology.as_ref().is_some_and(|t| t.contains(id))
    }

    /// Quorum in the committed topology and, while a change is in flight,
    /// in the requested topology as well.
    fn joint_quorum(&self, acks: &HashSet<NodeId>) -> bool {
        self.topology.has_quorum(acks)
            && self.changing_topology.as_ref().map_or(true, |t| t.has_quorum(acks))
    }

    fn adopt_term(&mut self, term: u64) -> Result<(), RaftError> {
        if term > self.current_term {
            self.store.update_term_to(term)?;
            self.current_term = term;
            self.voted_for = None;
            self.emit(Event::NewTerm(term));
        }
        Ok(())
    }

    // === Role transitions ===

    /// Swap the active role, running the outgoing role's exit duties.
    fn transition(&mut self, role: Role) {
        let old = std::mem::replace(&mut self.role, role);
        match old {
            Role::Leader(state) => self.on_leadership_lost(state.pending),
            Role::SteppingDown(mut state) => {
                // Losing leadership completes the step-down either way.
                if let Some(done) = state.done.take() {
                    let _ = done.send(Ok(()));
                }
                self.on_leadership_lost(state.leader.pending);
            }
            _ => {}
        }
        self.emit(Event::StateChanged(self.role.kind()));
    }

    fn on_leadership_lost(&mut self, pending: std::collections::VecDeque<PendingCommit>) {
        for commit in pending {
            let _ = commit.done.send(Err(RaftError::NotLeader {
                leader_hint: self.current_leader.clone(),
            }));
        }
        // A proposal that never committed rolls back to the committed set.
        if self.changing_topology.take().is_some() {
            self.emit(Event::TopologyChanged(self.topology.clone()));
        }
    }

    fn become_follower(&mut self) {
        let timeout = self.config.follower_timeout();
        if let Role::Follower(state) = &mut self.role {
            state.timeout = timeout;
        } else {
            debug!(id = %self.id, term = self.current_term, "becoming follower");
            self.transition(Role::Follower(FollowerState { timeout }));
        }
        self.touch();
    }

    pub(crate) fn start_election(&mut self) -> Result<(), RaftError> {
        if !self.is_voter(&self.id) {
            // Non-voters wait to be caught up; they never campaign.
            if let Role::Follower(state) = &mut self.role {
                state.timeout = self.config.follower_timeout();
            }
            self.touch();
            return Ok(());
        }

        let term = self.store.increment_term_and_vote_for(&self.id)?;
        self.current_term = term;
        self.voted_for = Some(self.id.clone());
        self.current_leader = None;
        self.emit(Event::NewTerm(term));

        let mut votes = HashSet::new();
        votes.insert(self.id.clone());
        let timeout = self.config.candidate_timeout();
        info!(id = %self.id, term, "starting election");
        self.transition(Role::Candidate(CandidateState { votes: votes.clone(), timeout }));
        self.emit(Event::ElectionStarted);
        self.touch();

        if self.joint_quorum(&votes) {
            // Single-voter cluster: no messages needed.
            return self.become_leader();
        }

        let last = self.store.last_log_entry();
        for peer in self.peers() {
            self.send_to(
                &peer,
                Message::RequestVote(RequestVote {
                    term,
                    candidate_id: self.id.clone(),
                    last_log_index: last.index,
                    last_log_term: last.term,
                    from: self.id.clone(),
                }),
            );
        }
        Ok(())
    }

    fn become_leader(&mut self) -> Result<(), RaftError> {
        let last = self.store.last_log_entry();
        let state = LeaderState::new(self.peers(), last.index);
        info!(id = %self.id, term = self.current_term, "elected leader");
        self.transition(Role::Leader(state));
        self.current_leader = Some(self.id.clone());
        self.emit(Event::ElectedAsLeader);

        // Anchor the new term in the log; committing this entry proves
        // leader completeness for everything before it.
        let noop = EngineCommand::Noop.encode()?;
        let index = self.store.append_to_leader_log(
            self.current_term,
            noop,
            EntryFlags { noop: true, topology_change: false },
        )?;
        self.emit(Event::EntriesAppended { first_index: index, count: 1 });

        self.try_advance_commit()?;
        self.broadcast_replication()
    }

    fn stop(&mut self) {
        info!(id = %self.id, "engine stopping");
        self.transition(Role::Stopped);
        self.effects.push(Effect::Halt);
    }

    // === Timeout handling ===

    pub(crate) fn handle_timeout(&mut self) -> Result<(), RaftError> {
        self.emit(Event::StateTimeout);
        match self.role.kind() {
            RoleKind::Follower | RoleKind::Candidate => self.start_election(),
            RoleKind::Leader | RoleKind::SteppingDown => self.heartbeat_tick(),
            RoleKind::InstallingSnapshot => {
                // Keep draining; do not campaign against the snapshot sender.
                let timeout = self.config.follower_timeout();
                if let Role::InstallingSnapshot(state) = &mut self.role {
                    state.timeout = timeout;
                }
                self.touch();
                Ok(())
            }
            RoleKind::Stopped => Ok(()),
        }
    }

    fn heartbeat_tick(&mut self) -> Result<(), RaftError> {
        self.broadcast_replication()?;
        self.check_step_down_complete()
    }

    fn broadcast_replication(&mut self) -> Result<(), RaftError> {
        for peer in self.peers() {
            self.replicate_to(&peer)?;
        }
        self.touch();
        Ok(())
    }

    fn replicate_to(&mut self, peer: &str) -> Result<(), RaftError> {
        let last_index = self.store.last_log_entry().index;
        let snapshot = self.store.last_snapshot();

        let (next, in_flight) = match self.role.leader_state() {
            Some(state) => (
                state.next_index.get(peer).copied().unwrap_or(last_index + 1),
                state.snapshots_in_flight.contains(peer),
            ),
            None => return Ok(()),
        };
        if in_flight {
            return Ok(());
        }

        // A peer whose next entry was compacted away can only catch up via
        // snapshot; ask before committing to the stream.
        let needs_snapshot = snapshot.is_some_and(|mark| mark.index >= next);
        let prev = next.saturating_sub(1);
        let prev_term = if needs_snapshot { None } else { self.store.term_for(prev) };
        let (snapshot_index, prev_term) = match (needs_snapshot, prev_term) {
            (false, Some(term)) => (None, term),
            _ => (Some(snapshot.map(|mark| mark.index).unwrap_or(0)), 0),
        };

        if let Some(index) = snapshot_index {
            self.send_to(
                peer,
                Message::CanInstallSnapshot(CanInstallSnapshotRequest {
                    term: self.current_term,
                    index,
                    leader_id: self.id.clone(),
                    from: self.id.clone(),
                }),
            );
            return Ok(());
        }

        let up_to = last_index.min(prev + self.config.max_entries_per_request);
        let entries = self.store.entries_between(prev, up_to)?;
        self.send_to(
            peer,
            Message::AppendEntries(AppendEntries {
                term: self.current_term,
                leader_id: self.id.clone(),
                prev_log_index: prev,
                prev_log_term: prev_term,
                leader_commit: self.commit_index,
                entries,
                from: self.id.clone(),
            }),
        );
        Ok(())
    }

    // === Message dispatch ===

    pub(crate) fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), RaftError> {
        if matches!(self.role, Role::Stopped) {
            return Ok(());
        }
        let Envelope { message, snapshot } = envelope;
        debug!(id = %self.id, kind = message.kind(), from = %message.from(), "handling message");
        match message {
            Message::RequestVote(req) => self.on_request_vote(req),
            Message::RequestVoteResponse(resp) => self.on_request_vote_response(resp),
            Message::AppendEntries(req) => self.on_append_entries(req),
            Message::AppendEntriesResponse(resp) => self.on_append_entries_response(resp),
            Message::CanInstallSnapshot(req) => self.on_can_install_snapshot(req),
            Message::CanInstallSnapshotResponse(resp) => {
                self.on_can_install_snapshot_response(resp)
            }
            Message::InstallSnapshot(req) => self.on_install_snapshot(req, snapshot),
            Message::InstallSnapshotResponse(resp) => self.on_install_snapshot_response(resp),
            Message::TimeoutNow(msg) => self.on_timeout_now(msg),
        }
    }

    fn on_request_vote(&mut self, req: RequestVote) -> Result<(), RaftError> {
        if req.term < self.current_term {
            let reply = RequestVoteResponse {
                term: self.current_term,
                vote_granted: false,
                from: self.id.clone(),
                message: Some("stale term".into()),
            };
            self.send_to(&req.from, Message::RequestVoteResponse(reply));
            return Ok(());
        }

        if req.term > self.current_term {
            self.adopt_term(req.term)?;
            match self.role.kind() {
                // An in-flight install keeps draining; everyone else who
                // competes for leadership steps back.
                RoleKind::Follower | RoleKind::InstallingSnapshot | RoleKind::Stopped => {}
                _ => self.become_follower(),
            }
        }

        let last = self.store.last_log_entry();
        let up_to_date = req.last_log_term > last.term
            || (req.last_log_term == last.term && req.last_log_index >= last.index);
        let unspent = self.voted_for.is_none()
            || self.voted_for.as_deref() == Some(req.candidate_id.as_str());

        let (granted, reason) = if !unspent {
            (false, Some("already voted this term".to_string()))
        } else if !up_to_date {
            (false, Some("candidate log is behind".to_string()))
        } else {
            (true, None)
        };

        if granted {
            // Durable before the reply leaves the node.
            self.store.record_vote_for(&req.candidate_id)?;
            self.voted_for = Some(req.candidate_id.clone());
            if let Role::Follower(state) = &mut self.role {
                state.timeout = self.config.follower_timeout();
            }
            self.touch();
        }

        let reply = RequestVoteResponse {
            term: self.current_term,
            vote_granted: granted,
            from: self.id.clone(),
            message: reason,
        };
        self.send_to(&req.from, Message::RequestVoteResponse(reply));
        Ok(())
    }

    fn on_request_vote_response(&mut self, resp: RequestVoteResponse) -> Result<(), RaftError> {
        if resp.term > self.current_term {
            self.adopt_term(resp.term)?;
            self.become_follower();
            return Ok(());
        }

        let quorum = {
            let Role::Candidate(state) = &mut self.role else {
                return Ok(());
            };
            if resp.vote_granted {
                state.votes.insert(resp.from.clone());
            }
            state.votes.clone()
        };
        // Only voting members count, in both topologies when changing.
        let quorum: HashSet<NodeId> =
            quorum.into_iter().filter(|id| self.is_voter(id)).collect();
        if self.joint_quorum(&quorum) {
            self.become_leader()?;
        }
        Ok(())
    }

    fn on_append_entries(&mut self, req: AppendEntries) -> Result<(), RaftError> {
        let our_last = self.store.last_log_entry().index;

        if req.term < self.current_term {
            let reply = AppendEntriesResponse {
                term: self.current_term,
                success: false,
                last_log_index: our_last,
                leader_id: self.current_leader.clone(),
                from: self.id.clone(),
                message: Some("stale term".into()),
            };
            self.send_to(&req.from, Message::AppendEntriesResponse(reply));
            return Ok(());
        }

        if matches!(self.role, Role::InstallingSnapshot(_)) {
            self.adopt_term(req.term)?;
            self.current_leader = Some(req.leader_id.clone());
            self.touch();
            let reply = AppendEntriesResponse {
                term: self.current_term,
                success: false,
                last_log_index: our_last,
                leader_id: Some(req.leader_id),
                from: self.id.clone(),
                message: Some("installing snapshot".into()),
            };
            self.send_to(&req.from, Message::AppendEntriesResponse(reply));
            return Ok(());
        }

        self.adopt_term(req.term)?;
        if !matches!(self.role, Role::Follower(_)) {
            // Equal-term AppendEntries from another leader would violate
            // election safety; stepping back is the safe answer anyway.
            self.become_follower();
        }
        self.current_leader = Some(req.leader_id.clone());
        if let Role::Follower(state) = &mut self.role {
            state.timeout = self.config.follower_timeout();
        }
        self.touch();

        // Log consistency check: our entry at prev must carry prev_term.
        if self.store.term_for(req.prev_log_index) != Some(req.prev_log_term) {
            let reply = AppendEntriesResponse {
                term: self.current_term,
                success: false,
                last_log_index: our_last,
                leader_id: Some(req.leader_id),
                from: self.id.clone(),
                message: Some("log inconsistency".into()),
            };
            self.send_to(&req.from, Message::AppendEntriesResponse(reply));
            return Ok(());
        }

        // Unconditional once the consistency check passed: the store also
        // prunes entries above prev that are not in the batch, so a bare
        // heartbeat sheds any stray tail left behind by an abandoned leader.
        self.store.append_to_log(&req.entries, req.prev_log_index)?;
        if !req.entries.is_empty() {
            self.emit(Event::EntriesAppended {
                first_index: req.entries[0].index,
                count: req.entries.len() as u64,
            });
            // An uncommitted membership change starts binding quorum rules
            // as soon as it is appended.
            for entry in req.entries.iter().filter(|e| e.flags.topology_change) {
                let requested = decode_topology(&entry.data)?;
                if requested != self.topology {
                    self.changing_topology = Some(requested.clone());
                    self.emit(Event::TopologyChanging(requested));
                }
            }
        }

        let last_new = req.entries.last().map(|e| e.index).unwrap_or(req.prev_log_index);
        let target = req.leader_commit.min(last_new);
        if target > self.commit_index {
            self.commit_to(target)?;
        }

        let reply = AppendEntriesResponse {
            term: self.current_term,
            success: true,
            last_log_index: last_new,
            leader_id: Some(req.leader_id),
            from: self.id.clone(),
            message: None,
        };
        self.send_to(&req.from, Message::AppendEntriesResponse(reply));
        Ok(())
    }

    fn on_append_entries_response(
        &mut self,
        resp: AppendEntriesResponse,
    ) -> Result<(), RaftError> {
        if resp.term > self.current_term {
            self.adopt_term(resp.term)?;
            self.become_follower();
            return Ok(());
        }

        let last_index = self.store.last_log_entry().index;
        let peer = resp.from.clone();
        let caught_up = {
            let Some(state) = self.role.leader_state_mut() else {
                return Ok(());
            };
            if resp.success {
                let matched = state.match_index.entry(peer.clone()).or_insert(0);
                if resp.last_log_index > *matched {
                    *matched = resp.last_log_index;
                }
                state.next_index.insert(peer.clone(), resp.last_log_index + 1);
                resp.last_log_index >= last_index
            } else {
                // Back up below the follower's hint, at least one step.
                let next = state.next_index.entry(peer.clone()).or_insert(last_index + 1);
                let backed = next.saturating_sub(1).max(1);
                *next = backed.min(resp.last_log_index + 1).max(1);
                debug!(id = %self.id, peer = %peer, next = *next, "replication backed up");
                false
            }
        };

        if resp.success {
            self.try_advance_commit()?;
            self.check_step_down_complete()?;
        }
        if !caught_up {
            self.replicate_to(&peer)?;
        }
        Ok(())
    }

    /// Canonical commit rule: advance to the highest `N` with an entry of
    /// the current term that a quorum has replicated (a joint quorum while
    /// a membership change is in flight).
    fn try_advance_commit(&mut self) -> Result<(), RaftError> {
        let last_index = self.store.last_log_entry().index;
        let match_index = match self.role.leader_state() {
            Some(state) => state.match_index.clone(),
            None => return Ok(()),
        };

        let mut target = None;
        for n in (self.commit_index + 1..=last_index).rev() {
            match self.store.term_for(n) {
                Some(term) if term == self.current_term => {}
                Some(_) => break, // older terms commit transitively
                None => continue,
            }
            let mut acks: HashSet<NodeId> = HashSet::new();
            acks.insert(self.id.clone());
            for (peer, &matched) in &match_index {
                if matched >= n {
                    acks.insert(peer.clone());
                }
            }
            if self.joint_quorum(&acks) {
                target = Some(n);
                break;
            }
        }

        if let Some(n) = target {
            self.commit_to(n)?;
        }
        Ok(())
    }

    fn commit_to(&mut self, new_commit: u64) -> Result<(), RaftError> {
        if new_commit <= self.commit_index {
            return Ok(());
        }
        let old = self.commit_index;
        self.commit_index = new_commit;
        self.emit(Event::CommitIndexChanged { old, new: new_commit });
        self.apply_committed()?;
        self.resolve_pending();
        Ok(())
    }

    fn apply_committed(&mut self) -> Result<(), RaftError> {
        let entries = self.store.entries_between(self.last_applied, self.commit_index)?;
        for entry in entries {
            self.apply_entry(&entry)?;
            self.last_applied = entry.index;
            self.emit(Event::CommitApplied { index: entry.index });
            if matches!(self.role, Role::Stopped) {
                return Ok(());
            }
        }
        self.maybe_trigger_snapshot();
        Ok(())
    }

    fn apply_entry(&mut self, entry: &LogEntry) -> Result<(), RaftError> {
        if entry.flags.noop {
            return Ok(());
        }
        if entry.flags.topology_change {
            let requested = decode_topology(&entry.data)?;
            return self.commit_topology(requested);
        }
        self.state_machine
            .lock()
            .apply(entry, &entry.data)
            .map_err(|err| match err {
                StateMachineError::Serialization(msg) => RaftError::Serialization(msg),
                other => RaftError::StateMachine(other.to_string()),
            })
    }

    fn commit_topology(&mut self, requested: Topology) -> Result<(), RaftError> {
        self.store.set_current_topology(&requested)?;
        self.topology = requested.clone();
        self.changing_topology = None;
        info!(id = %self.id, members = requested.len(), "topology committed");
        self.emit(Event::TopologyChanged(requested.clone()));

        if !requested.contains(&self.id) {
            self.stop();
            return Ok(());
        }
        if let Some(state) = self.role.leader_state_mut() {
            state.next_index.retain(|id, _| requested.contains(id));
            state.match_index.retain(|id, _| requested.contains(id));
            state.snapshots_in_flight.retain(|id| requested.contains(id));
        }
        Ok(())
    }

    fn resolve_pending(&mut self) {
        let commit_index = self.commit_index;
        if let Some(state) = self.role.leader_state_mut() {
            while state
                .pending
                .front()
                .is_some_and(|pending| pending.index <= commit_index)
            {
                if let Some(pending) = state.pending.pop_front() {
                    let _ = pending.done.send(Ok(pending.index));
                }
            }
        }
    }

    fn maybe_trigger_snapshot(&mut self) {
        let threshold = self.config.max_log_length_before_compaction;
        if threshold == 0 || self.snapshot_running {
            return;
        }
        if !self.state_machine.lock().supports_snapshots() {
            return;
        }
        if self.store.committed_entries_count(self.commit_index) < threshold {
            return;
        }
        // The mark's term must be the term of the entry at the boundary or
        // the consistency check at the boundary breaks for followers.
        let Some(term) = self.store.term_for(self.commit_index) else {
            return;
        };
        self.snapshot_running = true;
        self.emit(Event::CreatingSnapshot);
        self.effects.push(Effect::CreateSnapshot { up_to: self.commit_index, term });
    }

    /// Completion callback for the snapshot-creation task.
    pub(crate) fn finish_snapshot_creation(
        &mut self,
        up_to: u64,
        term: u64,
        result: Result<(), StateMachineError>,
    ) -> Result<(), RaftError> {
        self.snapshot_running = false;
        match result {
            Ok(()) => {
                let trailing = self.config.max_log_length_before_compaction * 7 / 8;
                self.store.mark_snapshot_for(up_to, term, trailing)?;
                info!(id = %self.id, index = up_to, term, "snapshot created, log compacted");
                self.emit(Event::CreatedSnapshot { index: up_to, term });
            }
            Err(err) => {
                warn!(id = %self.id, %err, "snapshot creation failed");
                self.emit(Event::SnapshotCreationError(err.to_string()));
            }
        }
        Ok(())
    }

    // === Snapshot transfer ===

    fn on_can_install_snapshot(
        &mut self,
        req: CanInstallSnapshotRequest,
    ) -> Result<(), RaftError> {
        if matches!(self.role, Role::InstallingSnapshot(_)) {
            let reply = CanInstallSnapshotResponse {
                success: false,
                is_currently_installing: true,
                term: self.current_term,
                index: self.last_applied,
                from: self.id.clone(),
            };
            self.send_to(&req.from, Message::CanInstallSnapshotResponse(reply));
            return Ok(());
        }

        if req.term < self.current_term {
            let reply = CanInstallSnapshotResponse {
                success: false,
                is_currently_installing: false,
                term: self.current_term,
                index: self.last_applied,
                from: self.id.clone(),
            };
            self.send_to(&req.from, Message::CanInstallSnapshotResponse(reply));
            return Ok(());
        }

        self.adopt_term(req.term)?;
        self.current_leader = Some(req.leader_id.clone());
        if let Role::Follower(state) = &mut self.role {
            state.timeout = self.config.follower_timeout();
        }
        self.touch();

        let our_last = self.store.last_log_entry().index.max(self.last_applied);
        let accept = req.index > our_last;
        let reply = CanInstallSnapshotResponse {
            success: accept,
            is_currently_installing: false,
            term: self.current_term,
            index: if accept { req.index } else { self.last_applied },
            from: self.id.clone(),
        };
        self.send_to(&req.from, Message::CanInstallSnapshotResponse(reply));
        Ok(())
    }

    fn on_can_install_snapshot_response(
        &mut self,
        resp: CanInstallSnapshotResponse,
    ) -> Result<(), RaftError> {
        if resp.term > self.current_term {
            self.adopt_term(resp.term)?;
            self.become_follower();
            return Ok(());
        }
        if resp.is_currently_installing {
            // Busy draining another snapshot; ask again next tick.
            return Ok(());
        }

        let term = self.current_term;
        let id = self.id.clone();
        let topology = self.topology.clone();
        let peer = resp.from.clone();
        let Some(state) = self.role.leader_state_mut() else {
            return Ok(());
        };
        if resp.success {
            if state.snapshots_in_flight.insert(peer.clone()) {
                self.effects.push(Effect::SendSnapshot {
                    to: peer,
                    term,
                    leader_id: id,
                    topology,
                });
            }
        } else {
            // The peer already holds this state; resume normal replication
            // right after its applied prefix.
            state.next_index.insert(peer, resp.index + 1);
        }
        Ok(())
    }

    /// Completion callback for the snapshot-send task.
    pub(crate) fn snapshot_send_finished(&mut self, peer: &str) {
        if let Some(state) = self.role.leader_state_mut() {
            state.snapshots_in_flight.remove(peer);
        }
    }

    fn on_install_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
        source: Option<SnapshotSource>,
    ) -> Result<(), RaftError> {
        let our_last = self.store.last_log_entry().index.max(self.last_applied);

        let refusal = if matches!(self.role, Role::InstallingSnapshot(_)) {
            Some("already installing a snapshot")
        } else if req.term < self.current_term {
            Some("stale term")
        } else if req.last_included_index <= our_last {
            Some("snapshot is older than local state")
        } else {
            None
        };
        if let Some(reason) = refusal {
            debug!(id = %self.id, from = %req.from, reason, "refusing snapshot");
            let reply = InstallSnapshotResponse {
                term: self.current_term,
                last_log_index: our_last,
                success: false,
                from: self.id.clone(),
            };
            self.send_to(&req.from, Message::InstallSnapshotResponse(reply));
            return Ok(());
        }

        self.adopt_term(req.term)?;
        self.current_leader = Some(req.leader_id.clone());
        self.touch();
        info!(id = %self.id, index = req.last_included_index, from = %req.from, "installing snapshot");
        self.transition(Role::InstallingSnapshot(InstallingState {
            index: req.last_included_index,
            timeout: self.config.follower_timeout(),
        }));
        self.emit(Event::InstallingSnapshot {
            index: req.last_included_index,
            from: req.from.clone(),
        });
        self.effects.push(Effect::InstallSnapshot { request: req, source });
        Ok(())
    }

    /// Completion callback for the snapshot-install drain task. Runs every
    /// stateful step of the install on the event loop.
    pub(crate) fn finish_snapshot_install(
        &mut self,
        request: InstallSnapshotRequest,
        body: Result<Vec<u8>, String>,
    ) -> Result<(), RaftError> {
        if !matches!(self.role, Role::InstallingSnapshot(_)) {
            return Ok(());
        }
        let index = request.last_included_index;
        let term = request.last_included_term;

        let data = match body {
            Ok(data) => data,
            Err(err) => {
                warn!(id = %self.id, index, %err, "snapshot stream failed");
                let reply = InstallSnapshotResponse {
                    term: self.current_term,
                    last_log_index: self.store.last_log_entry().index,
                    success: false,
                    from: self.id.clone(),
                };
                self.send_to(&request.from, Message::InstallSnapshotResponse(reply));
                self.become_follower();
                return Ok(());
            }
        };

        self.state_machine
            .lock()
            .apply_snapshot(term, index, &data)
            .map_err(|err| RaftError::StateMachine(err.to_string()))?;
        // The snapshot replaces the log wholesale.
        self.store.mark_snapshot_for(index, term, 0)?;

        self.store.set_current_topology(&request.topology)?;
        self.topology = request.topology.clone();
        self.changing_topology = None;
        self.emit(Event::TopologyChanged(request.topology.clone()));

        self.adopt_term(request.term)?;
        let old = self.commit_index;
        if index > self.commit_index {
            self.commit_index = index;
            self.emit(Event::CommitIndexChanged { old, new: index });
        }
        self.last_applied = self.last_applied.max(index);
        info!(id = %self.id, index, term, "snapshot installed");
        self.emit(Event::SnapshotInstalled { index });

        let reply = InstallSnapshotResponse {
            term: self.current_term,
            last_log_index: index,
            success: true,
            from: self.id.clone(),
        };
        self.send_to(&request.from, Message::InstallSnapshotResponse(reply));

        if !self.topology.contains(&self.id) {
            self.stop();
        } else {
            self.become_follower();
        }
        Ok(())
    }

    fn on_install_snapshot_response(
        &mut self,
        resp: InstallSnapshotResponse,
    ) -> Result<(), RaftError> {
        if resp.term > self.current_term {
            self.adopt_term(resp.term)?;
            self.become_follower();
            return Ok(());
        }

        let peer = resp.from.clone();
        let success = {
            let Some(state) = self.role.leader_state_mut() else {
                return Ok(());
            };
            state.snapshots_in_flight.remove(&peer);
            if resp.success {
                let matched = state.match_index.entry(peer.clone()).or_insert(0);
                if resp.last_log_index > *matched {
                    *matched = resp.last_log_index;
                }
                state.next_index.insert(peer.clone(), resp.last_log_index + 1);
            }
            resp.success
        };

        if success {
            self.try_advance_commit()?;
            // Ship whatever accumulated past the snapshot.
            self.replicate_to(&peer)?;
        }
        Ok(())
    }

    fn on_timeout_now(&mut self, msg: TimeoutNow) -> Result<(), RaftError> {
        if msg.term < self.current_term {
            return Ok(());
        }
        if matches!(self.role, Role::Follower(_) | Role::Candidate(_)) && self.is_voter(&self.id)
        {
            info!(id = %self.id, from = %msg.from, "timeout-now received, campaigning");
            self.start_election()?;
        }
        Ok(())
    }

    // === Client API ===

    pub(crate) fn append_command(
        &mut self,
        data: Vec<u8>,
        done: oneshot::Sender<Result<u64, RaftError>>,
    ) -> Result<(), RaftError> {
        if let Some(err) = self.leader_only() {
            let _ = done.send(Err(err));
            return Ok(());
        }

        let index =
            self.store
                .append_to_leader_log(self.current_term, data, EntryFlags::default())?;
        self.emit(Event::EntriesAppended { first_index: index, count: 1 });
        if let Some(state) = self.role.leader_state_mut() {
            state.last_client_index = index;
            state.pending.push_back(PendingCommit { index, done });
        }
        // A single-voter cluster commits on append; everyone else commits
        // as responses arrive.
        self.try_advance_commit()?;
        self.broadcast_replication()
    }

    pub(crate) fn add_member(
        &mut self,
        node: NodeId,
        done: oneshot::Sender<Result<u64, RaftError>>,
    ) -> Result<(), RaftError> {
        if let Some(err) = self.leader_only() {
            let _ = done.send(Err(err));
            return Ok(());
        }
        if self.topology.contains(&node) {
            let _ = done.send(Err(RaftError::InvalidOperation(format!(
                "{node} is already a voting member"
            ))));
            return Ok(());
        }
        let requested = self.topology.with_member(&node);
        self.propose_topology(requested, done)
    }

    pub(crate) fn remove_member(
        &mut self,
        node: NodeId,
        done: oneshot::Sender<Result<u64, RaftError>>,
    ) -> Result<(), RaftError> {
        if let Some(err) = self.leader_only() {
            let _ = done.send(Err(err));
            return Ok(());
        }
        if node == self.id {
            let _ = done.send(Err(RaftError::InvalidOperation(
                "cannot remove self; step down and ask the new leader".into(),
            )));
            return Ok(());
        }
        if !self.topology.contains(&node) {
            let _ = done.send(Err(RaftError::InvalidOperation(format!(
                "{node} is not a voting member"
            ))));
            return Ok(());
        }
        let requested = self.topology.without_member(&node);
        self.propose_topology(requested, done)
    }

    fn propose_topology(
        &mut self,
        requested: Topology,
        done: oneshot::Sender<Result<u64, RaftError>>,
    ) -> Result<(), RaftError> {
        if let Some(err) = self.leader_only() {
            let _ = done.send(Err(err));
            return Ok(());
        }
        if self.changing_topology.is_some() {
            let _ = done.send(Err(RaftError::InvalidOperation(
                "a membership change is already in flight".into(),
            )));
            return Ok(());
        }

        let command = EngineCommand::ChangeTopology {
            members: requested.member_set().clone(),
        };
        let data = command.encode()?;

        self.changing_topology = Some(requested.clone());
        self.emit(Event::TopologyChanging(requested.clone()));

        let index = self.store.append_to_leader_log(
            self.current_term,
            data,
            EntryFlags { topology_change: true, noop: false },
        )?;
        self.emit(Event::EntriesAppended { first_index: index, count: 1 });

        let last_index = self.store.last_log_entry().index;
        if let Some(state) = self.role.leader_state_mut() {
            state.last_client_index = index;
            for member in requested.members() {
                if member != &self.id {
                    state.track_peer(member, last_index.saturating_sub(1));
                }
            }
            state.pending.push_back(PendingCommit { index, done });
        }
        self.try_advance_commit()?;
        self.broadcast_replication()
    }

    pub(crate) fn step_down(
        &mut self,
        done: oneshot::Sender<Result<(), RaftError>>,
    ) -> Result<(), RaftError> {
        if !matches!(self.role, Role::Leader(_)) {
            let _ = done.send(Err(RaftError::NotLeader {
                leader_hint: self.current_leader.clone(),
            }));
            return Ok(());
        }
        if self.topology.quorum_size() <= 1 && self.changing_topology.is_none() {
            let _ = done.send(Err(RaftError::InvalidOperation(
                "sole voting member cannot step down".into(),
            )));
            return Ok(());
        }

        let old = std::mem::replace(&mut self.role, Role::Stopped);
        let Role::Leader(leader) = old else {
            unreachable!("checked above");
        };
        let drain_to = leader.last_client_index;
        info!(id = %self.id, drain_to, "stepping down");
        self.role = Role::SteppingDown(SteppingDownState {
            leader,
            drain_to,
            done: Some(done),
        });
        self.emit(Event::StateChanged(RoleKind::SteppingDown));
        self.check_step_down_complete()
    }

    fn check_step_down_complete(&mut self) -> Result<(), RaftError> {
        let (target, done) = {
            let Role::SteppingDown(state) = &mut self.role else {
                return Ok(());
            };
            if self.commit_index < state.drain_to {
                return Ok(());
            }
            // Hand off to the most caught-up voter.
            let target = state
                .leader
                .match_index
                .iter()
                .max_by_key(|(_, &matched)| matched)
                .map(|(id, _)| id.clone());
            (target, state.done.take())
        };

        if let Some(peer) = target {
            self.send_to(
                &peer,
                Message::TimeoutNow(TimeoutNow { term: self.current_term, from: self.id.clone() }),
            );
        }
        if let Some(done) = done {
            let _ = done.send(Ok(()));
        }
        self.become_follower();
        Ok(())
    }

    fn leader_only(&self) -> Option<RaftError> {
        match self.role.kind() {
            RoleKind::Leader => None,
            RoleKind::Stopped => Some(RaftError::Stopped),
            _ => Some(RaftError::NotLeader { leader_hint: self.current_leader.clone() }),
        }
    }
}

fn decode_topology(data: &[u8]) -> Result<Topology, RaftError> {
    match EngineCommand::decode(data)? {
        EngineCommand::ChangeTopology { members } => Ok(Topology::new(members)),
        other => Err(RaftError::Serialization(format!(
            "expected topology change command, found {other:?}"
        ))),
    }
}
