//! Async driver around the consensus engine.
//!
//! [`RaftServer`] owns the [`Engine`], the transport, and the inbox, and
//! runs the single-threaded event loop: wait for an envelope up to the
//! active role's timeout, dispatch it (or the timeout), then drain the
//! engine's effects. Background work (snapshot creation, sending,
//! installing) runs on spawned tasks that post their results back onto the
//! loop through a callback channel, so all engine state is still mutated
//! from exactly one task.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::core::config::EngineConfig;
use crate::core::engine::{Effect, Engine};
use crate::core::events::Event;
use crate::core::messages::{InstallSnapshotRequest, NodeId};
use crate::core::roles::RoleKind;
use crate::core::topology::Topology;
use crate::state_machine::SharedStateMachine;
use crate::storage::{PersistentStore, StoreError};
use crate::transport::{Inbox, SnapshotSource, Transport};

/// How long `shutdown` waits for the event loop to acknowledge.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Errors surfaced through the public handle.
#[derive(Debug, Clone, Error)]
pub enum RaftError {
    /// The operation needs a leader; `leader_hint` is the last leader this
    /// node heard from, if any.
    #[error("not the leader (known leader: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },
    /// Illegal sequencing, e.g. removing self or overlapping membership
    /// changes.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// The node was removed from the cluster and no longer participates.
    #[error("engine is stopped")]
    Stopped,
    /// Durable storage failed; fatal to the engine.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The state machine failed to apply a committed command or snapshot;
    /// fatal to the engine.
    #[error("state machine failure: {0}")]
    StateMachine(String),
    /// A persisted or proposed command could not be (de)serialized; fatal
    /// to the engine.
    #[error("serialization failure: {0}")]
    Serialization(String),
    /// The event loop is gone.
    #[error("engine shut down")]
    Shutdown,
}

/// Point-in-time view of a node, served by the event loop.
#[derive(Debug, Clone)]
pub struct Status {
    pub id: NodeId,
    pub role: RoleKind,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub topology: Topology,
}

enum ApiRequest {
    Append { data: Vec<u8>, done: oneshot::Sender<Result<u64, RaftError>> },
    AddMember { node: NodeId, done: oneshot::Sender<Result<u64, RaftError>> },
    RemoveMember { node: NodeId, done: oneshot::Sender<Result<u64, RaftError>> },
    StepDown { done: oneshot::Sender<Result<(), RaftError>> },
    Status { done: oneshot::Sender<Status> },
}

type Callback = Box<dyn FnOnce(&mut Engine) -> Result<(), RaftError> + Send>;

/// Handle for interacting with a running [`RaftServer`]. Cheap to clone.
#[derive(Clone)]
pub struct RaftHandle {
    api_tx: mpsc::Sender<ApiRequest>,
    shutdown_tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl RaftHandle {
    /// Replicate an opaque command; resolves with its log index once the
    /// entry commits. Fails with [`RaftError::NotLeader`] on non-leaders.
    pub async fn append(&self, command: Vec<u8>) -> Result<u64, RaftError> {
        let (done, rx) = oneshot::channel();
        self.api_tx
            .send(ApiRequest::Append { data: command, done })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Add a voting member; resolves once the change commits in both the
    /// old and new topologies.
    pub async fn add_member(&self, node: impl Into<NodeId>) -> Result<(), RaftError> {
        let (done, rx) = oneshot::channel();
        self.api_tx
            .send(ApiRequest::AddMember { node: node.into(), done })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?.map(|_| ())
    }

    /// Remove a voting member (never the leader itself).
    pub async fn remove_member(&self, node: impl Into<NodeId>) -> Result<(), RaftError> {
        let (done, rx) = oneshot::channel();
        self.api_tx
            .send(ApiRequest::RemoveMember { node: node.into(), done })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?.map(|_| ())
    }

    /// Relinquish leadership after draining accepted client commands.
    pub async fn step_down(&self) -> Result<(), RaftError> {
        let (done, rx) = oneshot::channel();
        self.api_tx
            .send(ApiRequest::StepDown { done })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    pub async fn status(&self) -> Result<Status, RaftError> {
        let (done, rx) = oneshot::channel();
        self.api_tx
            .send(ApiRequest::Status { done })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)
    }

    /// Stop the event loop, waiting up to ~500ms for it to acknowledge.
    pub async fn shutdown(&self) {
        let (ack, ack_rx) = oneshot::channel();
        if self.shutdown_tx.send(ack).await.is_ok() {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, ack_rx).await;
        }
    }
}

pub struct RaftServer<T: Transport> {
    engine: Engine,
    transport: Arc<T>,
    inbox: Inbox,
    api_tx: mpsc::Sender<ApiRequest>,
    api_rx: mpsc::Receiver<ApiRequest>,
    shutdown_tx: mpsc::Sender<oneshot::Sender<()>>,
    shutdown_rx: mpsc::Receiver<oneshot::Sender<()>>,
    callback_tx: mpsc::UnboundedSender<Callback>,
    callback_rx: mpsc::UnboundedReceiver<Callback>,
}

impl<T: Transport> RaftServer<T> {
    pub fn new(
        config: EngineConfig,
        store: Box<dyn PersistentStore>,
        state_machine: SharedStateMachine,
        transport: T,
        inbox: Inbox,
    ) -> Result<Self, RaftError> {
        let engine = Engine::new(config, store, state_machine)?;
        let (api_tx, api_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        Ok(RaftServer {
            engine,
            transport: Arc::new(transport),
            inbox,
            api_tx,
            api_rx,
            shutdown_tx,
            shutdown_rx,
            callback_tx,
            callback_rx,
        })
    }

    /// Register an observer; must be called before `start`. Observers run
    /// synchronously on the event loop and must not block.
    pub fn subscribe(&mut self, observer: impl Fn(&Event) + Send + 'static) {
        self.engine.observers.register(observer);
    }

    /// Convenience subscription that forwards every event into a channel.
    pub fn events(&mut self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    pub fn handle(&self) -> RaftHandle {
        RaftHandle {
            api_tx: self.api_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Spawn the event loop and return a handle to it.
    pub fn start(self) -> RaftHandle {
        let handle = self.handle();
        tokio::spawn(self.run());
        handle
    }

    async fn run(mut self) {
        info!(id = %self.engine.id, "event loop started");
        loop {
            let dt = self
                .engine
                .role_timeout()
                .saturating_sub(self.engine.last_heartbeat.elapsed());

            let step = tokio::select! {
                biased;
                ack = self.shutdown_rx.recv() => {
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    break;
                }
                Some(callback) = self.callback_rx.recv() => callback(&mut self.engine),
                Some(request) = self.api_rx.recv() => self.handle_api(request),
                received = self.inbox.try_receive(dt) => match received {
                    Some(envelope) => self.engine.handle_envelope(envelope),
                    None => self.engine.handle_timeout(),
                },
            };

            if let Err(err) = step {
                // Storage and apply failures are not recoverable; dying is
                // safer than serving from a log we cannot trust.
                error!(id = %self.engine.id, %err, "fatal engine error, terminating");
                break;
            }
            let halt = self.drain_effects();
            self.engine.observers.emit(&Event::EventsProcessed);
            if halt {
                break;
            }
        }
        info!(id = %self.engine.id, "event loop exited");
    }

    fn handle_api(&mut self, request: ApiRequest) -> Result<(), RaftError> {
        match request {
            ApiRequest::Append { data, done } => self.engine.append_command(data, done),
            ApiRequest::AddMember { node, done } => self.engine.add_member(node, done),
            ApiRequest::RemoveMember { node, done } => self.engine.remove_member(node, done),
            ApiRequest::StepDown { done } => self.engine.step_down(done),
            ApiRequest::Status { done } => {
                let _ = done.send(self.engine.status());
                Ok(())
            }
        }
    }

    fn drain_effects(&mut self) -> bool {
        let mut halt = false;
        for effect in self.engine.take_effects() {
            match effect {
                Effect::Send { to, message } => self.transport.send(&to, message),
                Effect::CreateSnapshot { up_to, term } => self.spawn_snapshot_creation(up_to, term),
                Effect::SendSnapshot { to, term, leader_id, topology } => {
                    self.spawn_snapshot_send(to, term, leader_id, topology)
                }
                Effect::InstallSnapshot { request, source } => {
                    self.spawn_snapshot_install(request, source)
                }
                Effect::Halt => halt = true,
            }
        }
        halt
    }

    fn spawn_snapshot_creation(&self, up_to: u64, term: u64) {
        let machine = Arc::clone(&self.engine.state_machine);
        let callback_tx = self.callback_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = machine.lock().create_snapshot(up_to, term);
            let _ = callback_tx.send(Box::new(move |engine: &mut Engine| {
                engine.finish_snapshot_creation(up_to, term, result)
            }) as Callback);
        });
    }

    fn spawn_snapshot_send(&self, to: NodeId, term: u64, leader_id: NodeId, topology: Topology) {
        let machine = Arc::clone(&self.engine.state_machine);
        let transport = Arc::clone(&self.transport);
        let callback_tx = self.callback_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = stream_snapshot(machine, transport, &to, term, leader_id, topology).await
            {
                warn!(peer = %to, %err, "snapshot send failed");
            }
            let _ = callback_tx.send(Box::new(move |engine: &mut Engine| {
                engine.snapshot_send_finished(&to);
                Ok(())
            }) as Callback);
        });
    }

    fn spawn_snapshot_install(
        &self,
        request: InstallSnapshotRequest,
        source: Option<SnapshotSource>,
    ) {
        let callback_tx = self.callback_tx.clone();
        tokio::spawn(async move {
            let body = match source {
                Some(mut source) => {
                    let mut data = Vec::new();
                    match source.read_to_end(&mut data).await {
                        Ok(_) => Ok(data),
                        Err(err) => Err(err.to_string()),
                    }
                }
                None => Ok(Vec::new()),
            };
            let _ = callback_tx.send(Box::new(move |engine: &mut Engine| {
                engine.finish_snapshot_install(request, body)
            }) as Callback);
        });
    }
}

/// Stream the latest snapshot blob to a peer in bounded chunks.
async fn stream_snapshot<T: Transport>(
    machine: SharedStateMachine,
    transport: Arc<T>,
    to: &str,
    term: u64,
    leader_id: NodeId,
    topology: Topology,
) -> Result<(), String> {
    let blob = machine
        .lock()
        .latest_snapshot()
        .map_err(|err| err.to_string())?
        .ok_or_else(|| "no snapshot available".to_string())?;

    let header = InstallSnapshotRequest {
        term,
        last_included_index: blob.index,
        last_included_term: blob.term,
        leader_id: leader_id.clone(),
        topology,
        from: leader_id,
    };
    let mut sink = transport
        .open_snapshot_stream(to, header)
        .await
        .map_err(|err| err.to_string())?;
    for chunk in blob.data.chunks(32 * 1024) {
        sink.write_all(chunk).await.map_err(|err| err.to_string())?;
    }
    sink.shutdown().await.map_err(|err| err.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::state_machine::{DictionaryCommand, DictionaryStateMachine};
    use crate::storage::MemoryStore;
    use crate::transport::InMemoryNetwork;

    fn fast_config(name: &str, members: &[&str]) -> EngineConfig {
        EngineConfig::new(name, members.iter().map(|s| s.to_string()).collect())
            .with_election_timeout(Duration::from_millis(50))
            .with_heartbeat_timeout(Duration::from_millis(10))
    }

    fn start_node(
        network: &InMemoryNetwork,
        name: &str,
        members: &[&str],
    ) -> (RaftHandle, Arc<parking_lot::Mutex<DictionaryStateMachine>>) {
        let (machine, shared) = DictionaryStateMachine::shared();
        let (transport, inbox) = network.register(name);
        let server = RaftServer::new(
            fast_config(name, members),
            Box::new(MemoryStore::new()),
            shared,
            transport,
            inbox,
        )
        .unwrap();
        (server.start(), machine)
    }

    #[tokio::test]
    async fn test_single_node_becomes_leader_and_commits() {
        let network = InMemoryNetwork::new();
        let (handle, machine) = start_node(&network, "n1", &["n1"]);

        let start = Instant::now();
        loop {
            let status = handle.status().await.unwrap();
            if status.role == RoleKind::Leader {
                break;
            }
            assert!(start.elapsed() < Duration::from_secs(2), "no leader elected");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let index = handle
            .append(DictionaryCommand::set("a", 1).encode())
            .await
            .unwrap();
        // Index 1 is the election no-op.
        assert_eq!(index, 2);

        let status = handle.status().await.unwrap();
        assert_eq!(status.commit_index, 2);
        assert_eq!(status.last_applied, 2);
        assert_eq!(machine.lock().get("a"), Some(1));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_append_on_leaderless_node_fails() {
        let network = InMemoryNetwork::new();
        // Two peers of the three-node topology never start: no quorum.
        let (handle, _machine) = start_node(&network, "n1", &["n1", "n2", "n3"]);

        let result = handle.append(DictionaryCommand::set("a", 1).encode()).await;
        assert!(matches!(result, Err(RaftError::NotLeader { .. })));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_events_report_election() {
        let network = InMemoryNetwork::new();
        let (machine, shared) = DictionaryStateMachine::shared();
        let _ = machine;
        let (transport, inbox) = network.register("n1");
        let mut server = RaftServer::new(
            fast_config("n1", &["n1"]),
            Box::new(MemoryStore::new()),
            shared,
            transport,
            inbox,
        )
        .unwrap();
        let mut events = server.events();
        let handle = server.start();

        let start = Instant::now();
        let mut elected = false;
        while start.elapsed() < Duration::from_secs(2) && !elected {
            while let Ok(event) = events.try_recv() {
                if event == Event::ElectedAsLeader {
                    elected = true;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(elected, "ElectedAsLeader never observed");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_the_handle() {
        let network = InMemoryNetwork::new();
        let (handle, _machine) = start_node(&network, "n1", &["n1"]);

        handle.shutdown().await;

        let start = Instant::now();
        loop {
            if matches!(handle.status().await, Err(RaftError::Shutdown)) {
                break;
            }
            assert!(start.elapsed() < Duration::from_secs(1), "loop never exited");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
