//! Testing utilities for cluster integration tests
//!
//! Provides [`TestCluster`] for spinning up in-process clusters over the
//! in-memory network, with partition injection and per-node taps into the
//! dictionary state machine and the engine's event stream.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::core::config::EngineConfig;
use crate::core::events::Event;
use crate::core::messages::NodeId;
use crate::core::server::{RaftHandle, RaftServer, Status};
use crate::state_machine::{DictionaryStateMachine, SharedStateMachine};
use crate::storage::MemoryStore;
use crate::transport::{InMemoryNetwork, InMemoryTransport};

/// Timings tight enough that integration tests converge in well under a
/// second per protocol round.
pub fn fast_config(name: &str, members: &[NodeId]) -> EngineConfig {
    EngineConfig::new(name, members.to_vec())
        .with_election_timeout(Duration::from_millis(50))
        .with_heartbeat_timeout(Duration::from_millis(10))
}

/// A single in-process node.
pub struct TestNode {
    pub id: NodeId,
    pub handle: RaftHandle,
    pub machine: Arc<Mutex<DictionaryStateMachine>>,
    pub events: Arc<Mutex<Vec<Event>>>,
}

/// An in-process cluster over [`InMemoryNetwork`].
pub struct TestCluster {
    pub network: InMemoryNetwork,
    pub nodes: Vec<TestNode>,
    configure: Arc<dyn Fn(EngineConfig) -> EngineConfig + Send + Sync>,
}

impl TestCluster {
    /// Start `count` nodes named `n1..nN`, all voting members.
    pub async fn new(count: usize) -> Self {
        Self::with_config(count, |config| config).await
    }

    /// Start a cluster with a config tweak applied to every node.
    pub async fn with_config(
        count: usize,
        configure: impl Fn(EngineConfig) -> EngineConfig + Send + Sync + 'static,
    ) -> Self {
        let network = InMemoryNetwork::new();
        let members: Vec<NodeId> = (1..=count).map(|i| format!("n{i}")).collect();
        let configure: Arc<dyn Fn(EngineConfig) -> EngineConfig + Send + Sync> =
            Arc::new(configure);

        let mut cluster = TestCluster { network, nodes: Vec::new(), configure };
        for id in members.clone() {
            cluster.spawn_node(id, members.clone());
        }
        cluster
    }

    fn spawn_node(&mut self, id: NodeId, voting: Vec<NodeId>) {
        let (machine, shared): (Arc<Mutex<DictionaryStateMachine>>, SharedStateMachine) =
            DictionaryStateMachine::shared();
        let (transport, inbox): (InMemoryTransport, _) = self.network.register(id.clone());
        let config = (self.configure)(fast_config(&id, &voting));

        let mut server = RaftServer::new(
            config,
            Box::new(MemoryStore::new()),
            shared,
            transport,
            inbox,
        )
        .expect("test node construction");

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        server.subscribe(move |event| sink.lock().push(event.clone()));

        let handle = server.start();
        self.nodes.push(TestNode { id, handle, machine, events });
    }

    /// Start an extra node that is not yet a voting member: it bootstraps
    /// with the founding members as its topology and waits to be added.
    pub fn add_node(&mut self, id: impl Into<NodeId>, founding: usize) {
        let voting: Vec<NodeId> = (1..=founding).map(|i| format!("n{i}")).collect();
        self.spawn_node(id.into(), voting);
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|node| node.id.clone()).collect()
    }

    pub fn node(&self, id: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|node| node.id == id)
            .unwrap_or_else(|| panic!("no node {id}"))
    }

    pub fn handle(&self, id: &str) -> &RaftHandle {
        &self.node(id).handle
    }

    pub fn machine(&self, id: &str) -> Arc<Mutex<DictionaryStateMachine>> {
        Arc::clone(&self.node(id).machine)
    }

    pub fn events(&self, id: &str) -> Vec<Event> {
        self.node(id).events.lock().clone()
    }

    pub async fn status(&self, id: &str) -> Option<Status> {
        self.handle(id).status().await.ok()
    }

    /// Wait until some node reports itself leader; returns its id.
    pub async fn wait_for_leader(&self, timeout: Duration) -> NodeId {
        let ids = self.ids();
        self.wait_for_leader_among(&ids, timeout).await
    }

    /// Wait for a leader among `candidates` only (e.g. after a partition).
    pub async fn wait_for_leader_among(&self, candidates: &[NodeId], timeout: Duration) -> NodeId {
        let start = Instant::now();
        while start.elapsed() < timeout {
            for id in candidates {
                if let Some(status) = self.status(id).await {
                    if status.role == crate::core::roles::RoleKind::Leader {
                        return id.clone();
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no leader among {candidates:?} within {timeout:?}");
    }

    /// A node currently reporting itself follower, if any.
    pub async fn find_follower(&self) -> Option<NodeId> {
        for node in &self.nodes {
            if let Some(status) = self.status(&node.id).await {
                if status.role == crate::core::roles::RoleKind::Follower {
                    return Some(node.id.clone());
                }
            }
        }
        None
    }

    pub fn partition(&self, a: &str, b: &str) {
        self.network.partition(a, b);
    }

    pub fn isolate(&self, id: &str) {
        self.network.isolate(id);
    }

    pub fn rejoin(&self, id: &str) {
        self.network.rejoin(id);
    }

    pub fn heal_all(&self) {
        self.network.heal_all();
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.handle.shutdown().await;
        }
    }
}

/// Poll `probe` until it returns true or `deadline` passes.
pub async fn eventually(deadline: Duration, mut probe: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within {deadline:?}");
}
