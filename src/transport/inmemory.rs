//! In-memory transport implementation for testing
//!
//! Nodes register against a shared [`InMemoryNetwork`] and get back their
//! outbound transport and inbox. Delivery is an unbounded per-node FIFO,
//! so per-source ordering holds by construction. Symmetric partitions can
//! be injected and healed at runtime; sends across a partition vanish
//! silently, exactly like a dropped datagram.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use crate::core::messages::{Envelope, InstallSnapshotRequest, Message, NodeId};

use super::traits::{Inbox, InboxSender, SnapshotSink, Transport, TransportError};

/// Size of the pipe buffer backing an in-memory snapshot stream.
const SNAPSHOT_PIPE_CAPACITY: usize = 64 * 1024;

struct NetworkInner {
    nodes: RwLock<HashMap<NodeId, InboxSender>>,
    /// Normalized (low, high) pairs that cannot talk to each other.
    blocked: RwLock<HashSet<(NodeId, NodeId)>>,
}

fn pair(a: &str, b: &str) -> (NodeId, NodeId) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[derive(Clone)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        InMemoryNetwork {
            inner: Arc::new(NetworkInner {
                nodes: RwLock::new(HashMap::new()),
                blocked: RwLock::new(HashSet::new()),
            }),
        }
    }

    /// Register a node and return its outbound transport and inbox.
    pub fn register(&self, name: impl Into<NodeId>) -> (InMemoryTransport, Inbox) {
        let name = name.into();
        let (sender, inbox) = Inbox::channel();
        self.inner.nodes.write().insert(name.clone(), sender);
        (InMemoryTransport { name, inner: Arc::clone(&self.inner) }, inbox)
    }

    /// Drop all traffic between `a` and `b`, both directions.
    pub fn partition(&self, a: &str, b: &str) {
        self.inner.blocked.write().insert(pair(a, b));
    }

    /// Restore traffic between `a` and `b`.
    pub fn heal(&self, a: &str, b: &str) {
        self.inner.blocked.write().remove(&pair(a, b));
    }

    /// Cut `node` off from every currently registered peer.
    pub fn isolate(&self, node: &str) {
        let peers: Vec<NodeId> = self.inner.nodes.read().keys().cloned().collect();
        let mut blocked = self.inner.blocked.write();
        for peer in peers {
            if peer != node {
                blocked.insert(pair(node, &peer));
            }
        }
    }

    /// Remove every partition involving `node`.
    pub fn rejoin(&self, node: &str) {
        self.inner
            .blocked
            .write()
            .retain(|(a, b)| a != node && b != node);
    }

    /// Remove all partitions.
    pub fn heal_all(&self) {
        self.inner.blocked.write().clear();
    }
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InMemoryTransport {
    name: NodeId,
    inner: Arc<NetworkInner>,
}

impl NetworkInner {
    fn is_blocked(&self, a: &str, b: &str) -> bool {
        self.blocked.read().contains(&pair(a, b))
    }

    fn deliver(&self, from: &str, dest: &str, envelope: Envelope) -> Result<(), TransportError> {
        if self.is_blocked(from, dest) {
            trace!(from, dest, "dropping message across partition");
            return Err(TransportError::Unreachable(dest.to_string()));
        }
        let nodes = self.nodes.read();
        let sender = nodes
            .get(dest)
            .ok_or_else(|| TransportError::UnknownNode(dest.to_string()))?;
        if !sender.deliver(envelope) {
            return Err(TransportError::Unreachable(dest.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn send(&self, dest: &str, message: Message) {
        if let Err(err) = self.inner.deliver(&self.name, dest, Envelope::new(message)) {
            trace!(from = %self.name, dest, %err, "send dropped");
        }
    }

    async fn open_snapshot_stream(
        &self,
        dest: &str,
        header: InstallSnapshotRequest,
    ) -> Result<SnapshotSink, TransportError> {
        let (local, remote) = tokio::io::duplex(SNAPSHOT_PIPE_CAPACITY);
        let envelope =
            Envelope::with_snapshot(Message::InstallSnapshot(header), Box::new(remote));
        self.inner.deliver(&self.name, dest, envelope)?;
        Ok(Box::new(local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::core::messages::TimeoutNow;
    use crate::core::topology::Topology;

    fn timeout_now(from: &str) -> Message {
        Message::TimeoutNow(TimeoutNow { term: 1, from: from.into() })
    }

    fn snapshot_header(from: &str) -> InstallSnapshotRequest {
        InstallSnapshotRequest {
            term: 1,
            last_included_index: 5,
            last_included_term: 1,
            leader_id: from.into(),
            topology: Topology::new([from.to_string()]),
            from: from.into(),
        }
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let network = InMemoryNetwork::new();
        let (t1, _inbox1) = network.register("n1");
        let (_t2, mut inbox2) = network.register("n2");

        t1.send("n2", timeout_now("n1"));

        let envelope = inbox2.try_receive(Duration::from_millis(100)).await.unwrap();
        assert_eq!(envelope.message.from(), "n1");
        assert!(envelope.snapshot.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partition_drops_messages() {
        let network = InMemoryNetwork::new();
        let (t1, _inbox1) = network.register("n1");
        let (_t2, mut inbox2) = network.register("n2");

        network.partition("n1", "n2");
        t1.send("n2", timeout_now("n1"));
        assert!(inbox2.try_receive(Duration::from_millis(50)).await.is_none());

        network.heal("n1", "n2");
        t1.send("n2", timeout_now("n1"));
        assert!(inbox2.try_receive(Duration::from_millis(50)).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolate_and_rejoin() {
        let network = InMemoryNetwork::new();
        let (t1, _inbox1) = network.register("n1");
        let (t2, mut inbox2) = network.register("n2");
        let (_t3, mut inbox3) = network.register("n3");

        network.isolate("n1");
        t1.send("n2", timeout_now("n1"));
        t1.send("n3", timeout_now("n1"));
        assert!(inbox2.try_receive(Duration::from_millis(50)).await.is_none());
        assert!(inbox3.try_receive(Duration::from_millis(50)).await.is_none());

        // Unrelated traffic still flows.
        t2.send("n3", timeout_now("n2"));
        assert!(inbox3.try_receive(Duration::from_millis(50)).await.is_some());

        network.rejoin("n1");
        t1.send("n2", timeout_now("n1"));
        assert!(inbox2.try_receive(Duration::from_millis(50)).await.is_some());
    }

    #[tokio::test]
    async fn test_per_source_ordering() {
        let network = InMemoryNetwork::new();
        let (t1, _inbox1) = network.register("n1");
        let (_t2, mut inbox2) = network.register("n2");

        for term in 1..=5u64 {
            t1.send("n2", Message::TimeoutNow(TimeoutNow { term, from: "n1".into() }));
        }
        for expected in 1..=5u64 {
            let envelope = inbox2.try_receive(Duration::from_millis(100)).await.unwrap();
            match envelope.message {
                Message::TimeoutNow(m) => assert_eq!(m.term, expected),
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_snapshot_stream_round_trip() {
        let network = InMemoryNetwork::new();
        let (t1, _inbox1) = network.register("n1");
        let (_t2, mut inbox2) = network.register("n2");

        let mut sink = t1.open_snapshot_stream("n2", snapshot_header("n1")).await.unwrap();
        let payload = vec![7u8; 200_000]; // larger than the pipe buffer
        let writer = tokio::spawn(async move {
            sink.write_all(&payload).await.unwrap();
            sink.shutdown().await.unwrap();
        });

        let envelope = inbox2.try_receive(Duration::from_millis(100)).await.unwrap();
        let mut source = envelope.snapshot.expect("snapshot body");
        let mut received = Vec::new();
        source.read_to_end(&mut received).await.unwrap();

        writer.await.unwrap();
        assert_eq!(received.len(), 200_000);
        assert!(received.iter().all(|&b| b == 7));
        assert!(matches!(envelope.message, Message::InstallSnapshot(_)));
    }

    #[tokio::test]
    async fn test_snapshot_stream_to_partitioned_node_fails() {
        let network = InMemoryNetwork::new();
        let (t1, _inbox1) = network.register("n1");
        let (_t2, _inbox2) = network.register("n2");

        network.partition("n1", "n2");
        let result = t1.open_snapshot_stream("n2", snapshot_header("n1")).await;
        assert!(matches!(result, Err(TransportError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let network = InMemoryNetwork::new();
        let (t1, _inbox1) = network.register("n1");
        let result = t1.open_snapshot_stream("ghost", snapshot_header("n1")).await;
        assert!(matches!(result, Err(TransportError::UnknownNode(_))));
    }
}
