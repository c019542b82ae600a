//! Transport abstraction.
//!
//! The outbound half is a [`Transport`]: fire-and-forget message sends plus
//! snapshot stream opening. The inbound half is the concrete [`Inbox`] the
//! engine owns; any transport implementation feeds it through the paired
//! [`InboxSender`]. A transport must not reorder messages from one source
//! to one destination; drops and duplicates are tolerated by the protocol.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::core::messages::{Envelope, InstallSnapshotRequest, Message, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("node {0} is not reachable")]
    Unreachable(NodeId),
    #[error("node {0} is not registered")]
    UnknownNode(NodeId),
    #[error("transport is closed")]
    Closed,
}

/// Readable body of an inbound snapshot transfer.
pub type SnapshotSource = Box<dyn AsyncRead + Send + Unpin>;

/// Writable sink for an outbound snapshot transfer.
pub type SnapshotSink = Box<dyn AsyncWrite + Send + Unpin>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Fire-and-forget send. Delivery failures are silent; the protocol
    /// self-heals through retries on the next heartbeat.
    fn send(&self, dest: &str, message: Message);

    /// Announce a snapshot transfer to `dest` and open a byte sink for its
    /// body. The receiver sees the header as an `InstallSnapshot` envelope
    /// whose snapshot source yields exactly the bytes written to the sink.
    async fn open_snapshot_stream(
        &self,
        dest: &str,
        header: InstallSnapshotRequest,
    ) -> Result<SnapshotSink, TransportError>;
}

/// Receive half owned by the engine's event loop.
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
    closed: bool,
}

/// Cloneable producer side paired with an [`Inbox`].
#[derive(Clone)]
pub struct InboxSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl InboxSender {
    /// Queue an envelope for the engine. Returns false when the engine has
    /// shut down and the envelope was dropped.
    pub fn deliver(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).is_ok()
    }
}

impl Inbox {
    pub fn channel() -> (InboxSender, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (InboxSender { tx }, Inbox { rx, closed: false })
    }

    /// Wait up to `timeout` for the next envelope. `None` signals a timeout;
    /// a disconnected inbox behaves like an idle one so an isolated node
    /// still runs its local timers.
    pub async fn try_receive(&mut self, timeout: Duration) -> Option<Envelope> {
        if self.closed {
            tokio::time::sleep(timeout).await;
            return None;
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(envelope)) => Some(envelope),
            Ok(None) => {
                self.closed = true;
                None
            }
            Err(_) => None,
        }
    }
}
