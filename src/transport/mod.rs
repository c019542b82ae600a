//! Message and snapshot-stream plumbing between nodes.

pub mod inmemory;
pub mod traits;

pub use inmemory::{InMemoryNetwork, InMemoryTransport};
pub use traits::{Inbox, InboxSender, SnapshotSink, SnapshotSource, Transport, TransportError};
