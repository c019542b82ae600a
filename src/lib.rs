//! Skiff - an embeddable Raft consensus engine.
//!
//! The engine replicates an ordered log of opaque commands across a cluster
//! and applies committed commands to a host-supplied state machine, in the
//! same order on every non-faulty node. The host wires up three seams:
//! a [`state_machine::StateMachine`], a [`transport::Transport`] (plus its
//! [`transport::Inbox`] receive half), and a [`storage::PersistentStore`].

pub mod core;
pub mod state_machine;
pub mod storage;
pub mod transport;

/// Testing utilities for integration tests.
pub mod testing;

pub use crate::core::config::EngineConfig;
pub use crate::core::events::Event;
pub use crate::core::messages::{EntryFlags, LogEntry, Message, NodeId};
pub use crate::core::roles::RoleKind;
pub use crate::core::server::{RaftError, RaftHandle, RaftServer, Status};
pub use crate::core::topology::Topology;
