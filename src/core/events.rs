//! Engine event publication.
//!
//! Observers run synchronously on the event-loop thread and must be
//! non-blocking. A panicking observer is logged and swallowed; it can never
//! affect protocol correctness.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;

use crate::core::messages::NodeId;
use crate::core::roles::RoleKind;
use crate::core::topology::Topology;

/// Everything the engine reports to the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The node changed role.
    StateChanged(RoleKind),
    /// The current term advanced.
    NewTerm(u64),
    /// The node became a candidate and solicited votes.
    ElectionStarted,
    /// The node won an election.
    ElectedAsLeader,
    /// The active role's timeout fired.
    StateTimeout,
    /// Entries were persisted to the local log.
    EntriesAppended { first_index: u64, count: u64 },
    /// The commit index advanced.
    CommitIndexChanged { old: u64, new: u64 },
    /// A committed entry was applied.
    CommitApplied { index: u64 },
    /// A membership change was proposed and is awaiting commit.
    TopologyChanging(Topology),
    /// The committed topology changed (or a proposal was rolled back).
    TopologyChanged(Topology),
    /// Snapshot creation started.
    CreatingSnapshot,
    /// Snapshot creation finished and the log was compacted.
    CreatedSnapshot { index: u64, term: u64 },
    /// Snapshot creation failed; the log is left untouched.
    SnapshotCreationError(String),
    /// An inbound snapshot is being drained and applied.
    InstallingSnapshot { index: u64, from: NodeId },
    /// An inbound snapshot replaced local state.
    SnapshotInstalled { index: u64 },
    /// One pass of the event loop finished.
    EventsProcessed,
}

type Observer = Box<dyn Fn(&Event) + Send>;

/// Synchronous publisher over a registered observer list.
pub(crate) struct Observers {
    subscribers: Vec<Observer>,
}

impl Observers {
    pub(crate) fn new() -> Self {
        Observers { subscribers: Vec::new() }
    }

    pub(crate) fn register(&mut self, observer: impl Fn(&Event) + Send + 'static) {
        self.subscribers.push(Box::new(observer));
    }

    pub(crate) fn emit(&self, event: &Event) {
        for subscriber in &self.subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(event))).is_err() {
                warn!(?event, "event observer panicked; ignoring");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_observers_receive_events_in_registration_order() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut observers = Observers::new();

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            observers.register(move |event| {
                seen.lock().push((tag, event.clone()));
            });
        }

        observers.emit(&Event::ElectionStarted);
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "first");
        assert_eq!(seen[1].0, "second");
    }

    #[test]
    fn test_panicking_observer_is_swallowed() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut observers = Observers::new();

        observers.register(|_| panic!("observer bug"));
        let count_clone = Arc::clone(&count);
        observers.register(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        observers.emit(&Event::StateTimeout);
        observers.emit(&Event::StateTimeout);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
