//! Engine configuration parameters

use std::time::Duration;

use crate::core::messages::NodeId;

/// Hard ceiling on the leader heartbeat period.
const MAX_HEARTBEAT_PERIOD: Duration = Duration::from_millis(250);

/// Configuration for a single engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Node identity; must be unique within the cluster.
    pub name: NodeId,
    /// Base election timeout (default: 300ms). Followers wait a uniform
    /// draw from `[election_timeout, 2*election_timeout)` before starting
    /// an election; candidates re-draw from `[election_timeout/2, election_timeout)`.
    pub election_timeout: Duration,
    /// Leader heartbeat period budget (default: 150ms). The effective
    /// period is capped at `election_timeout / 6` and at 250ms.
    pub heartbeat_timeout: Duration,
    /// Maximum number of log entries shipped in one AppendEntries (default: 64).
    pub max_entries_per_request: u64,
    /// Number of committed entries retained before a snapshot is taken and
    /// the log compacted (default: 1000). Set to 0 to disable compaction.
    pub max_log_length_before_compaction: u64,
    /// If true, the initial topology is built from `all_voting_nodes` even
    /// when a topology has been persisted.
    pub force_new_topology: bool,
    /// Bootstrap voting set, used when no topology has been persisted
    /// (or always, under `force_new_topology`).
    pub all_voting_nodes: Vec<NodeId>,
}

impl EngineConfig {
    /// Create a config for the named node with the given bootstrap voting set.
    pub fn new(name: impl Into<NodeId>, all_voting_nodes: Vec<NodeId>) -> Self {
        EngineConfig {
            name: name.into(),
            election_timeout: Duration::from_millis(300),
            heartbeat_timeout: Duration::from_millis(150),
            max_entries_per_request: 64,
            max_log_length_before_compaction: 1000,
            force_new_topology: false,
            all_voting_nodes,
        }
    }

    /// Set the base election timeout.
    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    /// Set the heartbeat period budget.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the AppendEntries batch cap.
    pub fn with_max_entries_per_request(mut self, max: u64) -> Self {
        self.max_entries_per_request = max;
        self
    }

    /// Set the committed-entries threshold that triggers snapshot compaction.
    /// Set to 0 to disable automatic snapshots.
    pub fn with_compaction_threshold(mut self, threshold: u64) -> Self {
        self.max_log_length_before_compaction = threshold;
        self
    }

    /// Ignore any persisted topology and bootstrap from `all_voting_nodes`.
    pub fn with_force_new_topology(mut self, force: bool) -> Self {
        self.force_new_topology = force;
        self
    }

    /// The heartbeat period actually used by a leader:
    /// `min(heartbeat_timeout, election_timeout / 6, 250ms)`.
    pub fn effective_heartbeat(&self) -> Duration {
        self.heartbeat_timeout
            .min(self.election_timeout / 6)
            .min(MAX_HEARTBEAT_PERIOD)
    }

    /// Draw a follower election timeout, uniform in `[election, 2*election)`.
    pub fn follower_timeout(&self) -> Duration {
        use rand::Rng;
        let base = self.election_timeout.as_millis() as u64;
        let ms = rand::rng().random_range(base..base * 2);
        Duration::from_millis(ms)
    }

    /// Draw a candidate election timeout, uniform in `[election/2, election)`.
    pub fn candidate_timeout(&self) -> Duration {
        use rand::Rng;
        let base = self.election_timeout.as_millis() as u64;
        let ms = rand::rng().random_range(base / 2..base.max(2));
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig::new("n1", vec!["n1".into(), "n2".into(), "n3".into()])
    }

    #[test]
    fn test_defaults() {
        let cfg = config();
        assert_eq!(cfg.name, "n1");
        assert_eq!(cfg.election_timeout, Duration::from_millis(300));
        assert_eq!(cfg.max_entries_per_request, 64);
        assert!(!cfg.force_new_topology);
    }

    #[test]
    fn test_effective_heartbeat_is_capped_by_election_timeout() {
        let cfg = config()
            .with_election_timeout(Duration::from_millis(600))
            .with_heartbeat_timeout(Duration::from_millis(500));
        // 600 / 6 = 100ms wins over both the budget and the 250ms ceiling
        assert_eq!(cfg.effective_heartbeat(), Duration::from_millis(100));
    }

    #[test]
    fn test_effective_heartbeat_hard_ceiling() {
        let cfg = config()
            .with_election_timeout(Duration::from_secs(10))
            .with_heartbeat_timeout(Duration::from_secs(5));
        assert_eq!(cfg.effective_heartbeat(), Duration::from_millis(250));
    }

    #[test]
    fn test_follower_timeout_range() {
        let cfg = config();
        for _ in 0..100 {
            let t = cfg.follower_timeout();
            assert!(t >= Duration::from_millis(300));
            assert!(t < Duration::from_millis(600));
        }
    }

    #[test]
    fn test_candidate_timeout_range() {
        let cfg = config();
        for _ in 0..100 {
            let t = cfg.candidate_timeout();
            assert!(t >= Duration::from_millis(150));
            assert!(t < Duration::from_millis(300));
        }
    }
}
