//! Cluster voting membership and quorum rules.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::messages::NodeId;

/// Immutable set of voting members. The engine holds one live reference to
/// the current topology; replacement is atomic (the whole value is swapped).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    members: BTreeSet<NodeId>,
}

impl Topology {
    pub fn new(members: impl IntoIterator<Item = NodeId>) -> Self {
        Topology { members: members.into_iter().collect() }
    }

    pub fn members(&self) -> impl Iterator<Item = &NodeId> {
        self.members.iter()
    }

    pub fn member_set(&self) -> &BTreeSet<NodeId> {
        &self.members
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Majority size: `members / 2 + 1`.
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// True when `acks` intersected with the member set reaches quorum.
    /// Non-member acks never count.
    pub fn has_quorum(&self, acks: &HashSet<NodeId>) -> bool {
        let in_members = acks.iter().filter(|id| self.members.contains(*id)).count();
        in_members >= self.quorum_size()
    }

    /// A copy of this topology with `id` added to the voting set.
    pub fn with_member(&self, id: &str) -> Topology {
        let mut members = self.members.clone();
        members.insert(id.to_string());
        Topology { members }
    }

    /// A copy of this topology with `id` removed from the voting set.
    pub fn without_member(&self, id: &str) -> Topology {
        let mut members = self.members.clone();
        members.remove(id);
        Topology { members }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology(names: &[&str]) -> Topology {
        Topology::new(names.iter().map(|s| s.to_string()))
    }

    fn acks(names: &[&str]) -> HashSet<NodeId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_quorum_sizes() {
        assert_eq!(topology(&["a"]).quorum_size(), 1);
        assert_eq!(topology(&["a", "b"]).quorum_size(), 2);
        assert_eq!(topology(&["a", "b", "c"]).quorum_size(), 2);
        assert_eq!(topology(&["a", "b", "c", "d"]).quorum_size(), 3);
        assert_eq!(topology(&["a", "b", "c", "d", "e"]).quorum_size(), 3);
    }

    #[test]
    fn test_has_quorum() {
        let t = topology(&["a", "b", "c"]);
        assert!(!t.has_quorum(&acks(&["a"])));
        assert!(t.has_quorum(&acks(&["a", "b"])));
        assert!(t.has_quorum(&acks(&["a", "b", "c"])));
    }

    #[test]
    fn test_non_members_never_count_toward_quorum() {
        let t = topology(&["a", "b", "c"]);
        assert!(!t.has_quorum(&acks(&["a", "x", "y", "z"])));
    }

    #[test]
    fn test_with_and_without_member_do_not_mutate() {
        let t = topology(&["a", "b", "c"]);
        let bigger = t.with_member("d");
        let smaller = t.without_member("c");

        assert_eq!(t.len(), 3);
        assert_eq!(bigger.len(), 4);
        assert!(bigger.contains("d"));
        assert_eq!(smaller.len(), 2);
        assert!(!smaller.contains("c"));
    }

    #[test]
    fn test_empty_topology_has_no_reachable_quorum() {
        let t = topology(&[]);
        // Quorum size is 1 but no ack set can intersect an empty member set.
        assert!(!t.has_quorum(&acks(&["a", "b"])));
    }
}
