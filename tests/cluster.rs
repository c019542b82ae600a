//! End-to-end cluster scenarios over the in-memory network.

use std::time::Duration;

use skiff::state_machine::DictionaryCommand;
use skiff::testing::{eventually, TestCluster};
use skiff::{RaftError, RoleKind};

const LEADER_WAIT: Duration = Duration::from_secs(5);
const CONVERGE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn single_node_cluster_commits_immediately() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.wait_for_leader(LEADER_WAIT).await;
    assert_eq!(leader, "n1");

    let index = cluster
        .handle(&leader)
        .append(DictionaryCommand::set("a", 1).encode())
        .await
        .unwrap();
    // Index 1 is the election no-op appended by the new leader.
    assert_eq!(index, 2);

    let status = cluster.status(&leader).await.unwrap();
    assert_eq!(status.term, 1);
    assert_eq!(status.commit_index, 2);
    assert_eq!(status.last_applied, 2);
    assert_eq!(cluster.machine(&leader).lock().get("a"), Some(1));

    cluster.shutdown().await;
}

#[tokio::test]
async fn three_node_cluster_elects_exactly_one_leader() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader(LEADER_WAIT).await;

    // Once a leader holds steady, nobody else claims the role.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut leaders = Vec::new();
    for id in cluster.ids() {
        let status = cluster.status(&id).await.unwrap();
        if status.role == RoleKind::Leader {
            leaders.push((id, status.term));
        }
    }
    assert_eq!(leaders.len(), 1, "multiple live leaders: {leaders:?}");
    assert_eq!(leaders[0].0, leader);

    cluster.shutdown().await;
}

#[tokio::test]
async fn committed_command_reaches_every_state_machine() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader(LEADER_WAIT).await;

    cluster
        .handle(&leader)
        .append(DictionaryCommand::set("x", 42).encode())
        .await
        .unwrap();

    let machines: Vec<_> = cluster.ids().iter().map(|id| cluster.machine(id)).collect();
    eventually(CONVERGE, || {
        machines.iter().all(|machine| machine.lock().get("x") == Some(42))
    })
    .await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn append_on_follower_is_redirected() {
    let cluster = TestCluster::new(3).await;
    let _leader = cluster.wait_for_leader(LEADER_WAIT).await;

    let follower = cluster.find_follower().await.expect("a follower exists");
    let result = cluster
        .handle(&follower)
        .append(DictionaryCommand::set("a", 1).encode())
        .await;

    match result {
        Err(RaftError::NotLeader { .. }) => {}
        other => panic!("expected NotLeader, got {other:?}"),
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn leader_failure_elects_replacement_and_converges() {
    let cluster = TestCluster::new(3).await;
    let old_leader = cluster.wait_for_leader(LEADER_WAIT).await;

    cluster
        .handle(&old_leader)
        .append(DictionaryCommand::set("k", 1).encode())
        .await
        .unwrap();
    let machines: Vec<_> = cluster.ids().iter().map(|id| cluster.machine(id)).collect();
    eventually(CONVERGE, || {
        machines.iter().all(|machine| machine.lock().get("k") == Some(1))
    })
    .await;

    // Cut the leader off; the survivors elect a replacement.
    cluster.isolate(&old_leader);
    let survivors: Vec<_> = cluster.ids().into_iter().filter(|id| id != &old_leader).collect();
    let new_leader = cluster.wait_for_leader_among(&survivors, LEADER_WAIT).await;
    assert_ne!(new_leader, old_leader);

    let old_term = cluster.status(&old_leader).await.unwrap().term;
    let new_term = cluster.status(&new_leader).await.unwrap().term;
    assert!(new_term > old_term, "replacement must hold a later term");

    // Majority partition keeps accepting writes.
    cluster
        .handle(&new_leader)
        .append(DictionaryCommand::set("k", 2).encode())
        .await
        .unwrap();

    // Heal: the deposed leader discovers the later term, reverts to
    // follower, and converges on the new value.
    cluster.rejoin(&old_leader);
    let old_machine = cluster.machine(&old_leader);
    eventually(CONVERGE, || old_machine.lock().get("k") == Some(2)).await;

    let status = cluster.status(&old_leader).await.unwrap();
    assert_eq!(status.role, RoleKind::Follower);
    assert!(status.term >= new_term);

    cluster.shutdown().await;
}

#[tokio::test]
async fn commands_apply_in_submission_order() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader(LEADER_WAIT).await;

    for value in 1..=10 {
        cluster
            .handle(&leader)
            .append(DictionaryCommand::set("seq", value).encode())
            .await
            .unwrap();
    }

    let machines: Vec<_> = cluster.ids().iter().map(|id| cluster.machine(id)).collect();
    eventually(CONVERGE, || {
        machines.iter().all(|machine| machine.lock().get("seq") == Some(10))
    })
    .await;

    cluster.shutdown().await;
}
