//! Single-member configuration changes: promotion and leader removal.

mod common;

use std::time::Duration;

use common::test_cluster::TestCluster;
use quorum_engine::client::{decode_result, encode_args};
use quorum_engine::foundation::MemberRole;
use quorum_engine::raft::ConfigurationChange;
use quorum_engine::{PartitionId, PartitionRef, RaftRole};

#[tracing_test::traced_test]
#[tokio::test]
async fn promote_standby_then_remove_leader() {
    // Four nodes, three voters: the fourth starts as a reserve standby.
    let mut cluster = TestCluster::builder(4).group("data", 1, 3).start().await;
    let partition = PartitionRef::new("data", PartitionId::new(0));
    let leader = cluster
        .wait_for_leader(&partition, Duration::from_secs(10))
        .await;

    let mut standby = None;
    for id in cluster.ids() {
        if let Some(status) = cluster.status(&id, &partition).await {
            if status.role == RaftRole::Reserve {
                standby = Some(id);
            }
        }
    }
    let standby = standby.expect("one reserve standby");

    let client_node = cluster
        .ids()
        .into_iter()
        .find(|id| id != &leader && id != &standby)
        .expect("a voter that is not the leader");
    let client = cluster.client(&client_node).clone();

    let session = client
        .open_session("data", "hits", "counter", None)
        .await
        .expect("session opens");
    for _ in 0..5 {
        session
            .submit("increment", encode_args(&1i64).unwrap())
            .await
            .expect("increment applies");
    }

    // Promote the standby to a voter: a single-member change, committed
    // under the new 3-of-4 majority.
    client
        .reconfigure(
            &partition,
            ConfigurationChange::Promote {
                node: standby.clone(),
                role: MemberRole::Active,
            },
        )
        .await
        .expect("promotion commits");

    let status = cluster
        .wait_for_status(&leader, &partition, Duration::from_secs(5), |status| {
            status.configuration.voter_count() == 4
        })
        .await;
    assert!(status.configuration.is_voter(&standby));

    // Writes still commit with the widened quorum.
    let out = session
        .submit("increment", encode_args(&1i64).unwrap())
        .await
        .expect("write under 4 voters");
    let value: i64 = decode_result(&out).unwrap();
    assert_eq!(value, 6);

    // Remove the sitting leader. It commits the change through the new
    // majority, steps down, and the rest elect a successor.
    client
        .reconfigure(
            &partition,
            ConfigurationChange::Remove {
                node: leader.clone(),
            },
        )
        .await
        .expect("removal commits");

    cluster
        .wait_for_status(&leader, &partition, Duration::from_secs(10), |status| {
            status.role != RaftRole::Leader
        })
        .await;

    let new_leader = loop {
        let candidate = cluster
            .wait_for_leader(&partition, Duration::from_secs(10))
            .await;
        if candidate != leader {
            break candidate;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_ne!(new_leader, leader);

    // No committed entries were lost across the change.
    let out = session
        .submit("increment", encode_args(&1i64).unwrap())
        .await
        .expect("write after leader removal");
    let value: i64 = decode_result(&out).unwrap();
    assert_eq!(value, 7);

    cluster.stop_all().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn second_change_waits_for_the_first() {
    let mut cluster = TestCluster::builder(4).group("data", 1, 3).start().await;
    let partition = PartitionRef::new("data", PartitionId::new(0));
    let leader = cluster
        .wait_for_leader(&partition, Duration::from_secs(10))
        .await;
    let client = cluster.client(&leader).clone();

    let mut standby = None;
    for id in cluster.ids() {
        if let Some(status) = cluster.status(&id, &partition).await {
            if status.role == RaftRole::Reserve {
                standby = Some(id);
            }
        }
    }
    let standby = standby.expect("one reserve standby");

    // Changes are single-member and serialized; each must commit before
    // the next is accepted, so issuing them back-to-back succeeds while
    // never widening the quorum by more than one at a time.
    client
        .reconfigure(
            &partition,
            ConfigurationChange::Promote {
                node: standby.clone(),
                role: MemberRole::Passive,
            },
        )
        .await
        .expect("first change commits");
    client
        .reconfigure(
            &partition,
            ConfigurationChange::Promote {
                node: standby.clone(),
                role: MemberRole::Active,
            },
        )
        .await
        .expect("second change commits after the first");

    let status = cluster
        .wait_for_status(&leader, &partition, Duration::from_secs(5), |status| {
            status.configuration.voter_count() == 4
        })
        .await;
    assert!(status.configuration.is_voter(&standby));

    cluster.stop_all().await;
}
