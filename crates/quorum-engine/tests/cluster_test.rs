//! Steady-state writes and leader failover.

mod common;

use std::time::Duration;

use common::test_cluster::TestCluster;
use quorum_engine::client::{decode_result, encode_args};
use quorum_engine::{ConsistencyLevel, PartitionId, PartitionRef, RaftRole};

#[tracing_test::traced_test]
#[tokio::test]
async fn counter_survives_leader_failure() {
    let mut cluster = TestCluster::builder(3).group("data", 1, 3).start().await;
    let partition = PartitionRef::new("data", PartitionId::new(0));

    let leader = cluster
        .wait_for_leader(&partition, Duration::from_secs(10))
        .await;

    // Drive everything through a node that is not the leader, so killing
    // the leader leaves the client alive.
    let client_node = cluster
        .ids()
        .into_iter()
        .find(|id| id != &leader)
        .expect("a non-leader node exists");
    let client = cluster.client(&client_node);

    let session = client
        .open_session("data", "hits", "counter", None)
        .await
        .expect("session opens");

    let mut last = 0i64;
    for _ in 0..100 {
        let out = session
            .submit("increment", encode_args(&1i64).unwrap())
            .await
            .expect("increment applies");
        last = decode_result(&out).unwrap();
    }
    assert_eq!(last, 100);

    let out = session
        .query("get", encode_args(&()).unwrap(), ConsistencyLevel::Linearizable)
        .await
        .expect("linearizable read");
    let value: i64 = decode_result(&out).unwrap();
    assert_eq!(value, 100);

    // Kill the leader; a new one must take over and the same session must
    // keep working against it.
    cluster.stop_node(&leader).await;
    let new_leader = cluster
        .wait_for_leader(&partition, Duration::from_secs(10))
        .await;
    assert_ne!(new_leader, leader);

    for _ in 0..100 {
        let out = session
            .submit("increment", encode_args(&1i64).unwrap())
            .await
            .expect("increment applies after failover");
        last = decode_result(&out).unwrap();
    }
    assert_eq!(last, 200);

    let out = session
        .query("get", encode_args(&()).unwrap(), ConsistencyLevel::Linearizable)
        .await
        .expect("linearizable read after failover");
    let value: i64 = decode_result(&out).unwrap();
    assert_eq!(value, 200);

    cluster.stop_all().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn terms_increase_across_elections() {
    let mut cluster = TestCluster::builder(3).group("data", 1, 3).start().await;
    let partition = PartitionRef::new("data", PartitionId::new(0));

    let leader = cluster
        .wait_for_leader(&partition, Duration::from_secs(10))
        .await;
    let initial_term = cluster
        .status(&leader, &partition)
        .await
        .expect("leader status")
        .term;

    cluster.stop_node(&leader).await;
    let new_leader = cluster
        .wait_for_leader(&partition, Duration::from_secs(10))
        .await;
    let new_term = cluster
        .status(&new_leader, &partition)
        .await
        .expect("new leader status")
        .term;
    assert!(new_term > initial_term, "election must advance the term");

    // Election safety: exactly one replica believes it leads this term.
    let mut leaders = 0;
    for id in cluster.running() {
        if let Some(status) = cluster.status(&id, &partition).await {
            if status.role == RaftRole::Leader && status.term == new_term {
                leaders += 1;
            }
        }
    }
    assert_eq!(leaders, 1);

    cluster.stop_all().await;
}
