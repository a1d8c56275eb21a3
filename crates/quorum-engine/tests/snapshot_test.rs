//! Compaction and snapshot catch-up of a lagging follower.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::test_cluster::TestCluster;
use quorum_engine::client::{decode_result, encode_args};
use quorum_engine::config::RaftConfig;
use quorum_engine::{ConsistencyLevel, PartitionId, PartitionRef};

#[tracing_test::traced_test]
#[tokio::test]
async fn restarted_follower_catches_up_from_snapshot() {
    let raft = RaftConfig {
        snapshot_threshold: 16,
        ..RaftConfig::default()
    };
    let mut cluster = TestCluster::builder(3)
        .group("data", 1, 3)
        .raft(raft)
        .start()
        .await;
    let partition = PartitionRef::new("data", PartitionId::new(0));
    let leader = cluster
        .wait_for_leader(&partition, Duration::from_secs(10))
        .await;

    let follower = cluster
        .ids()
        .into_iter()
        .find(|id| id != &leader)
        .expect("a follower exists");
    let client_node = cluster
        .ids()
        .into_iter()
        .find(|id| id != &leader && id != &follower)
        .expect("a third node exists");

    let client = cluster.client(&client_node);
    let session = client
        .open_session("data", "hits", "counter", None)
        .await
        .expect("session opens");

    // Stop the follower, then write enough to trigger compaction on the
    // leader: the follower's log position falls behind the snapshot.
    cluster.stop_node(&follower).await;

    let mut last = 0i64;
    for _ in 0..40 {
        let out = session
            .submit("increment", encode_args(&1i64).unwrap())
            .await
            .expect("increment applies");
        last = decode_result(&out).unwrap();
    }
    assert_eq!(last, 40);

    cluster
        .wait_for_status(&leader, &partition, Duration::from_secs(10), |status| {
            status.first_index > 1
        })
        .await;

    // The restarted follower is too far behind for plain replication; it
    // receives the snapshot and then the remaining tail.
    cluster.restart_node(&follower).await;
    let leader_applied = cluster
        .status(&leader, &partition)
        .await
        .expect("leader status")
        .last_applied;
    cluster
        .wait_for_status(&follower, &partition, Duration::from_secs(15), |status| {
            status.last_applied >= leader_applied
        })
        .await;

    // The follower's state machine equals the leader's, including the
    // session table (the session opened before the snapshot still exists
    // there).
    let handle = cluster
        .replica(&follower, &partition)
        .expect("follower replica");
    let reply = handle
        .query(
            session.session_id(),
            "get".to_string(),
            Bytes::new(),
            ConsistencyLevel::Eventual,
            0,
        )
        .await;
    let out = reply.result.expect("follower serves the session");
    let value: i64 = decode_result(&out).unwrap();
    assert_eq!(value, 40);

    // Replication continues past the snapshot.
    let out = session
        .submit("increment", encode_args(&1i64).unwrap())
        .await
        .expect("post-snapshot write");
    let value: i64 = decode_result(&out).unwrap();
    assert_eq!(value, 41);

    cluster.stop_all().await;
}
