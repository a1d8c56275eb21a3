//! Session dedup and deterministic expiry.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::test_cluster::TestCluster;
use quorum_engine::client::{decode_result, encode_args};
use quorum_engine::config::SessionConfig;
use quorum_engine::raft::messages::{SubmitOutput, Submission};
use quorum_engine::{ConsistencyLevel, ErrorKind, PartitionId, PartitionRef, SessionId};
use quorum_topology::NodeId;

fn increment_args() -> Bytes {
    encode_args(&1i64).unwrap()
}

async fn open_raw_session(
    cluster: &TestCluster,
    leader: &NodeId,
    partition: &PartitionRef,
    timeout_ms: u64,
) -> SessionId {
    let handle = cluster.replica(leader, partition).expect("leader replica");
    let reply = handle
        .submit(Submission::OpenSession {
            member: leader.clone(),
            primitive: "hits".to_string(),
            service_type: "counter".to_string(),
            timeout_ms,
        })
        .await;
    match reply.result.expect("session opens") {
        SubmitOutput::SessionOpened { session_id, .. } => session_id,
        other => panic!("unexpected output: {other:?}"),
    }
}

async fn submit_command(
    cluster: &TestCluster,
    node: &NodeId,
    partition: &PartitionRef,
    session_id: SessionId,
    sequence: u64,
) -> Result<Bytes, ErrorKind> {
    let handle = cluster.replica(node, partition).expect("replica");
    let reply = handle
        .submit(Submission::Command {
            session_id,
            sequence,
            operation: "increment".to_string(),
            args: increment_args(),
        })
        .await;
    match reply.result {
        Ok(SubmitOutput::CommandResult(bytes)) => Ok(bytes),
        Ok(other) => panic!("unexpected output: {other:?}"),
        Err(detail) => Err(detail.kind),
    }
}

#[tracing_test::traced_test]
#[tokio::test]
async fn retried_sequence_applies_exactly_once() {
    let mut cluster = TestCluster::builder(3).group("data", 1, 3).start().await;
    let partition = PartitionRef::new("data", PartitionId::new(0));
    let leader = cluster
        .wait_for_leader(&partition, Duration::from_secs(10))
        .await;

    let session = open_raw_session(&cluster, &leader, &partition, 30_000).await;

    // First submission applies; the retry with the same sequence must
    // return the cached result without re-running the service.
    let first = submit_command(&cluster, &leader, &partition, session, 1)
        .await
        .expect("first application");
    let retried = submit_command(&cluster, &leader, &partition, session, 1)
        .await
        .expect("retry returns cached result");
    assert_eq!(first, retried);

    let value: i64 = decode_result(&first).unwrap();
    assert_eq!(value, 1, "the counter incremented exactly once");

    // Leader fails before the client hears back; the retry lands on the
    // new leader and still yields the first application's result.
    cluster.stop_node(&leader).await;
    let new_leader = cluster
        .wait_for_leader(&partition, Duration::from_secs(10))
        .await;

    let after_failover = submit_command(&cluster, &new_leader, &partition, session, 1)
        .await
        .expect("retry against the new leader");
    assert_eq!(first, after_failover);

    // The counter is still 1; a fresh sequence moves it to 2.
    let next = submit_command(&cluster, &new_leader, &partition, session, 2)
        .await
        .expect("next sequence applies");
    let value: i64 = decode_result(&next).unwrap();
    assert_eq!(value, 2);

    cluster.stop_all().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn sessions_expire_identically_on_every_replica() {
    let mut cluster = TestCluster::builder(3).group("data", 1, 3).start().await;
    let partition = PartitionRef::new("data", PartitionId::new(0));
    let leader = cluster
        .wait_for_leader(&partition, Duration::from_secs(10))
        .await;

    // A short-lived session with no keep-alives, plus a long-lived one to
    // drive entries through the log.
    let doomed = open_raw_session(&cluster, &leader, &partition, 1_000).await;
    let driver = open_raw_session(&cluster, &leader, &partition, 60_000).await;

    tokio::time::sleep(Duration::from_millis(1_200)).await;

    // The next applied entry carries a timestamp past the deadline and
    // expires the session on every replica at the same log index.
    submit_command(&cluster, &leader, &partition, driver, 1)
        .await
        .expect("driver command applies");

    let err = submit_command(&cluster, &leader, &partition, doomed, 1)
        .await
        .expect_err("expired session rejects commands");
    assert_eq!(err, ErrorKind::ClosedSession);

    // Every replica converges to the same applied state with the session
    // closed.
    let leader_applied = cluster
        .status(&leader, &partition)
        .await
        .expect("leader status")
        .last_applied;
    for id in cluster.running() {
        cluster
            .wait_for_status(&id, &partition, Duration::from_secs(5), |status| {
                status.last_applied >= leader_applied
            })
            .await;
        let handle = cluster.replica(&id, &partition).expect("replica");
        let reply = handle
            .query(
                doomed,
                "get".to_string(),
                Bytes::new(),
                ConsistencyLevel::Eventual,
                0,
            )
            .await;
        let err = reply.result.expect_err("session closed everywhere");
        assert_eq!(err.kind, ErrorKind::ClosedSession);
    }

    cluster.stop_all().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn keep_alives_hold_short_sessions_open() {
    let mut cluster = TestCluster::builder(3)
        .group("data", 1, 3)
        .session(SessionConfig {
            default_timeout: Duration::from_secs(1),
            max_pending_events: 1024,
        })
        .start()
        .await;
    let partition = PartitionRef::new("data", PartitionId::new(0));
    let leader = cluster
        .wait_for_leader(&partition, Duration::from_secs(10))
        .await;
    let client_node = cluster
        .ids()
        .into_iter()
        .find(|id| id != &leader)
        .expect("non-leader");
    let client = cluster.client(&client_node);

    // The handle keep-alives at half the timeout; the session must ride
    // out several timeout windows.
    let session = client
        .open_session("data", "hits", "counter", Some(Duration::from_secs(1)))
        .await
        .expect("session opens");
    tokio::time::sleep(Duration::from_secs(3)).await;

    let out = session
        .submit("increment", increment_args())
        .await
        .expect("session is still alive");
    let value: i64 = decode_result(&out).unwrap();
    assert_eq!(value, 1);

    cluster.stop_all().await;
}
