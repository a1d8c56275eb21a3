//! Session event delivery and ordering.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::test_cluster::TestCluster;
use quorum_engine::client::encode_args;
use quorum_engine::service::{MapEntry, MapEvent};
use quorum_engine::{PartitionId, PartitionRef};

fn put(key: &str, value: &str) -> Bytes {
    encode_args(&MapEntry {
        key: key.to_string(),
        value: Some(Bytes::copy_from_slice(value.as_bytes())),
    })
    .unwrap()
}

fn remove(key: &str) -> Bytes {
    encode_args(&MapEntry {
        key: key.to_string(),
        value: None,
    })
    .unwrap()
}

#[tracing_test::traced_test]
#[tokio::test]
async fn map_events_arrive_in_order_with_increasing_indices() {
    let mut cluster = TestCluster::builder(3).group("data", 1, 3).start().await;
    let partition = PartitionRef::new("data", PartitionId::new(0));
    cluster
        .wait_for_leader(&partition, Duration::from_secs(10))
        .await;

    let ids = cluster.ids();
    let watcher_client = cluster.client(&ids[0]);
    let writer_client = cluster.client(&ids[1]);

    // Both sessions bind to the same primitive and therefore the same
    // partition and service instance.
    let watcher = watcher_client
        .open_session("data", "settings", "map", None)
        .await
        .expect("watcher session");
    let writer = writer_client
        .open_session("data", "settings", "map", None)
        .await
        .expect("writer session");

    let mut events = watcher.events().await;

    writer.submit("put", put("k", "v1")).await.expect("put v1");
    writer.submit("put", put("k", "v2")).await.expect("put v2");
    writer.submit("remove", remove("k")).await.expect("remove");

    let mut frames = Vec::new();
    for _ in 0..3 {
        let frame = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event arrives")
            .expect("stream open");
        frames.push(frame);
    }

    // Indices are strictly increasing and each frame chains to the one
    // before it.
    assert!(frames[0].event_index < frames[1].event_index);
    assert!(frames[1].event_index < frames[2].event_index);
    assert_eq!(frames[1].previous_index, frames[0].event_index);
    assert_eq!(frames[2].previous_index, frames[1].event_index);

    let decoded: Vec<MapEvent> = frames
        .iter()
        .map(|frame| ciborium::de::from_reader(frame.payload.as_ref()).unwrap())
        .collect();
    assert_eq!(
        decoded,
        vec![
            MapEvent::Updated {
                key: "k".to_string(),
                value: Bytes::from("v1")
            },
            MapEvent::Updated {
                key: "k".to_string(),
                value: Bytes::from("v2")
            },
            MapEvent::Removed {
                key: "k".to_string()
            },
        ]
    );

    cluster.stop_all().await;
}
