//! Management group: the cluster-wide primitive directory.

mod common;

use std::time::Duration;

use common::test_cluster::TestCluster;
use quorum_engine::config::MANAGEMENT_GROUP;
use quorum_engine::service::PrimitiveRecord;
use quorum_engine::{PartitionId, PartitionRef};

#[tracing_test::traced_test]
#[tokio::test]
async fn directory_registers_and_resolves_primitives() {
    let mut cluster = TestCluster::builder(3).group("data", 4, 3).start().await;
    let management = PartitionRef::new(MANAGEMENT_GROUP, PartitionId::new(0));
    cluster
        .wait_for_leader(&management, Duration::from_secs(10))
        .await;

    let ids = cluster.ids();
    let client = cluster.client(&ids[0]);

    let record = PrimitiveRecord {
        group: "data".to_string(),
        partition: client
            .partition_for("data", "work-queue")
            .unwrap()
            .partition
            .value(),
        service_type: "map".to_string(),
    };
    let registered = client
        .register_primitive("work-queue", record.clone())
        .await
        .expect("registration commits");
    assert_eq!(registered, record);

    // A conflicting registration from another node loses: first write
    // wins and the original record is returned.
    let other = cluster.client(&ids[1]);
    let conflicting = PrimitiveRecord {
        group: "data".to_string(),
        partition: 0,
        service_type: "counter".to_string(),
    };
    let resolved = other
        .register_primitive("work-queue", conflicting)
        .await
        .expect("conflicting registration resolves");
    assert_eq!(resolved, record);

    let looked_up = other
        .lookup_primitive("work-queue")
        .await
        .expect("lookup succeeds")
        .expect("record present");
    assert_eq!(looked_up, record);

    assert!(other
        .lookup_primitive("missing")
        .await
        .expect("lookup succeeds")
        .is_none());

    cluster.stop_all().await;
}
