mod common;

use std::time::Duration;

use common::*;
use eventshard::prelude::*;

fn failure_kind(err: ClusterError) -> FailureKind {
    match err {
        ClusterError::DeliveryFailed { kind, .. } => kind,
        other => panic!("expected DeliveryFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn persist_failure_fails_only_that_command() {
    let cluster = hello_cluster(1, ShardingConfig::default()).await;
    let world = cluster.sharding().entity_ref_for(&hello_key(), "world-1");
    greet(&world, "alice").await.unwrap();

    cluster.journal().fail_next_appends(1);
    let err = greet(&world, "bob").await.unwrap_err();
    assert_eq!(failure_kind(err), FailureKind::Persist);

    assert_eq!(greet(&world, "bob").await.unwrap().number_of_people, 2);
    assert_eq!(journal_sequence(&cluster, &world), vec![1, 2]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn exhausted_recovery_is_reported_and_next_activation_succeeds() {
    let config = ShardingConfig {
        entity_recovery_max_retries: 1,
        entity_recovery_initial_backoff: Duration::from_millis(5),
        entity_recovery_max_backoff: Duration::from_millis(10),
        ..ShardingConfig::default()
    };
    let cluster = hello_cluster(1, config).await;
    let world = cluster.sharding().entity_ref_for(&hello_key(), "world-1");

    cluster.journal().fail_next_reads(100);
    let err = greet(&world, "alice").await.unwrap_err();
    assert_eq!(failure_kind(err), FailureKind::Recovery);

    cluster.journal().fail_next_reads(0);
    assert_eq!(greet(&world, "alice").await.unwrap().number_of_people, 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn transient_read_failure_is_retried() {
    let config = ShardingConfig {
        entity_recovery_initial_backoff: Duration::from_millis(5),
        ..ShardingConfig::default()
    };
    let cluster = hello_cluster(1, config).await;
    let world = cluster.sharding().entity_ref_for(&hello_key(), "world-1");

    cluster.journal().fail_next_reads(1);
    assert_eq!(greet(&world, "alice").await.unwrap().number_of_people, 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn second_writer_is_detected_and_entity_restarts_from_journal() {
    let cluster = hello_cluster(1, ShardingConfig::default()).await;
    let world = cluster.sharding().entity_ref_for(&hello_key(), "world-1");
    greet(&world, "alice").await.unwrap();

    let foreign = rmp_serde::to_vec(&Event::Greeted {
        whom: "mallory".into(),
    })
    .unwrap();
    cluster
        .journal()
        .inject_event(&world.address().persistence_id(), foreign);

    let err = greet(&world, "bob").await.unwrap_err();
    assert_eq!(failure_kind(err), FailureKind::ConsistencyViolation);

    // The next incarnation sees the foreign event.
    assert_eq!(greet(&world, "bob").await.unwrap().number_of_people, 3);
    assert_eq!(journal_sequence(&cluster, &world), vec![1, 2, 3]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn unreachable_owner_surfaces_routing_failure() {
    let config = ShardingConfig {
        send_retry_count: 2,
        send_retry_interval: Duration::from_millis(10),
        ..ShardingConfig::default()
    };
    let cluster = hello_cluster(2, config).await;
    let nodes = cluster.node_addresses();
    let world = cluster.sharding().entity_ref_for(&hello_key(), "world-1");
    greet(&world, "alice").await.unwrap();
    let owner = cluster.coordinator().allocations().await[&world.address().shard_id].clone();
    let other = nodes.iter().find(|n| **n != owner).unwrap().clone();
    let world = cluster
        .node(&other)
        .unwrap()
        .entity_ref_for(&hello_key(), "world-1");

    cluster.transport().disconnect(&owner);
    let err = greet(&world, "bob").await.unwrap_err();
    assert_eq!(failure_kind(err), FailureKind::Routing);

    cluster.transport().reconnect(&owner);
    assert_eq!(greet(&world, "bob").await.unwrap().number_of_people, 2);
    cluster.shutdown().await;
}
