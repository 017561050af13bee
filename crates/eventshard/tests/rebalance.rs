mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use eventshard::prelude::*;

fn two_node_config() -> ShardingConfig {
    ShardingConfig {
        number_of_shards: 8,
        ..ShardingConfig::default()
    }
}

#[tokio::test]
async fn graceful_leave_moves_shard_and_delivers_buffered_messages() {
    let cluster = Arc::new(hello_cluster(2, two_node_config()).await);
    let nodes = cluster.node_addresses();

    let world = cluster.sharding().entity_ref_for(&hello_key(), "world-1");
    greet(&world, "alice").await.unwrap();
    let shard = world.address().shard_id;
    let owner = cluster.coordinator().allocations().await[&shard].clone();
    let survivor = nodes.iter().find(|n| **n != owner).unwrap().clone();
    let survivor_sharding = cluster.node(&survivor).unwrap();
    let world = survivor_sharding.entity_ref_for(&hello_key(), "world-1");

    // Keep commands in flight on the old owner while it drains.
    cluster
        .journal()
        .set_append_delay(Some(Duration::from_millis(100)));

    let mut asks = Vec::new();
    for i in 0..5 {
        let world = world.clone();
        asks.push(tokio::spawn(async move {
            greet(&world, &format!("early-{i}")).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let leave = {
        let cluster = Arc::clone(&cluster);
        let owner = owner.clone();
        tokio::spawn(async move { cluster.remove_node(&owner).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut late = Vec::new();
    for i in 0..5 {
        let world = world.clone();
        late.push(tokio::spawn(async move {
            greet(&world, &format!("late-{i}")).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(survivor_sharding.region().buffered_shards().contains(&shard));
    assert!(late.iter().all(|ask| !ask.is_finished()));

    leave.await.unwrap().unwrap();

    let mut counts = BTreeSet::new();
    for ask in asks.into_iter().chain(late) {
        let greeting = ask.await.unwrap().unwrap();
        assert!(counts.insert(greeting.number_of_people));
    }
    assert_eq!(counts, (2..=11).collect::<BTreeSet<usize>>());

    assert_eq!(cluster.coordinator().allocations().await[&shard], survivor);
    assert!(survivor_sharding.region().hosted_shards().contains(&shard));
    assert!(survivor_sharding.region().buffered_shards().is_empty());

    let sequence = journal_sequence(&cluster, &world);
    assert_eq!(sequence, (1..=11).collect::<Vec<u64>>());
    cluster.shutdown().await;
}

#[tokio::test]
async fn crashed_node_shards_recover_on_survivor() {
    let cluster = hello_cluster(2, two_node_config()).await;
    let nodes = cluster.node_addresses();

    let world = cluster.sharding().entity_ref_for(&hello_key(), "world-1");
    greet(&world, "alice").await.unwrap();
    greet(&world, "bob").await.unwrap();
    let shard = world.address().shard_id;
    let owner = cluster.coordinator().allocations().await[&shard].clone();
    let survivor = nodes.iter().find(|n| **n != owner).unwrap().clone();

    cluster.crash_node(&owner).await.unwrap();

    let world = cluster
        .node(&survivor)
        .unwrap()
        .entity_ref_for(&hello_key(), "world-1");
    assert_eq!(greet(&world, "carol").await.unwrap().number_of_people, 3);
    assert_eq!(cluster.coordinator().allocations().await[&shard], survivor);
    assert_eq!(journal_sequence(&cluster, &world), vec![1, 2, 3]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn joining_node_takes_over_shards_and_state_follows() {
    let cluster = hello_cluster(1, two_node_config()).await;
    let sharding = cluster.sharding();
    let ids: Vec<String> = (0..20).map(|i| format!("world-{i}")).collect();
    for id in &ids {
        let world = sharding.entity_ref_for(&hello_key(), id.as_str());
        greet(&world, "alice").await.unwrap();
    }
    let first = cluster.node_addresses()[0].clone();
    assert!(cluster
        .coordinator()
        .allocations()
        .await
        .values()
        .all(|owner| *owner == first));

    let joined = cluster.add_node().await.unwrap();

    let allocations = cluster.coordinator().allocations().await;
    let on_first = allocations.values().filter(|n| **n == first).count();
    let on_joined = allocations.values().filter(|n| **n == joined).count();
    assert_eq!(on_first + on_joined, allocations.len());
    assert!(on_joined > 0);
    assert!(on_first.abs_diff(on_joined) <= 1, "{on_first} vs {on_joined}");

    let joined_region = cluster.node(&joined).unwrap().region().clone();
    for (shard, owner) in &allocations {
        if *owner == joined {
            assert!(joined_region.hosted_shards().contains(shard));
        }
    }

    for id in &ids {
        let world = sharding.entity_ref_for(&hello_key(), id.as_str());
        assert_eq!(greet(&world, "bob").await.unwrap().number_of_people, 2);
    }
    cluster.shutdown().await;
}
