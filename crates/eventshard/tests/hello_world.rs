mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use eventshard::entity::EntityContext;
use eventshard::entity_runtime::EntityRuntime;
use eventshard::metrics::ShardingMetrics;
use eventshard::prelude::*;

#[tokio::test]
async fn greeting_counts_distinct_people() {
    let cluster = hello_cluster(1, ShardingConfig::default()).await;
    let world = cluster.sharding().entity_ref_for(&hello_key(), "world-1");

    let alice = greet(&world, "alice").await.unwrap();
    assert_eq!(alice.whom, "alice");
    assert_eq!(alice.number_of_people, 1);
    assert_eq!(greet(&world, "bob").await.unwrap().number_of_people, 2);
    assert_eq!(greet(&world, "alice").await.unwrap().number_of_people, 2);

    assert_eq!(journal_sequence(&cluster, &world), vec![1, 2, 3]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn entities_are_independent() {
    let cluster = hello_cluster(1, ShardingConfig::default()).await;
    let sharding = cluster.sharding();
    let first = sharding.entity_ref_for(&hello_key(), "world-1");
    let second = sharding.entity_ref_for(&hello_key(), "world-2");

    greet(&first, "alice").await.unwrap();
    greet(&first, "bob").await.unwrap();
    assert_eq!(greet(&second, "carol").await.unwrap().number_of_people, 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn state_survives_passivation() {
    let cluster = hello_cluster(1, ShardingConfig::default()).await;
    let sharding = cluster.sharding();
    let world = sharding.entity_ref_for(&hello_key(), "world-1");

    greet(&world, "alice").await.unwrap();
    greet(&world, "bob").await.unwrap();
    world.tell(Command::Passivate).await.unwrap();

    // Queued behind the stop, so it lands on a fresh incarnation.
    assert_eq!(greet(&world, "carol").await.unwrap().number_of_people, 3);

    let metrics = sharding.region().metrics();
    assert_eq!(metrics.passivations.get(), 1);
    assert_eq!(metrics.recoveries.get(), 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn passivated_entity_replays_its_journal_on_the_next_greeting() {
    let cluster = hello_cluster(1, ShardingConfig::default()).await;
    let sharding = cluster.sharding();
    let region = sharding.region();
    let world = sharding.entity_ref_for(&hello_key(), "world-1");

    assert_eq!(greet(&world, "alice").await.unwrap().number_of_people, 1);
    assert_eq!(greet(&world, "bob").await.unwrap().number_of_people, 2);
    assert_eq!(journal_sequence(&cluster, &world), vec![1, 2]);

    world.tell(Command::Passivate).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !region.active_entities().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("entity was not passivated");
    assert_eq!(region.metrics().passivations.get(), 1);

    let again = greet(&world, "alice").await.unwrap();
    assert_eq!(again.whom, "alice");
    assert_eq!(again.number_of_people, 2);
    assert_eq!(journal_sequence(&cluster, &world), vec![1, 2, 3]);
    assert_eq!(region.metrics().recoveries.get(), 2);
    assert_eq!(region.active_entities().await, vec![world.address()]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn any_node_reaches_the_same_entity() {
    let cluster = hello_cluster(3, ShardingConfig::default()).await;
    let nodes = cluster.node_addresses();

    let mut last = 0;
    for (node, whom) in nodes.iter().zip(["alice", "bob", "carol"]) {
        let world = cluster
            .node(node)
            .unwrap()
            .entity_ref_for(&hello_key(), "world-1");
        last = greet(&world, whom).await.unwrap().number_of_people;
    }
    assert_eq!(last, 3);

    let hosting: Vec<_> = {
        let mut hosting = Vec::new();
        for node in &nodes {
            let active = cluster.node(node).unwrap().region().active_entities().await;
            if !active.is_empty() {
                hosting.push(node.clone());
            }
        }
        hosting
    };
    assert_eq!(hosting.len(), 1, "exactly one node hosts the entity");
    cluster.shutdown().await;
}

#[tokio::test]
async fn shard_id_is_the_same_on_every_node() {
    let cluster = hello_cluster(3, ShardingConfig::default()).await;
    let addresses: BTreeSet<_> = cluster
        .node_addresses()
        .iter()
        .map(|node| {
            cluster
                .node(node)
                .unwrap()
                .entity_ref_for(&hello_key(), "world-1")
                .address()
        })
        .collect();
    assert_eq!(addresses.len(), 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn replaying_the_journal_twice_yields_the_same_state() {
    let cluster = hello_cluster(1, ShardingConfig::default()).await;
    let world = cluster.sharding().entity_ref_for(&hello_key(), "world-1");
    for whom in ["alice", "bob", "alice", "dave"] {
        greet(&world, whom).await.unwrap();
    }

    let address = world.address();
    let ctx = EntityContext {
        persistence_id: address.persistence_id(),
        address,
        node: NodeAddress::new("127.0.0.1", 9000),
    };
    let journal: Arc<dyn eventshard::journal::EventJournal> = cluster.journal().clone();
    let metrics = Arc::new(ShardingMetrics::unregistered());

    let first = EntityRuntime::recover(HelloWorld, ctx.clone(), journal.clone(), metrics.clone())
        .await
        .unwrap();
    let second = EntityRuntime::recover(HelloWorld, ctx, journal, metrics)
        .await
        .unwrap();

    let expected: BTreeSet<String> = ["alice", "bob", "dave"].map(String::from).into();
    assert_eq!(first.state().unwrap().names, expected);
    assert_eq!(first.state(), second.state());
    cluster.shutdown().await;
}
