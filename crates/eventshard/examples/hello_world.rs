//! Three in-process nodes greeting people through one sharded entity.
//!
//! Run with `RUST_LOG=eventshard=debug cargo run --example hello_world`.

use std::collections::BTreeSet;
use std::time::Duration;

use eventshard::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
enum Command {
    Greet {
        whom: String,
        reply_to: ReplyTo<Greeting>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    whom: String,
    number_of_people: usize,
}

#[derive(Debug, Serialize, Deserialize)]
enum Event {
    Greeted { whom: String },
}

struct HelloWorld;

impl PersistentEntity for HelloWorld {
    type Command = Command;
    type Event = Event;
    type State = BTreeSet<String>;

    fn empty_state(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn handle_command(
        &self,
        _state: &BTreeSet<String>,
        command: Command,
    ) -> Effect<Event, BTreeSet<String>> {
        let Command::Greet { whom, reply_to } = command;
        Effect::persist(Event::Greeted { whom: whom.clone() }).then_reply(
            &reply_to,
            move |known: &BTreeSet<String>| Greeting {
                whom,
                number_of_people: known.len(),
            },
        )
    }

    fn apply_event(&self, mut known: BTreeSet<String>, event: &Event) -> BTreeSet<String> {
        let Event::Greeted { whom } = event;
        known.insert(whom.clone());
        known
    }
}

#[tokio::main]
async fn main() -> Result<(), ClusterError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let key = EntityTypeKey::<HelloWorld>::new("HelloWorld");
    let cluster = TestCluster::with_nodes(3).await;
    cluster.register(&key, |_| HelloWorld, PassivationPolicy::Default)?;

    for (node, whom) in cluster.node_addresses().iter().zip(["alice", "bob", "alice"]) {
        let Some(sharding) = cluster.node(node) else {
            continue;
        };
        let world = sharding.entity_ref_for(&key, "world-1");
        let greeting = world
            .ask(
                |reply_to| Command::Greet {
                    whom: whom.to_string(),
                    reply_to,
                },
                Duration::from_secs(3),
            )
            .await?;
        println!(
            "{node} -> hello {}! I know {} people",
            greeting.whom, greeting.number_of_people
        );
    }

    cluster.shutdown().await;
    Ok(())
}
