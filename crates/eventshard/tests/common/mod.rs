#![allow(dead_code)]

use std::collections::BTreeSet;
use std::time::Duration;

use eventshard::prelude::*;
use serde::{Deserialize, Serialize};

pub const ASK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
pub enum Command {
    Greet {
        whom: String,
        reply_to: ReplyTo<Greeting>,
    },
    Passivate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    pub whom: String,
    pub number_of_people: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Event {
    Greeted { whom: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownPeople {
    pub names: BTreeSet<String>,
}

/// Greets people and remembers everyone it has greeted.
pub struct HelloWorld;

impl PersistentEntity for HelloWorld {
    type Command = Command;
    type Event = Event;
    type State = KnownPeople;

    fn empty_state(&self) -> KnownPeople {
        KnownPeople::default()
    }

    fn handle_command(&self, _state: &KnownPeople, command: Command) -> Effect<Event, KnownPeople> {
        match command {
            Command::Greet { whom, reply_to } => {
                Effect::persist(Event::Greeted { whom: whom.clone() }).then_reply(
                    &reply_to,
                    move |state: &KnownPeople| Greeting {
                        whom,
                        number_of_people: state.names.len(),
                    },
                )
            }
            Command::Passivate => Effect::stop(),
        }
    }

    fn apply_event(&self, mut state: KnownPeople, event: &Event) -> KnownPeople {
        match event {
            Event::Greeted { whom } => {
                state.names.insert(whom.clone());
            }
        }
        state
    }
}

pub fn hello_key() -> EntityTypeKey<HelloWorld> {
    EntityTypeKey::new("HelloWorld")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A cluster of `nodes` nodes with `HelloWorld` registered everywhere.
pub async fn hello_cluster(nodes: usize, config: ShardingConfig) -> TestCluster {
    init_tracing();
    let cluster = TestCluster::with_nodes_and_config(nodes, config).await;
    cluster
        .register(&hello_key(), |_| HelloWorld, PassivationPolicy::Default)
        .unwrap();
    cluster
}

pub async fn greet(entity: &EntityRef<HelloWorld>, whom: &str) -> Result<Greeting, ClusterError> {
    let whom = whom.to_string();
    entity
        .ask(|reply_to| Command::Greet { whom, reply_to }, ASK_TIMEOUT)
        .await
}

/// Sequence numbers stored for `entity`, in journal order.
pub fn journal_sequence(cluster: &TestCluster, entity: &EntityRef<HelloWorld>) -> Vec<u64> {
    cluster
        .journal()
        .events(&entity.address().persistence_id())
        .iter()
        .map(|entry| entry.sequence_nr)
        .collect()
}
