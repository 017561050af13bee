//! Cluster sharding for event-sourced entities.
//!
//! Entities are addressed by `(EntityType, EntityId)`. Each id hashes to a
//! shard, the [`coordinator`] places shards on nodes, and every node's
//! [`region`] routes messages to the owning node. There the entity's runtime
//! processes commands one at a time, persisting events to the
//! [`journal`] before state changes and replies become visible.
//!
//! ```ignore
//! use eventshard::prelude::*;
//!
//! let cluster = TestCluster::new().await;
//! let key = EntityTypeKey::<HelloWorld>::new("HelloWorld");
//! cluster.register(&key, |_| HelloWorld, PassivationPolicy::Default)?;
//!
//! let world = cluster.sharding().entity_ref_for(&key, "world-1");
//! let greeting = world
//!     .ask(|reply_to| Command::Greet { whom: "alice".into(), reply_to }, Duration::from_secs(3))
//!     .await?;
//! ```

pub mod allocation;
pub mod allocation_store;
pub mod config;
pub mod coordinator;
pub mod correlation;
pub mod entity;
pub mod entity_ref;
pub mod entity_runtime;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod journal;
pub mod membership;
pub mod message;
pub mod metrics;
pub mod region;
pub mod registry;
pub mod reply;
pub mod shard;
pub mod sharding;
pub mod storage;
pub mod testing;
pub mod transport;
pub mod types;

/// Prelude module for convenient glob imports.
pub mod prelude {
    pub use crate::config::ShardingConfig;
    pub use crate::entity::{Effect, EntityContext, PersistentEntity, ReplyTo, RetentionCriteria};
    pub use crate::entity_ref::EntityRef;
    pub use crate::error::ClusterError;
    pub use crate::registry::PassivationPolicy;
    pub use crate::reply::FailureKind;
    pub use crate::sharding::{ClusterSharding, EntityTypeKey};
    pub use crate::testing::TestCluster;
    pub use crate::types::{EntityId, EntityType, NodeAddress, ShardId};
}
