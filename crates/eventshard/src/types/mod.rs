mod entity_address;
mod entity_id;
mod entity_type;
mod node_address;
mod persistence_id;
mod shard_id;

pub use entity_address::EntityAddress;
pub use entity_id::EntityId;
pub use entity_type::EntityType;
pub use node_address::NodeAddress;
pub use persistence_id::PersistenceId;
pub use shard_id::ShardId;
