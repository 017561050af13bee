use super::{EntityId, EntityType, PersistenceId, ShardId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Full address of an entity: shard + type + id.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct EntityAddress {
    pub shard_id: ShardId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
}

impl EntityAddress {
    pub fn persistence_id(&self) -> PersistenceId {
        PersistenceId::of(&self.entity_type, &self.entity_id)
    }
}

impl fmt::Display for EntityAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.shard_id, self.entity_type, self.entity_id
        )
    }
}
