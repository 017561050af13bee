use super::{EntityId, EntityType};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key of one entity's event stream in the journal: `<EntityType>|<EntityId>`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PersistenceId(pub String);

impl PersistenceId {
    pub const SEPARATOR: char = '|';

    pub fn of(entity_type: &EntityType, entity_id: &EntityId) -> Self {
        Self(format!("{}{}{}", entity_type, Self::SEPARATOR, entity_id))
    }
}

impl fmt::Display for PersistenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
