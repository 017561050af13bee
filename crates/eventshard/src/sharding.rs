//! Caller-facing facade over a node's region.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::entity::{EntityContext, PersistentEntity};
use crate::entity_ref::EntityRef;
use crate::entity_runtime::PersistentEntityFactory;
use crate::error::ClusterError;
use crate::region::ShardRegion;
use crate::registry::PassivationPolicy;
use crate::types::{EntityId, EntityType};

/// Typed name of an entity type. Ties the wire-level [`EntityType`] to the
/// behavior `B` so references built from it only accept `B`'s commands.
pub struct EntityTypeKey<B> {
    name: EntityType,
    _behavior: PhantomData<fn() -> B>,
}

impl<B> EntityTypeKey<B> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: EntityType::new(name),
            _behavior: PhantomData,
        }
    }

    pub fn name(&self) -> &EntityType {
        &self.name
    }
}

impl<B> Clone for EntityTypeKey<B> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _behavior: PhantomData,
        }
    }
}

impl<B> fmt::Debug for EntityTypeKey<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EntityTypeKey").field(&self.name).finish()
    }
}

/// Sharding on one node: entity registration and entity references.
#[derive(Clone)]
pub struct ClusterSharding {
    region: Arc<ShardRegion>,
}

impl ClusterSharding {
    pub fn new(region: Arc<ShardRegion>) -> Self {
        Self { region }
    }

    /// Register the behavior for `key`. The factory runs once per activation.
    pub fn register<B, F>(
        &self,
        key: &EntityTypeKey<B>,
        factory: F,
        passivation: PassivationPolicy,
    ) -> Result<(), ClusterError>
    where
        B: PersistentEntity,
        F: Fn(&EntityContext) -> B + Send + Sync + 'static,
    {
        let factory = PersistentEntityFactory::new(key.name().clone(), factory);
        self.region.register(Arc::new(factory), passivation)
    }

    /// A location-transparent reference. Resolution happens on every send.
    pub fn entity_ref_for<B: PersistentEntity>(
        &self,
        key: &EntityTypeKey<B>,
        entity_id: impl Into<EntityId>,
    ) -> EntityRef<B> {
        EntityRef::new(Arc::clone(&self.region), key.name().clone(), entity_id.into())
    }

    pub fn region(&self) -> &Arc<ShardRegion> {
        &self.region
    }

    pub async fn shutdown(&self) {
        self.region.shutdown().await;
    }
}
