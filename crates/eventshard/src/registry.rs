use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::entity_runtime::EntityFactory;
use crate::error::ClusterError;
use crate::types::EntityType;

/// When an idle entity is passivated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassivationPolicy {
    /// Use `ShardingConfig::entity_max_idle_time`.
    #[default]
    Default,
    /// Passivate after this long without a delivered message.
    IdleTimeout(Duration),
    /// Only passivate on an explicit stop effect or handoff.
    Never,
}

impl PassivationPolicy {
    pub fn idle_timeout(&self, default: Duration) -> Option<Duration> {
        match self {
            PassivationPolicy::Default => Some(default),
            PassivationPolicy::IdleTimeout(timeout) => Some(*timeout),
            PassivationPolicy::Never => None,
        }
    }
}

pub struct Registration {
    pub factory: Arc<dyn EntityFactory>,
    pub passivation: PassivationPolicy,
}

/// Entity types registered on this node.
#[derive(Default)]
pub struct EntityRegistry {
    registrations: DashMap<EntityType, Arc<Registration>>,
    registered: Notify,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        factory: Arc<dyn EntityFactory>,
        passivation: PassivationPolicy,
    ) -> Result<(), ClusterError> {
        let entity_type = factory.entity_type().clone();
        match self.registrations.entry(entity_type) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Err(ClusterError::InvalidConfig {
                reason: format!("entity type {} is already registered", entry.key()),
            }),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(Registration {
                    factory,
                    passivation,
                }));
                self.registered.notify_waiters();
                Ok(())
            }
        }
    }

    pub fn get(&self, entity_type: &EntityType) -> Option<Arc<Registration>> {
        self.registrations
            .get(entity_type)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Wait up to `timeout` for `entity_type` to be registered.
    pub async fn wait_for(
        &self,
        entity_type: &EntityType,
        timeout: Duration,
    ) -> Result<Arc<Registration>, ClusterError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Arm the notification before checking so a concurrent register is not missed.
            let notified = self.registered.notified();
            if let Some(registration) = self.get(entity_type) {
                return Ok(registration);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ClusterError::EntityTypeNotRegistered {
                    entity_type: entity_type.clone(),
                });
            }
        }
    }
}
