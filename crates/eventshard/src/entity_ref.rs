use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;

use crate::entity::{PersistentEntity, ReplyTo};
use crate::envelope::Envelope;
use crate::error::ClusterError;
use crate::region::ShardRegion;
use crate::reply::{FailureKind, ReplyOutcome};
use crate::types::{EntityAddress, EntityId, EntityType};

/// Handle for sending commands to one entity, wherever it currently lives.
///
/// Holds only the entity's type and id. Every send resolves the owning node
/// through the region, so a reference stays valid across rebalances and
/// passivation.
pub struct EntityRef<B> {
    region: Arc<ShardRegion>,
    entity_type: EntityType,
    entity_id: EntityId,
    _behavior: PhantomData<fn() -> B>,
}

impl<B: PersistentEntity> EntityRef<B> {
    pub(crate) fn new(region: Arc<ShardRegion>, entity_type: EntityType, entity_id: EntityId) -> Self {
        Self {
            region,
            entity_type,
            entity_id,
            _behavior: PhantomData,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn address(&self) -> EntityAddress {
        self.region.entity_address(&self.entity_type, &self.entity_id)
    }

    /// Send the command built by `build` and wait up to `timeout` for its reply.
    ///
    /// Resolves to exactly one of: the reply value, `Timeout`, or
    /// `DeliveryFailed`. The deadline only bounds the wait for the reply:
    /// once handed to the region the command is routed and processed even if
    /// the caller has given up, and a late reply is discarded. Nothing is
    /// retried at this level.
    #[instrument(
        skip_all,
        fields(
            entity_type = %self.entity_type,
            entity_id = %self.entity_id,
            correlation_id = tracing::field::Empty
        )
    )]
    pub async fn ask<R, F>(&self, build: F, timeout: Duration) -> Result<R, ClusterError>
    where
        R: DeserializeOwned,
        F: FnOnce(ReplyTo<R>) -> B::Command,
    {
        let address = self.address();
        let correlation_id = self.region.next_correlation_id();
        tracing::Span::current().record("correlation_id", tracing::field::display(correlation_id));

        let envelope = Envelope {
            correlation_id,
            address: address.clone(),
            payload: encode(&build(ReplyTo::new(correlation_id)))
                .map_err(|e| e.into_delivery_error(&address))?,
            expects_reply: true,
        };

        let reply_rx = self
            .region
            .deliver(envelope)
            .map_err(|e| e.into_delivery_error(&address))?
            .ok_or_else(|| no_reply(&address, "no reply channel for ask"))?;

        let reply = match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(no_reply(&address, "reply channel closed without a reply")),
            Err(_) => {
                tracing::debug!(?timeout, "ask timed out");
                return Err(ClusterError::Timeout { address, timeout });
            }
        };

        match reply.outcome {
            ReplyOutcome::Success(bytes) => rmp_serde::from_slice(&bytes).map_err(|e| {
                ClusterError::DeliveryFailed {
                    address,
                    kind: FailureKind::Rejected,
                    reason: format!("failed to deserialize reply: {e}"),
                }
            }),
            ReplyOutcome::Failure { kind, reason } => Err(ClusterError::DeliveryFailed {
                address,
                kind,
                reason,
            }),
        }
    }

    /// Fire-and-forget. Succeeds once the region has accepted the command;
    /// later routing failures are only logged.
    #[instrument(skip_all, fields(entity_type = %self.entity_type, entity_id = %self.entity_id))]
    pub async fn tell(&self, command: B::Command) -> Result<(), ClusterError> {
        let address = self.address();
        let envelope = Envelope {
            correlation_id: self.region.next_correlation_id(),
            address: address.clone(),
            payload: encode(&command).map_err(|e| e.into_delivery_error(&address))?,
            expects_reply: false,
        };
        self.region
            .deliver(envelope)
            .map(|_| ())
            .map_err(|e| e.into_delivery_error(&address))
    }
}

impl<B> Clone for EntityRef<B> {
    fn clone(&self) -> Self {
        Self {
            region: Arc::clone(&self.region),
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            _behavior: PhantomData,
        }
    }
}

impl<B> fmt::Debug for EntityRef<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRef")
            .field("entity_type", &self.entity_type)
            .field("entity_id", &self.entity_id)
            .finish()
    }
}

fn encode<C: Serialize>(command: &C) -> Result<Vec<u8>, ClusterError> {
    rmp_serde::to_vec(command).map_err(|e| ClusterError::MalformedMessage {
        reason: format!("failed to serialize command: {e}"),
        source: Some(Box::new(e)),
    })
}

fn no_reply(address: &EntityAddress, reason: &str) -> ClusterError {
    ClusterError::DeliveryFailed {
        address: address.clone(),
        kind: FailureKind::NoReply,
        reason: reason.to_string(),
    }
}
