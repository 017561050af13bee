use std::time::Duration;

use crate::reply::FailureKind;
use crate::types::{EntityAddress, EntityType, NodeAddress, PersistenceId, ShardId};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the sharding system.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The journal could not be read while activating an entity.
    #[error("recovery of {persistence_id} failed: {reason}")]
    RecoveryFailure {
        persistence_id: PersistenceId,
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Appending events failed mid-command. Nothing from the command was applied.
    #[error("persisting events for {persistence_id} failed: {reason}")]
    PersistFailure {
        persistence_id: PersistenceId,
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The journal was not at the sequence number the runtime expected:
    /// a second writer exists for this stream.
    #[error(
        "consistency violation for {persistence_id}: expected sequence {expected}, journal is at {actual}"
    )]
    ConsistencyViolation {
        persistence_id: PersistenceId,
        expected: u64,
        actual: u64,
    },

    #[error("ask to {address} timed out after {timeout:?}")]
    Timeout {
        address: EntityAddress,
        timeout: Duration,
    },

    /// Shard ownership could not be resolved or the owner could not be reached.
    #[error("routing {shard_id} failed: {reason}")]
    RoutingFailure { shard_id: ShardId, reason: String },

    /// Caller-facing failure of a delivered command.
    #[error("delivery to {address} failed ({kind:?}): {reason}")]
    DeliveryFailed {
        address: EntityAddress,
        kind: FailureKind,
        reason: String,
    },

    /// The receiving node does not host the shard (stale cache on the sender).
    #[error("{shard_id} is not hosted on {node}")]
    ShardNotHosted { shard_id: ShardId, node: NodeAddress },

    #[error("node unavailable: {node}")]
    NodeUnavailable {
        node: NodeAddress,
        #[source]
        source: Option<BoxError>,
    },

    #[error("entity type {entity_type} is not registered")]
    EntityTypeNotRegistered { entity_type: EntityType },

    #[error("handoff buffer full ({capacity} messages) while buffering {shard_id}")]
    BufferFull { shard_id: ShardId, capacity: usize },

    #[error("malformed message: {reason}")]
    MalformedMessage {
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("storage error: {reason}")]
    StorageError {
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("cluster is shutting down")]
    ShuttingDown,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl ClusterError {
    /// Whether routing may succeed after refreshing shard ownership and retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::ShardNotHosted { .. }
                | ClusterError::NodeUnavailable { .. }
                | ClusterError::StorageError { .. }
        )
    }

    /// Whether the error ends the entity runtime that produced it.
    pub fn is_fatal_to_entity(&self) -> bool {
        matches!(
            self,
            ClusterError::PersistFailure { .. } | ClusterError::ConsistencyViolation { .. }
        )
    }

    /// Taxonomy kind carried in a failure reply.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ClusterError::RecoveryFailure { .. } => FailureKind::Recovery,
            ClusterError::PersistFailure { .. } => FailureKind::Persist,
            ClusterError::ConsistencyViolation { .. } => FailureKind::ConsistencyViolation,
            ClusterError::DeliveryFailed { kind, .. } => *kind,
            ClusterError::MalformedMessage { .. }
            | ClusterError::EntityTypeNotRegistered { .. } => FailureKind::Rejected,
            ClusterError::ShuttingDown => FailureKind::Interrupted,
            ClusterError::Timeout { .. }
            | ClusterError::RoutingFailure { .. }
            | ClusterError::ShardNotHosted { .. }
            | ClusterError::NodeUnavailable { .. }
            | ClusterError::BufferFull { .. }
            | ClusterError::StorageError { .. }
            | ClusterError::InvalidConfig { .. } => FailureKind::Routing,
        }
    }

    /// Convert into the caller-facing form. Timeouts and delivery failures pass
    /// through, everything else becomes a `DeliveryFailed` for `address`.
    pub fn into_delivery_error(self, address: &EntityAddress) -> ClusterError {
        match self {
            ClusterError::Timeout { .. } | ClusterError::DeliveryFailed { .. } => self,
            other => ClusterError::DeliveryFailed {
                address: address.clone(),
                kind: other.failure_kind(),
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityId, EntityType};

    fn address() -> EntityAddress {
        EntityAddress {
            shard_id: ShardId::new(3),
            entity_type: EntityType::new("HelloWorld"),
            entity_id: EntityId::new("world-1"),
        }
    }

    #[test]
    fn error_display_messages() {
        let err = ClusterError::ConsistencyViolation {
            persistence_id: PersistenceId("HelloWorld|world-1".into()),
            expected: 2,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "consistency violation for HelloWorld|world-1: expected sequence 2, journal is at 3"
        );

        let err = ClusterError::RoutingFailure {
            shard_id: ShardId::new(9),
            reason: "no live nodes".into(),
        };
        assert_eq!(err.to_string(), "routing shard-9 failed: no live nodes");
    }

    #[test]
    fn transient_errors() {
        assert!(ClusterError::ShardNotHosted {
            shard_id: ShardId::new(1),
            node: NodeAddress::new("a", 1),
        }
        .is_transient());
        assert!(!ClusterError::ShuttingDown.is_transient());
        assert!(!ClusterError::ConsistencyViolation {
            persistence_id: PersistenceId("x".into()),
            expected: 0,
            actual: 1,
        }
        .is_transient());
    }

    #[test]
    fn persist_failure_becomes_delivery_error() {
        let err = ClusterError::PersistFailure {
            persistence_id: address().persistence_id(),
            reason: "disk full".into(),
            source: None,
        }
        .into_delivery_error(&address());
        match err {
            ClusterError::DeliveryFailed { kind, reason, .. } => {
                assert_eq!(kind, FailureKind::Persist);
                assert!(reason.contains("disk full"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn timeouts_pass_through_unchanged() {
        let err = ClusterError::Timeout {
            address: address(),
            timeout: Duration::from_millis(5),
        }
        .into_delivery_error(&address());
        assert!(matches!(err, ClusterError::Timeout { .. }));
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ClusterError>();
    }
}
