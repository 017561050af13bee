//! Event-sourced entity behavior: commands in, effects out, state folded from events.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationId;
use crate::error::ClusterError;
use crate::types::{EntityAddress, EntityId, EntityType, NodeAddress, PersistenceId};

/// Context handed to the entity factory when a runtime is activated.
#[derive(Debug, Clone)]
pub struct EntityContext {
    pub address: EntityAddress,
    pub persistence_id: PersistenceId,
    /// Node hosting this incarnation of the entity.
    pub node: NodeAddress,
}

impl EntityContext {
    pub fn entity_id(&self) -> &EntityId {
        &self.address.entity_id
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.address.entity_type
    }
}

/// Snapshot cadence for an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionCriteria {
    /// Save a snapshot after this many persisted events.
    pub snapshot_every: u64,
    /// Delete events covered by a saved snapshot.
    pub delete_events_on_snapshot: bool,
}

/// An event-sourced entity type.
///
/// `Command` and `Event` are closed sum types. `handle_command` decides what
/// happens and never mutates state; state only changes through `apply_event`,
/// which must be a pure function of the previous state and the event so that
/// replaying the journal reproduces it exactly.
pub trait PersistentEntity: Send + Sync + 'static {
    type Command: Serialize + DeserializeOwned + Send + 'static;
    type Event: Serialize + DeserializeOwned + Send + Sync + 'static;
    type State: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// State before any event has been applied.
    fn empty_state(&self) -> Self::State;

    fn handle_command(
        &self,
        state: &Self::State,
        command: Self::Command,
    ) -> Effect<Self::Event, Self::State>;

    fn apply_event(&self, state: Self::State, event: &Self::Event) -> Self::State;

    /// Snapshot policy. `None` replays the full journal on every activation.
    fn retention(&self) -> Option<RetentionCriteria> {
        None
    }
}

/// Reply-address embedded in a command by the asking side.
///
/// `R` is the reply type the asker expects. Only the correlation id travels
/// on the wire.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ReplyTo<R> {
    correlation_id: CorrelationId,
    #[serde(skip)]
    _reply: PhantomData<fn() -> R>,
}

impl<R> ReplyTo<R> {
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            _reply: PhantomData,
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }
}

impl<R> Clone for ReplyTo<R> {
    fn clone(&self) -> Self {
        Self::new(self.correlation_id)
    }
}

impl<R> PartialEq for ReplyTo<R> {
    fn eq(&self, other: &Self) -> bool {
        self.correlation_id == other.correlation_id
    }
}

impl<R> Eq for ReplyTo<R> {}

impl<R> fmt::Debug for ReplyTo<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReplyTo").field(&self.correlation_id).finish()
    }
}

type BuildReply<S> = Box<dyn FnOnce(&S) -> Result<Vec<u8>, ClusterError> + Send>;

pub(crate) struct PendingReply<S> {
    pub(crate) to: CorrelationId,
    pub(crate) build: BuildReply<S>,
}

/// What the runtime does after a command: persist events, reply, stop, or a
/// combination. Replies are built from the state *after* the events are
/// applied, so a reply always reflects durably persisted state.
pub struct Effect<E, S> {
    pub(crate) events: Vec<E>,
    pub(crate) reply: Option<PendingReply<S>>,
    pub(crate) stop: bool,
}

impl<E, S: 'static> Effect<E, S> {
    /// Do nothing.
    pub fn none() -> Self {
        Self {
            events: Vec::new(),
            reply: None,
            stop: false,
        }
    }

    pub fn persist(event: E) -> Self {
        Self::persist_all([event])
    }

    /// Persist several events atomically, in order.
    pub fn persist_all(events: impl IntoIterator<Item = E>) -> Self {
        Self {
            events: events.into_iter().collect(),
            ..Self::none()
        }
    }

    /// Reply without persisting anything.
    pub fn reply<R>(to: &ReplyTo<R>, value: R) -> Self
    where
        R: Serialize + Send + 'static,
    {
        Self::none().then_reply(to, move |_| value)
    }

    /// Passivate the entity once this command completes.
    pub fn stop() -> Self {
        Self {
            stop: true,
            ..Self::none()
        }
    }

    /// Reply with a value computed from the post-apply state.
    pub fn then_reply<R, F>(mut self, to: &ReplyTo<R>, f: F) -> Self
    where
        R: Serialize + 'static,
        F: FnOnce(&S) -> R + Send + 'static,
    {
        self.reply = Some(PendingReply {
            to: to.correlation_id(),
            build: Box::new(move |state| {
                rmp_serde::to_vec(&f(state)).map_err(|e| ClusterError::MalformedMessage {
                    reason: format!("failed to serialize reply: {e}"),
                    source: Some(Box::new(e)),
                })
            }),
        });
        self
    }

    pub fn then_stop(mut self) -> Self {
        self.stop = true;
        self
    }

    /// Events this effect will persist.
    pub fn events(&self) -> &[E] {
        &self.events
    }

    pub fn has_reply(&self) -> bool {
        self.reply.is_some()
    }

    pub fn is_stop(&self) -> bool {
        self.stop
    }
}

impl<E: fmt::Debug, S> fmt::Debug for Effect<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("events", &self.events)
            .field("reply_to", &self.reply.as_ref().map(|r| r.to))
            .field("stop", &self.stop)
            .finish()
    }
}
