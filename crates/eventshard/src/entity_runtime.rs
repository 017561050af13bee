//! Hosts one entity incarnation: recovery from the journal and strictly
//! sequential command handling with persist-before-apply.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tracing::instrument;

use crate::correlation::CorrelationId;
use crate::entity::{EntityContext, PersistentEntity};
use crate::error::ClusterError;
use crate::journal::{EventJournal, JournalError, Snapshot};
use crate::metrics::ShardingMetrics;
use crate::types::{EntityType, PersistenceId};

/// Reply produced by a handled command, addressed by correlation id.
#[derive(Debug)]
pub struct OutgoingReply {
    pub correlation_id: CorrelationId,
    pub payload: Vec<u8>,
}

/// Result of handling one command.
#[derive(Debug, Default)]
pub struct CommandOutcome {
    pub reply: Option<OutgoingReply>,
    /// The entity asked to be passivated.
    pub stop: bool,
    /// Number of events appended for this command.
    pub persisted: usize,
}

/// A recovered, running entity as seen by its shard.
#[async_trait]
pub trait EntityHandler: Send {
    /// Handle one MessagePack-encoded command. Errors for which
    /// `ClusterError::is_fatal_to_entity` holds end the runtime.
    async fn handle_command(&mut self, payload: &[u8]) -> Result<CommandOutcome, ClusterError>;

    /// Highest sequence number applied to the in-memory state.
    fn sequence_nr(&self) -> u64;
}

/// Activates handlers for one entity type.
#[async_trait]
pub trait EntityFactory: Send + Sync {
    fn entity_type(&self) -> &EntityType;

    /// Build the behavior and recover its state. Commands are not accepted
    /// until this returns.
    async fn activate(
        &self,
        ctx: EntityContext,
        journal: Arc<dyn EventJournal>,
        metrics: Arc<ShardingMetrics>,
    ) -> Result<Box<dyn EntityHandler>, ClusterError>;
}

/// [`EntityFactory`] for a [`PersistentEntity`] built by a user factory function.
pub struct PersistentEntityFactory<B, F> {
    entity_type: EntityType,
    factory: F,
    _behavior: std::marker::PhantomData<fn() -> B>,
}

impl<B, F> PersistentEntityFactory<B, F>
where
    B: PersistentEntity,
    F: Fn(&EntityContext) -> B + Send + Sync + 'static,
{
    pub fn new(entity_type: EntityType, factory: F) -> Self {
        Self {
            entity_type,
            factory,
            _behavior: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<B, F> EntityFactory for PersistentEntityFactory<B, F>
where
    B: PersistentEntity,
    F: Fn(&EntityContext) -> B + Send + Sync + 'static,
{
    fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    async fn activate(
        &self,
        ctx: EntityContext,
        journal: Arc<dyn EventJournal>,
        metrics: Arc<ShardingMetrics>,
    ) -> Result<Box<dyn EntityHandler>, ClusterError> {
        let behavior = (self.factory)(&ctx);
        let runtime = EntityRuntime::recover(behavior, ctx, journal, metrics).await?;
        Ok(Box::new(runtime))
    }
}

/// Typed runtime for one entity incarnation.
pub struct EntityRuntime<B: PersistentEntity> {
    behavior: B,
    ctx: EntityContext,
    journal: Arc<dyn EventJournal>,
    metrics: Arc<ShardingMetrics>,
    /// Always `Some` between commands; taken while events are folded in.
    state: Option<B::State>,
    sequence_nr: u64,
    events_since_snapshot: u64,
}

impl<B: PersistentEntity> EntityRuntime<B> {
    /// Load the latest snapshot, then fold every later event into state.
    #[instrument(skip_all, fields(persistence_id = %ctx.persistence_id))]
    pub async fn recover(
        behavior: B,
        ctx: EntityContext,
        journal: Arc<dyn EventJournal>,
        metrics: Arc<ShardingMetrics>,
    ) -> Result<Self, ClusterError> {
        let pid = ctx.persistence_id.clone();
        let snapshot = journal
            .load_snapshot(&pid)
            .await
            .map_err(|e| recovery_failure(&pid, "loading snapshot failed", e))?;

        let (mut state, mut sequence_nr) = match snapshot {
            Some(snapshot) => {
                let state = rmp_serde::from_slice(&snapshot.payload).map_err(|e| {
                    ClusterError::RecoveryFailure {
                        persistence_id: pid.clone(),
                        reason: format!("undecodable snapshot at {}: {e}", snapshot.sequence_nr),
                        source: Some(Box::new(e)),
                    }
                })?;
                (state, snapshot.sequence_nr)
            }
            None => (behavior.empty_state(), 0),
        };
        let snapshot_sequence_nr = sequence_nr;
        let highest = journal
            .highest_sequence_nr(&pid)
            .await
            .map_err(|e| recovery_failure(&pid, "reading highest sequence failed", e))?;

        let mut events = journal
            .read_from(&pid, sequence_nr + 1)
            .await
            .map_err(|e| recovery_failure(&pid, "reading events failed", e))?;
        while let Some(entry) = events.next().await {
            let entry = entry.map_err(|e| recovery_failure(&pid, "reading events failed", e))?;
            if entry.sequence_nr != sequence_nr + 1 {
                return Err(ClusterError::RecoveryFailure {
                    persistence_id: pid,
                    reason: format!(
                        "journal gap: expected sequence {}, found {}",
                        sequence_nr + 1,
                        entry.sequence_nr
                    ),
                    source: None,
                });
            }
            let event: B::Event = rmp_serde::from_slice(&entry.payload).map_err(|e| {
                ClusterError::RecoveryFailure {
                    persistence_id: pid.clone(),
                    reason: format!("undecodable event at {}: {e}", entry.sequence_nr),
                    source: Some(Box::new(e)),
                }
            })?;
            state = behavior.apply_event(state, &event);
            sequence_nr = entry.sequence_nr;
        }
        if sequence_nr < highest {
            return Err(ClusterError::RecoveryFailure {
                persistence_id: pid,
                reason: format!("journal is at {highest} but events end at {sequence_nr}"),
                source: None,
            });
        }

        metrics.recoveries.inc();
        tracing::debug!(
            sequence_nr,
            replayed = sequence_nr - snapshot_sequence_nr,
            "entity recovered"
        );

        Ok(Self {
            behavior,
            ctx,
            journal,
            metrics,
            state: Some(state),
            sequence_nr,
            events_since_snapshot: sequence_nr - snapshot_sequence_nr,
        })
    }

    pub fn state(&self) -> Option<&B::State> {
        self.state.as_ref()
    }

    async fn persist(&mut self, events: &[B::Event]) -> Result<(), ClusterError> {
        let pid = &self.ctx.persistence_id;
        let payloads = events
            .iter()
            .map(|event| {
                rmp_serde::to_vec(event).map_err(|e| ClusterError::MalformedMessage {
                    reason: format!("failed to serialize event: {e}"),
                    source: Some(Box::new(e)),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        match self.journal.append(pid, self.sequence_nr, payloads).await {
            Ok(highest) => {
                let expected = self.sequence_nr + events.len() as u64;
                if highest != expected {
                    return Err(ClusterError::ConsistencyViolation {
                        persistence_id: pid.clone(),
                        expected,
                        actual: highest,
                    });
                }
                if let Some(state) = self.state.take() {
                    let behavior = &self.behavior;
                    self.state = Some(
                        events
                            .iter()
                            .fold(state, |state, event| behavior.apply_event(state, event)),
                    );
                }
                self.sequence_nr = highest;
                self.events_since_snapshot += events.len() as u64;
                self.metrics.persisted_events.inc_by(events.len() as u64);
                Ok(())
            }
            Err(JournalError::Conflict { expected, actual }) => {
                Err(ClusterError::ConsistencyViolation {
                    persistence_id: pid.clone(),
                    expected,
                    actual,
                })
            }
            Err(e @ JournalError::Io { .. }) => Err(ClusterError::PersistFailure {
                persistence_id: pid.clone(),
                reason: e.to_string(),
                source: Some(Box::new(e)),
            }),
        }
    }

    /// Snapshot failures are logged and otherwise ignored: the events remain
    /// the source of truth.
    async fn maybe_snapshot(&mut self) {
        let Some(retention) = self.behavior.retention() else {
            return;
        };
        if retention.snapshot_every == 0 || self.events_since_snapshot < retention.snapshot_every {
            return;
        }
        let Some(state) = self.state.as_ref() else {
            return;
        };
        let pid = self.ctx.persistence_id.clone();
        let payload = match rmp_serde::to_vec(state) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(persistence_id = %pid, "failed to serialize snapshot: {e}");
                return;
            }
        };
        let snapshot = Snapshot {
            persistence_id: pid.clone(),
            sequence_nr: self.sequence_nr,
            payload,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.journal.save_snapshot(snapshot).await {
            tracing::warn!(persistence_id = %pid, "failed to save snapshot: {e}");
            return;
        }
        self.events_since_snapshot = 0;
        if retention.delete_events_on_snapshot {
            if let Err(e) = self.journal.delete_up_to(&pid, self.sequence_nr).await {
                tracing::warn!(persistence_id = %pid, "failed to delete snapshotted events: {e}");
            }
        }
    }
}

#[async_trait]
impl<B: PersistentEntity> EntityHandler for EntityRuntime<B> {
    #[instrument(skip_all, fields(persistence_id = %self.ctx.persistence_id, sequence_nr = self.sequence_nr))]
    async fn handle_command(&mut self, payload: &[u8]) -> Result<CommandOutcome, ClusterError> {
        let command: B::Command =
            rmp_serde::from_slice(payload).map_err(|e| ClusterError::MalformedMessage {
                reason: format!("failed to deserialize command: {e}"),
                source: Some(Box::new(e)),
            })?;

        let effect = match self.state.as_ref() {
            Some(state) => self.behavior.handle_command(state, command),
            None => {
                return Err(ClusterError::ConsistencyViolation {
                    persistence_id: self.ctx.persistence_id.clone(),
                    expected: self.sequence_nr,
                    actual: self.sequence_nr,
                })
            }
        };

        let persisted = effect.events.len();
        if persisted > 0 {
            self.persist(&effect.events).await?;
            self.maybe_snapshot().await;
        }

        let reply = match (effect.reply, self.state.as_ref()) {
            (Some(pending), Some(state)) => Some(OutgoingReply {
                correlation_id: pending.to,
                payload: (pending.build)(state)?,
            }),
            _ => None,
        };

        Ok(CommandOutcome {
            reply,
            stop: effect.stop,
            persisted,
        })
    }

    fn sequence_nr(&self) -> u64 {
        self.sequence_nr
    }
}

fn recovery_failure(pid: &PersistenceId, what: &str, e: JournalError) -> ClusterError {
    ClusterError::RecoveryFailure {
        persistence_id: pid.clone(),
        reason: format!("{what}: {e}"),
        source: Some(Box::new(e)),
    }
}
