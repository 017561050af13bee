//! A shard owns the entities of one partition.
//!
//! Each shard is a single task that exclusively owns the `EntityAddress ->
//! EntityHandle` map. Each active entity is its own task draining an unbounded
//! mailbox one command at a time. Idle timers, passivation and handoff all
//! reach an entity through that same mailbox, so a stop never overtakes a
//! command (or its persist) that was queued before it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::ShardingConfig;
use crate::entity::EntityContext;
use crate::entity_runtime::{EntityFactory, EntityHandler, OutgoingReply};
use crate::error::ClusterError;
use crate::journal::EventJournal;
use crate::message::IncomingMessage;
use crate::metrics::ShardingMetrics;
use crate::registry::Registration;
use crate::reply::{FailureKind, Reply};
use crate::types::{EntityAddress, NodeAddress, ShardId};

/// Node-wide collaborators shared by every shard on a node.
pub struct ShardContext {
    pub node: NodeAddress,
    pub config: Arc<ShardingConfig>,
    pub journal: Arc<dyn EventJournal>,
    pub metrics: Arc<ShardingMetrics>,
}

enum ShardCommand {
    Deliver {
        message: IncomingMessage,
        registration: Arc<Registration>,
    },
    IdleTimeout {
        address: EntityAddress,
        generation: u64,
    },
    EntityStopped {
        address: EntityAddress,
        incarnation: u64,
        reason: StopReason,
        leftover: Vec<IncomingMessage>,
    },
    HandOff {
        done: oneshot::Sender<Vec<IncomingMessage>>,
    },
    ActiveEntities {
        reply: oneshot::Sender<Vec<EntityAddress>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    /// Idle timer or handoff.
    Passivated,
    /// The entity returned a stop effect.
    Stopped,
    PersistFailed,
    ConsistencyViolation,
    RecoveryFailed,
}

enum EntityMessage {
    Command(IncomingMessage),
    Passivate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntityStatus {
    Active,
    /// Stop requested or in progress. New messages wait in `buffer`.
    Passivating,
}

struct EntityHandle {
    incarnation: u64,
    registration: Arc<Registration>,
    mailbox: mpsc::UnboundedSender<EntityMessage>,
    status: EntityStatus,
    buffer: VecDeque<IncomingMessage>,
    idle_timer: Option<IdleTimer>,
    /// Yields the commands left in the mailbox if the task was cancelled.
    task: JoinHandle<Vec<IncomingMessage>>,
}

struct IdleTimer {
    generation: u64,
    task: JoinHandle<()>,
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct PendingHandOff {
    done: oneshot::Sender<Vec<IncomingMessage>>,
    leftover: Vec<IncomingMessage>,
}

/// Handle to a running shard task.
pub struct Shard {
    shard_id: ShardId,
    tx: mpsc::UnboundedSender<ShardCommand>,
    cancel: CancellationToken,
    join_handle: parking_lot::Mutex<Option<JoinHandle<Vec<IncomingMessage>>>>,
}

impl Shard {
    /// Spawn the shard task. Entities are activated lazily on first message.
    pub fn start(shard_id: ShardId, ctx: Arc<ShardContext>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        ctx.metrics.shards.inc();
        let task = ShardTask {
            shard_id,
            ctx,
            self_tx: tx.clone(),
            entities: HashMap::new(),
            next_incarnation: 0,
            next_timer_generation: 0,
            handing_off: None,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run(rx));
        let shard = Arc::new(Self {
            shard_id,
            tx,
            cancel,
            join_handle: parking_lot::Mutex::new(None),
        });
        *shard.join_handle.lock() = Some(handle);
        shard
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Queue a message for its entity. Returns the message if the shard has
    /// already stopped.
    pub fn deliver(
        &self,
        message: IncomingMessage,
        registration: Arc<Registration>,
    ) -> Result<(), IncomingMessage> {
        self.tx
            .send(ShardCommand::Deliver {
                message,
                registration,
            })
            .map_err(|e| match e.0 {
                ShardCommand::Deliver { message, .. } => message,
                _ => unreachable!("only Deliver is sent here"),
            })
    }

    /// Passivate every entity, wait for in-flight commands to finish, and
    /// return the messages that were never handed to an entity.
    ///
    /// Entities still running after `timeout` are cancelled: the command each
    /// one is processing fails with `Interrupted`, and the commands still
    /// queued in its mailbox are returned with the rest.
    #[instrument(skip(self), fields(shard_id = %self.shard_id))]
    pub async fn hand_off(&self, timeout: Duration) -> Vec<IncomingMessage> {
        let (done, rx) = oneshot::channel();
        let mut leftover = Vec::new();
        if self.tx.send(ShardCommand::HandOff { done }).is_ok() {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(drained)) => leftover = drained,
                Ok(Err(_)) => {}
                Err(_) => {
                    tracing::warn!(?timeout, "shard handoff timed out, cancelling remaining entities");
                    self.cancel.cancel();
                }
            }
        }
        leftover.extend(self.join().await);
        leftover
    }

    pub async fn active_entities(&self) -> Vec<EntityAddress> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ShardCommand::ActiveEntities { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Messages the shard task still held when it stopped.
    async fn join(&self) -> Vec<IncomingMessage> {
        let handle = self.join_handle.lock().take();
        match handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

struct ShardTask {
    shard_id: ShardId,
    ctx: Arc<ShardContext>,
    self_tx: mpsc::UnboundedSender<ShardCommand>,
    entities: HashMap<EntityAddress, EntityHandle>,
    next_incarnation: u64,
    next_timer_generation: u64,
    handing_off: Option<PendingHandOff>,
    cancel: CancellationToken,
}

impl ShardTask {
    /// Returns the messages that reached the shard but no entity.
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ShardCommand>) -> Vec<IncomingMessage> {
        tracing::debug!(shard_id = %self.shard_id, node = %self.ctx.node, "shard started");
        let cancel = self.cancel.clone();
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    if !self.on_command(command) {
                        break;
                    }
                }
            }
        }
        rx.close();
        let leftover = if cancelled {
            self.cancel_all(&mut rx).await
        } else {
            let mut late = Vec::new();
            while let Ok(command) = rx.try_recv() {
                if let ShardCommand::Deliver { message, .. } = command {
                    late.push(message);
                }
            }
            late
        };
        self.ctx.metrics.shards.dec();
        tracing::debug!(shard_id = %self.shard_id, leftover = leftover.len(), "shard stopped");
        leftover
    }

    /// Returns `false` once the shard has finished handing off.
    fn on_command(&mut self, command: ShardCommand) -> bool {
        match command {
            ShardCommand::Deliver {
                message,
                registration,
            } => self.deliver(message, registration),
            ShardCommand::IdleTimeout {
                address,
                generation,
            } => {
                if let Some(handle) = self.entities.get_mut(&address) {
                    let current = handle
                        .idle_timer
                        .as_ref()
                        .is_some_and(|timer| timer.generation == generation);
                    if current && handle.status == EntityStatus::Active {
                        tracing::debug!(entity_address = %address, "passivating idle entity");
                        begin_passivation(handle);
                    }
                }
            }
            ShardCommand::EntityStopped {
                address,
                incarnation,
                reason,
                leftover,
            } => self.on_entity_stopped(address, incarnation, reason, leftover),
            ShardCommand::HandOff { done } => {
                if self.handing_off.is_some() {
                    let _ = done.send(Vec::new());
                } else {
                    tracing::debug!(
                        shard_id = %self.shard_id,
                        entities = self.entities.len(),
                        "handing off shard"
                    );
                    for handle in self.entities.values_mut() {
                        if handle.status == EntityStatus::Active {
                            begin_passivation(handle);
                        }
                    }
                    self.handing_off = Some(PendingHandOff {
                        done,
                        leftover: Vec::new(),
                    });
                }
            }
            ShardCommand::ActiveEntities { reply } => {
                let _ = reply.send(self.entities.keys().cloned().collect());
            }
        }
        self.finish_handoff_if_drained()
    }

    fn deliver(&mut self, message: IncomingMessage, registration: Arc<Registration>) {
        let address = message.envelope().address.clone();
        let generation = self.next_generation();
        let idle_timeout = registration
            .passivation
            .idle_timeout(self.ctx.config.entity_max_idle_time);

        match self.entities.get_mut(&address) {
            Some(handle) if handle.status == EntityStatus::Passivating => {
                tracing::debug!(entity_address = %address, "buffering message for stopping entity");
                handle.buffer.push_back(message);
            }
            Some(handle) => {
                if let Err(mpsc::error::SendError(EntityMessage::Command(message))) =
                    handle.mailbox.send(EntityMessage::Command(message))
                {
                    // The entity task is exiting; its stop report will reactivate it.
                    handle.status = EntityStatus::Passivating;
                    handle.buffer.push_back(message);
                } else {
                    self.arm_idle_timer(&address, generation, idle_timeout);
                }
            }
            None if self.handing_off.is_some() => {
                if let Some(handoff) = self.handing_off.as_mut() {
                    handoff.leftover.push(message);
                }
            }
            None => {
                self.activate(address.clone(), registration, [message].into());
                self.arm_idle_timer(&address, generation, idle_timeout);
            }
        }
    }

    fn activate(
        &mut self,
        address: EntityAddress,
        registration: Arc<Registration>,
        pending: VecDeque<IncomingMessage>,
    ) {
        self.next_incarnation += 1;
        let incarnation = self.next_incarnation;
        let (mailbox, mailbox_rx) = mpsc::unbounded_channel();
        for message in pending {
            let _ = mailbox.send(EntityMessage::Command(message));
        }
        let entity_task = EntityTask {
            entity_ctx: EntityContext {
                persistence_id: address.persistence_id(),
                address: address.clone(),
                node: self.ctx.node.clone(),
            },
            incarnation,
            factory: Arc::clone(&registration.factory),
            shard: Arc::clone(&self.ctx),
            shard_tx: self.self_tx.clone(),
            cancel: self.cancel.child_token(),
        };
        let task = tokio::spawn(entity_task.run(mailbox_rx));
        self.ctx.metrics.entities.inc();
        tracing::debug!(entity_address = %address, incarnation, "activating entity");
        self.entities.insert(
            address,
            EntityHandle {
                incarnation,
                registration,
                mailbox,
                status: EntityStatus::Active,
                buffer: VecDeque::new(),
                idle_timer: None,
                task,
            },
        );
    }

    fn on_entity_stopped(
        &mut self,
        address: EntityAddress,
        incarnation: u64,
        reason: StopReason,
        leftover: Vec<IncomingMessage>,
    ) {
        let is_current = self
            .entities
            .get(&address)
            .is_some_and(|handle| handle.incarnation == incarnation);
        let Some(handle) = is_current.then(|| self.entities.remove(&address)).flatten() else {
            tracing::warn!(entity_address = %address, incarnation, "stop report for unknown entity incarnation");
            for message in leftover {
                message.fail(&ClusterError::ShuttingDown);
            }
            return;
        };

        self.ctx.metrics.entities.dec();
        if matches!(reason, StopReason::Passivated | StopReason::Stopped) {
            self.ctx.metrics.passivations.inc();
        }
        tracing::debug!(entity_address = %address, incarnation, ?reason, "entity stopped");

        let mut pending: VecDeque<IncomingMessage> = leftover.into();
        pending.extend(handle.buffer);

        if let Some(handoff) = self.handing_off.as_mut() {
            handoff.leftover.extend(pending);
            return;
        }

        if !pending.is_empty() {
            let generation = self.next_generation();
            let idle_timeout = handle
                .registration
                .passivation
                .idle_timeout(self.ctx.config.entity_max_idle_time);
            tracing::debug!(
                entity_address = %address,
                pending = pending.len(),
                "reactivating entity for buffered messages"
            );
            self.activate(address.clone(), handle.registration, pending);
            self.arm_idle_timer(&address, generation, idle_timeout);
        }
    }

    fn finish_handoff_if_drained(&mut self) -> bool {
        if self.handing_off.is_none() || !self.entities.is_empty() {
            return true;
        }
        if let Some(handoff) = self.handing_off.take() {
            tracing::debug!(
                shard_id = %self.shard_id,
                leftover = handoff.leftover.len(),
                "shard drained"
            );
            if let Err(leftover) = handoff.done.send(handoff.leftover) {
                for message in leftover {
                    message.fail(&ClusterError::ShuttingDown);
                }
            }
        }
        false
    }

    fn next_generation(&mut self) -> u64 {
        self.next_timer_generation += 1;
        self.next_timer_generation
    }

    /// Restart the idle timer of `address`. A previous timer is aborted when replaced.
    fn arm_idle_timer(&mut self, address: &EntityAddress, generation: u64, timeout: Option<Duration>) {
        let (Some(timeout), Some(handle)) = (timeout, self.entities.get_mut(address)) else {
            return;
        };
        let tx = self.self_tx.clone();
        let address = address.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(ShardCommand::IdleTimeout {
                address,
                generation,
            });
        });
        handle.idle_timer = Some(IdleTimer { generation, task });
    }

    /// Wait for every cancelled entity task and collect the commands none of
    /// them started, keeping each entity's commands in arrival order.
    async fn cancel_all(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<ShardCommand>,
    ) -> Vec<IncomingMessage> {
        let mut unstarted = HashMap::with_capacity(self.entities.len());
        for (address, handle) in self.entities.iter_mut() {
            let queued = (&mut handle.task).await.unwrap_or_default();
            unstarted.insert(address.clone(), queued);
        }

        let mut leftover = self
            .handing_off
            .take()
            .map(|handoff| handoff.leftover)
            .unwrap_or_default();
        let mut late = Vec::new();
        // The shard channel is closed, so this only yields what was already sent.
        while let Ok(command) = rx.try_recv() {
            match command {
                ShardCommand::Deliver { message, .. } => late.push(message),
                ShardCommand::EntityStopped {
                    address,
                    incarnation,
                    leftover: stopped,
                    ..
                } => {
                    let is_current = self
                        .entities
                        .get(&address)
                        .is_some_and(|handle| handle.incarnation == incarnation);
                    leftover.extend(stopped);
                    if let Some(handle) = is_current.then(|| self.entities.remove(&address)).flatten() {
                        self.ctx.metrics.entities.dec();
                        leftover.extend(unstarted.remove(&address).unwrap_or_default());
                        leftover.extend(handle.buffer);
                    }
                }
                ShardCommand::HandOff { done } => {
                    let _ = done.send(Vec::new());
                }
                ShardCommand::IdleTimeout { .. } | ShardCommand::ActiveEntities { .. } => {}
            }
        }
        for (address, handle) in self.entities.drain() {
            self.ctx.metrics.entities.dec();
            leftover.extend(unstarted.remove(&address).unwrap_or_default());
            leftover.extend(handle.buffer);
        }
        leftover.extend(late);
        leftover
    }
}

fn begin_passivation(handle: &mut EntityHandle) {
    handle.status = EntityStatus::Passivating;
    handle.idle_timer = None;
    // A closed mailbox means the task is already exiting and will report.
    let _ = handle.mailbox.send(EntityMessage::Passivate);
}

struct EntityTask {
    entity_ctx: EntityContext,
    incarnation: u64,
    factory: Arc<dyn EntityFactory>,
    shard: Arc<ShardContext>,
    shard_tx: mpsc::UnboundedSender<ShardCommand>,
    cancel: CancellationToken,
}

impl EntityTask {
    /// Reports to the shard when it stops on its own. When cancelled it
    /// reports nothing and returns the commands it never started, as it does
    /// when the shard is no longer there to report to.
    async fn run(self, mut mailbox: mpsc::UnboundedReceiver<EntityMessage>) -> Vec<IncomingMessage> {
        let address = self.entity_ctx.address.clone();
        let activation = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return unstarted(&mut mailbox),
            activation = self.activate_with_retry() => activation,
        };
        let mut handler = match activation {
            Ok(handler) => handler,
            Err(error) => {
                tracing::error!(
                    entity_address = %address,
                    error = %error,
                    "entity activation failed, failing queued commands"
                );
                mailbox.close();
                while let Some(message) = mailbox.recv().await {
                    if let EntityMessage::Command(message) = message {
                        message.fail(&error);
                    }
                }
                return self.report(StopReason::RecoveryFailed, Vec::new());
            }
        };

        let reason = loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return unstarted(&mut mailbox),
                received = mailbox.recv() => received,
            };
            let message = match received {
                Some(EntityMessage::Command(message)) => message,
                Some(EntityMessage::Passivate) | None => break StopReason::Passivated,
            };
            let handled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = handler.handle_command(&message.envelope().payload) => Some(result),
            };
            let Some(result) = handled else {
                tracing::warn!(entity_address = %address, "entity cancelled mid-command");
                message.fail(&ClusterError::ShuttingDown);
                return unstarted(&mut mailbox);
            };
            match result {
                Ok(outcome) => {
                    complete(message, outcome.reply);
                    if outcome.stop {
                        break StopReason::Stopped;
                    }
                }
                Err(error) if error.is_fatal_to_entity() => {
                    let reason = if matches!(error, ClusterError::ConsistencyViolation { .. }) {
                        tracing::error!(
                            entity_address = %address,
                            sequence_nr = handler.sequence_nr(),
                            error = %error,
                            "consistency violation, stopping entity"
                        );
                        StopReason::ConsistencyViolation
                    } else {
                        tracing::warn!(
                            entity_address = %address,
                            error = %error,
                            "persist failed, stopping entity"
                        );
                        StopReason::PersistFailed
                    };
                    message.fail(&error);
                    break reason;
                }
                Err(error) => message.fail(&error),
            }
        };

        mailbox.close();
        let mut leftover = Vec::new();
        while let Some(message) = mailbox.recv().await {
            if let EntityMessage::Command(message) = message {
                leftover.push(message);
            }
        }
        if reason == StopReason::ConsistencyViolation {
            let error = ClusterError::DeliveryFailed {
                address: address.clone(),
                kind: FailureKind::ConsistencyViolation,
                reason: "entity stopped after a consistency violation".to_string(),
            };
            for message in leftover.drain(..) {
                message.fail(&error);
            }
        }
        self.report(reason, leftover)
    }

    async fn activate_with_retry(&self) -> Result<Box<dyn EntityHandler>, ClusterError> {
        let config = &self.shard.config;
        let mut attempt = 0u32;
        loop {
            let result = self
                .factory
                .activate(
                    self.entity_ctx.clone(),
                    Arc::clone(&self.shard.journal),
                    Arc::clone(&self.shard.metrics),
                )
                .await;
            match result {
                Ok(handler) => return Ok(handler),
                Err(error) if attempt < config.entity_recovery_max_retries => {
                    attempt += 1;
                    let delay = recovery_backoff(config, attempt);
                    tracing::warn!(
                        entity_address = %self.entity_ctx.address,
                        attempt,
                        ?delay,
                        error = %error,
                        "entity activation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Hand the stop and its unstarted commands to the shard. If the shard
    /// has already stopped listening the commands are returned instead.
    fn report(&self, reason: StopReason, leftover: Vec<IncomingMessage>) -> Vec<IncomingMessage> {
        let stopped = ShardCommand::EntityStopped {
            address: self.entity_ctx.address.clone(),
            incarnation: self.incarnation,
            reason,
            leftover,
        };
        match self.shard_tx.send(stopped) {
            Ok(()) => Vec::new(),
            Err(mpsc::error::SendError(ShardCommand::EntityStopped { leftover, .. })) => leftover,
            Err(_) => Vec::new(),
        }
    }
}

/// Close the mailbox and take the commands still queued in it.
fn unstarted(mailbox: &mut mpsc::UnboundedReceiver<EntityMessage>) -> Vec<IncomingMessage> {
    mailbox.close();
    let mut queued = Vec::new();
    while let Ok(message) = mailbox.try_recv() {
        if let EntityMessage::Command(message) = message {
            queued.push(message);
        }
    }
    queued
}

/// Send the handler's reply to the caller, if it answers this command.
fn complete(message: IncomingMessage, reply: Option<OutgoingReply>) {
    let correlation_id = message.envelope().correlation_id;
    let expects_reply = matches!(message, IncomingMessage::Request { .. });
    match reply {
        Some(reply) if reply.correlation_id == correlation_id => {
            message.reply(Reply::success(reply.correlation_id, reply.payload));
        }
        Some(reply) => {
            tracing::warn!(
                entity_address = %message.envelope().address,
                reply_to = %reply.correlation_id,
                %correlation_id,
                "reply addressed to another exchange, dropped"
            );
            fail_no_reply(message);
        }
        None if expects_reply => fail_no_reply(message),
        None => {}
    }
}

fn fail_no_reply(message: IncomingMessage) {
    let error = ClusterError::DeliveryFailed {
        address: message.envelope().address.clone(),
        kind: FailureKind::NoReply,
        reason: "entity handled the command without replying".to_string(),
    };
    message.fail(&error);
}

/// `initial * 1.5^(attempt - 1)`, capped.
fn recovery_backoff(config: &ShardingConfig, attempt: u32) -> Duration {
    let factor = 1.5f64.powi(attempt.saturating_sub(1) as i32);
    config
        .entity_recovery_initial_backoff
        .mul_f64(factor)
        .min(config.entity_recovery_max_backoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationId;
    use crate::entity::{Effect, PersistentEntity, ReplyTo};
    use crate::entity_runtime::PersistentEntityFactory;
    use crate::envelope::Envelope;
    use crate::registry::PassivationPolicy;
    use crate::reply::ReplyOutcome;
    use crate::storage::memory_journal::MemoryJournal;
    use crate::types::{EntityId, EntityType};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Serialize, Deserialize)]
    enum Cmd {
        Add { amount: i64, reply_to: ReplyTo<i64> },
        Stop,
        Silent,
    }

    #[derive(Serialize, Deserialize)]
    struct Added(i64);

    struct Counter;

    impl PersistentEntity for Counter {
        type Command = Cmd;
        type Event = Added;
        type State = i64;

        fn empty_state(&self) -> i64 {
            0
        }

        fn handle_command(&self, _state: &i64, command: Cmd) -> Effect<Added, i64> {
            match command {
                Cmd::Add { amount, reply_to } => {
                    Effect::persist(Added(amount)).then_reply(&reply_to, |total| *total)
                }
                Cmd::Stop => Effect::stop(),
                Cmd::Silent => Effect::none(),
            }
        }

        fn apply_event(&self, state: i64, event: &Added) -> i64 {
            state + event.0
        }
    }

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    struct Fixture {
        shard: Arc<Shard>,
        ctx: Arc<ShardContext>,
        journal: Arc<MemoryJournal>,
        metrics: Arc<ShardingMetrics>,
        registration: Arc<Registration>,
    }

    fn fixture(passivation: PassivationPolicy, config: ShardingConfig) -> Fixture {
        let journal = Arc::new(MemoryJournal::new());
        let metrics = Arc::new(ShardingMetrics::unregistered());
        let ctx = Arc::new(ShardContext {
            node: NodeAddress::new("127.0.0.1", 9000),
            config: Arc::new(config),
            journal: Arc::clone(&journal) as Arc<dyn EventJournal>,
            metrics: Arc::clone(&metrics),
        });
        let registration = Arc::new(Registration {
            factory: Arc::new(PersistentEntityFactory::new(
                EntityType::new("Counter"),
                |_: &EntityContext| Counter,
            )),
            passivation,
        });
        Fixture {
            shard: Shard::start(ShardId::new(0), Arc::clone(&ctx)),
            ctx,
            journal,
            metrics,
            registration,
        }
    }

    fn fast_retry_config() -> ShardingConfig {
        ShardingConfig {
            entity_recovery_initial_backoff: Duration::from_millis(5),
            entity_recovery_max_backoff: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn address(id: &str) -> EntityAddress {
        EntityAddress {
            shard_id: ShardId::new(0),
            entity_type: EntityType::new("Counter"),
            entity_id: EntityId::new(id),
        }
    }

    impl Fixture {
        fn ask(&self, id: &str, build: impl FnOnce(ReplyTo<i64>) -> Cmd) -> oneshot::Receiver<Reply> {
            let correlation_id = CorrelationId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
            let payload = rmp_serde::to_vec(&build(ReplyTo::new(correlation_id))).unwrap();
            let (message, rx) = IncomingMessage::from_envelope(Envelope {
                correlation_id,
                address: address(id),
                payload,
                expects_reply: true,
            });
            assert!(self
                .shard
                .deliver(message, Arc::clone(&self.registration))
                .is_ok());
            rx.unwrap()
        }

        fn add(&self, id: &str, amount: i64) -> oneshot::Receiver<Reply> {
            self.ask(id, |reply_to| Cmd::Add { amount, reply_to })
        }

        fn tell(&self, id: &str, command: Cmd) {
            let (message, _) = IncomingMessage::from_envelope(Envelope {
                correlation_id: CorrelationId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
                address: address(id),
                payload: rmp_serde::to_vec(&command).unwrap(),
                expects_reply: false,
            });
            assert!(self
                .shard
                .deliver(message, Arc::clone(&self.registration))
                .is_ok());
        }
    }

    async fn value(rx: oneshot::Receiver<Reply>) -> i64 {
        match rx.await.unwrap().outcome {
            ReplyOutcome::Success(bytes) => rmp_serde::from_slice(&bytes).unwrap(),
            ReplyOutcome::Failure { kind, reason } => panic!("{kind:?}: {reason}"),
        }
    }

    async fn failure(rx: oneshot::Receiver<Reply>) -> FailureKind {
        match rx.await.unwrap().outcome {
            ReplyOutcome::Failure { kind, .. } => kind,
            ReplyOutcome::Success(_) => panic!("expected a failure reply"),
        }
    }

    #[tokio::test]
    async fn activates_on_first_message() {
        let f = fixture(PassivationPolicy::Never, ShardingConfig::default());
        assert!(f.shard.active_entities().await.is_empty());
        assert_eq!(value(f.add("a", 2)).await, 2);
        assert_eq!(value(f.add("a", 3)).await, 5);
        assert_eq!(value(f.add("b", 1)).await, 1);
        assert_eq!(f.shard.active_entities().await.len(), 2);
        assert_eq!(f.metrics.entities.get(), 2);
    }

    #[tokio::test]
    async fn idle_entity_is_passivated_and_recovers() {
        let f = fixture(
            PassivationPolicy::IdleTimeout(Duration::from_millis(50)),
            ShardingConfig::default(),
        );
        assert_eq!(value(f.add("a", 4)).await, 4);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(f.shard.active_entities().await.is_empty());
        assert_eq!(f.metrics.passivations.get(), 1);

        assert_eq!(value(f.add("a", 1)).await, 5);
        assert_eq!(f.metrics.recoveries.get(), 2);
    }

    #[tokio::test]
    async fn traffic_keeps_entity_active() {
        let f = fixture(
            PassivationPolicy::IdleTimeout(Duration::from_millis(150)),
            ShardingConfig::default(),
        );
        for _ in 0..5 {
            value(f.add("a", 1)).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(f.shard.active_entities().await.len(), 1);
        assert_eq!(f.metrics.passivations.get(), 0);
    }

    #[tokio::test]
    async fn messages_after_stop_are_replayed_on_fresh_activation() {
        let f = fixture(PassivationPolicy::Never, ShardingConfig::default());
        assert_eq!(value(f.add("a", 1)).await, 1);
        f.tell("a", Cmd::Stop);
        let after_stop = f.add("a", 10);
        assert_eq!(value(after_stop).await, 11);
        assert_eq!(f.metrics.passivations.get(), 1);
        assert_eq!(f.metrics.recoveries.get(), 2);
    }

    #[tokio::test]
    async fn persist_failure_fails_command_and_restarts_entity() {
        let f = fixture(PassivationPolicy::Never, ShardingConfig::default());
        assert_eq!(value(f.add("a", 1)).await, 1);

        f.journal.fail_next_appends(1);
        let failed = f.add("a", 100);
        let queued = f.add("a", 2);
        assert_eq!(failure(failed).await, FailureKind::Persist);
        assert_eq!(value(queued).await, 3);

        let pid = address("a").persistence_id();
        let seqs: Vec<u64> = f.journal.events(&pid).iter().map(|e| e.sequence_nr).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn activation_retries_transient_read_failures() {
        let f = fixture(PassivationPolicy::Never, fast_retry_config());
        f.journal.fail_next_reads(2);
        assert_eq!(value(f.add("a", 7)).await, 7);
    }

    #[tokio::test]
    async fn exhausted_activation_fails_pending_commands() {
        let config = ShardingConfig {
            entity_recovery_max_retries: 1,
            ..fast_retry_config()
        };
        let f = fixture(PassivationPolicy::Never, config);
        f.journal.fail_next_reads(100);
        let first = f.add("a", 1);
        let second = f.add("a", 1);
        assert_eq!(failure(first).await, FailureKind::Recovery);
        assert_eq!(failure(second).await, FailureKind::Recovery);
        assert!(f.journal.events(&address("a").persistence_id()).is_empty());
    }

    #[tokio::test]
    async fn consistency_violation_stops_entity() {
        let f = fixture(PassivationPolicy::Never, ShardingConfig::default());
        assert_eq!(value(f.add("a", 1)).await, 1);
        f.journal.inject_event(
            &address("a").persistence_id(),
            rmp_serde::to_vec(&Added(50)).unwrap(),
        );
        let conflicting = f.add("a", 1);
        let queued = f.add("a", 1);
        assert_eq!(failure(conflicting).await, FailureKind::ConsistencyViolation);
        assert_eq!(failure(queued).await, FailureKind::ConsistencyViolation);

        // The next message activates a fresh runtime that sees the injected event.
        assert_eq!(value(f.add("a", 1)).await, 52);
    }

    #[tokio::test]
    async fn command_without_reply_reports_no_reply() {
        let f = fixture(PassivationPolicy::Never, ShardingConfig::default());
        let rx = f.ask("a", |_| Cmd::Silent);
        assert_eq!(failure(rx).await, FailureKind::NoReply);
    }

    #[tokio::test]
    async fn hand_off_drains_in_flight_commands() {
        let f = fixture(PassivationPolicy::Never, ShardingConfig::default());
        f.journal.set_append_delay(Some(Duration::from_millis(20)));
        let replies: Vec<_> = (0..3).map(|_| f.add("a", 1)).collect();
        let leftover = f.shard.hand_off(Duration::from_secs(5)).await;
        assert!(leftover.is_empty());

        let mut totals = Vec::new();
        for rx in replies {
            totals.push(value(rx).await);
        }
        assert_eq!(totals, vec![1, 2, 3]);
        assert_eq!(f.metrics.entities.get(), 0);
        assert_eq!(f.metrics.shards.get(), 0);

        let (message, _) = IncomingMessage::from_envelope(Envelope {
            correlation_id: CorrelationId(0),
            address: address("a"),
            payload: Vec::new(),
            expects_reply: false,
        });
        assert!(f.shard.deliver(message, Arc::clone(&f.registration)).is_err());
    }

    #[tokio::test]
    async fn hand_off_timeout_returns_unstarted_commands() {
        let f = fixture(PassivationPolicy::Never, ShardingConfig::default());
        f.journal.set_append_delay(Some(Duration::from_millis(200)));
        let in_flight = f.add("a", 1);
        let queued = [f.add("a", 2), f.add("a", 3)];

        let leftover = f.shard.hand_off(Duration::from_millis(50)).await;
        assert_eq!(failure(in_flight).await, FailureKind::Interrupted);
        assert_eq!(leftover.len(), 2);
        assert_eq!(f.metrics.entities.get(), 0);
        assert_eq!(f.metrics.shards.get(), 0);
        let pid = address("a").persistence_id();
        assert!(f.journal.events(&pid).is_empty());

        // The new owner processes them in their original order.
        f.journal.set_append_delay(None);
        let replacement = Shard::start(ShardId::new(0), Arc::clone(&f.ctx));
        for message in leftover {
            assert!(replacement
                .deliver(message, Arc::clone(&f.registration))
                .is_ok());
        }
        let [second, third] = queued;
        assert_eq!(value(second).await, 2);
        assert_eq!(value(third).await, 5);
        let seqs: Vec<u64> = f.journal.events(&pid).iter().map(|e| e.sequence_nr).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = ShardingConfig {
            entity_recovery_initial_backoff: Duration::from_millis(100),
            entity_recovery_max_backoff: Duration::from_millis(200),
            ..Default::default()
        };
        assert_eq!(recovery_backoff(&config, 1), Duration::from_millis(100));
        assert_eq!(recovery_backoff(&config, 2), Duration::from_millis(150));
        assert_eq!(recovery_backoff(&config, 3), Duration::from_millis(200));
        assert_eq!(recovery_backoff(&config, 10), Duration::from_millis(200));
    }
}
