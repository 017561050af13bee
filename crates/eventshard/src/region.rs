//! Per-node entry point for messages addressed to entities.
//!
//! The region computes the shard of every message, resolves its owner through
//! a cache backed by the coordinator, and hands the message to a local shard
//! or to the owner's region. While a shard is being relocated its messages
//! are parked in a handoff buffer and flushed, in arrival order, once the new
//! owner is announced.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::instrument;

use crate::config::ShardingConfig;
use crate::coordinator::ShardCoordinator;
use crate::correlation::{CorrelationId, CorrelationIdGenerator};
use crate::entity_runtime::EntityFactory;
use crate::envelope::Envelope;
use crate::error::ClusterError;
use crate::hash::shard_for_entity;
use crate::journal::EventJournal;
use crate::message::{IncomingMessage, ReplyReceiver};
use crate::metrics::ShardingMetrics;
use crate::registry::{EntityRegistry, PassivationPolicy};
use crate::reply::FailureKind;
use crate::shard::{Shard, ShardContext};
use crate::transport::NodeTransport;
use crate::types::{EntityAddress, EntityId, EntityType, NodeAddress, ShardId};

pub struct ShardRegion {
    node: NodeAddress,
    config: Arc<ShardingConfig>,
    registry: EntityRegistry,
    shard_ctx: Arc<ShardContext>,
    transport: Arc<dyn NodeTransport>,
    coordinator: parking_lot::RwLock<Option<Arc<ShardCoordinator>>>,
    /// Shards hosted on this node.
    shards: DashMap<ShardId, Arc<Shard>>,
    /// Last known owner per shard. Trusted until a move announcement or a
    /// failed delivery invalidates it.
    allocation_cache: DashMap<ShardId, NodeAddress>,
    buffers: parking_lot::Mutex<HandoffBuffers>,
    /// Messages waiting on owner resolution, per shard, in arrival order.
    /// A shard has an entry while a routing task is draining it.
    pending: parking_lot::Mutex<HashMap<ShardId, VecDeque<IncomingMessage>>>,
    correlation_ids: CorrelationIdGenerator,
    metrics: Arc<ShardingMetrics>,
    closing: AtomicBool,
}

#[derive(Default)]
struct HandoffBuffers {
    by_shard: HashMap<ShardId, HandoffBuffer>,
    total: usize,
}

#[derive(Default)]
struct HandoffBuffer {
    queue: VecDeque<IncomingMessage>,
    flushing: bool,
}

impl ShardRegion {
    pub fn new(
        config: Arc<ShardingConfig>,
        journal: Arc<dyn EventJournal>,
        transport: Arc<dyn NodeTransport>,
        metrics: Arc<ShardingMetrics>,
    ) -> Result<Arc<Self>, ClusterError> {
        config.validate()?;
        let node = config.node_address.clone();
        let shard_ctx = Arc::new(ShardContext {
            node: node.clone(),
            config: Arc::clone(&config),
            journal,
            metrics: Arc::clone(&metrics),
        });
        Ok(Arc::new(Self {
            correlation_ids: CorrelationIdGenerator::new(&node),
            node,
            config,
            registry: EntityRegistry::new(),
            shard_ctx,
            transport,
            coordinator: parking_lot::RwLock::new(None),
            shards: DashMap::new(),
            allocation_cache: DashMap::new(),
            buffers: parking_lot::Mutex::new(HandoffBuffers::default()),
            pending: parking_lot::Mutex::new(HashMap::new()),
            metrics,
            closing: AtomicBool::new(false),
        }))
    }

    pub fn node(&self) -> &NodeAddress {
        &self.node
    }

    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ShardingMetrics {
        &self.metrics
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Point the region at a (new) coordinator. Cached allocations are kept;
    /// the coordinator's start-up announcement refreshes them.
    pub fn attach_coordinator(&self, coordinator: Arc<ShardCoordinator>) {
        *self.coordinator.write() = Some(coordinator);
    }

    pub fn register(
        &self,
        factory: Arc<dyn EntityFactory>,
        passivation: PassivationPolicy,
    ) -> Result<(), ClusterError> {
        tracing::debug!(node = %self.node, entity_type = %factory.entity_type(), "registering entity type");
        self.registry.register(factory, passivation)
    }

    pub fn next_correlation_id(&self) -> CorrelationId {
        self.correlation_ids.next()
    }

    pub fn entity_address(&self, entity_type: &EntityType, entity_id: &EntityId) -> EntityAddress {
        EntityAddress {
            shard_id: shard_for_entity(entity_id, self.config.number_of_shards),
            entity_type: entity_type.clone(),
            entity_id: entity_id.clone(),
        }
    }

    /// Accept an envelope for routing. For asks, the receiver completes with
    /// the entity's reply or a failure.
    ///
    /// Returns as soon as the region owns the message: it is handed to a
    /// hosted shard, parked in a handoff buffer, or queued behind earlier
    /// messages for the same shard while a task resolves the owner. Only a
    /// closing region or a full handoff buffer fail here.
    pub fn deliver(
        self: &Arc<Self>,
        envelope: Envelope,
    ) -> Result<Option<ReplyReceiver>, ClusterError> {
        if self.is_closing() {
            return Err(ClusterError::ShuttingDown);
        }
        let shard_id = envelope.address.shard_id;
        let (message, reply_rx) = IncomingMessage::from_envelope(envelope);

        let mut pending = self.pending.lock();
        if let Some(queue) = pending.get_mut(&shard_id) {
            queue.push_back(message);
            return Ok(reply_rx);
        }
        let Some(message) = self.buffer_if_handing_off(message)? else {
            return Ok(reply_rx);
        };
        let Err(message) = self.deliver_hosted(message) else {
            return Ok(reply_rx);
        };
        pending.insert(shard_id, VecDeque::from([message]));
        drop(pending);

        let region = Arc::clone(self);
        tokio::spawn(async move { region.drain_pending(shard_id).await });
        Ok(reply_rx)
    }

    /// Hand `message` to its shard if this node is its known owner and the
    /// entity type is registered. Anything that needs waiting is returned.
    fn deliver_hosted(&self, message: IncomingMessage) -> Result<(), IncomingMessage> {
        let address = &message.envelope().address;
        let owned_here = self
            .allocation_cache
            .get(&address.shard_id)
            .is_some_and(|owner| *owner == self.node);
        if !owned_here {
            return Err(message);
        }
        let shard = self.shards.get(&address.shard_id).map(|e| Arc::clone(e.value()));
        match (shard, self.registry.get(&address.entity_type)) {
            (Some(shard), Some(registration)) => shard.deliver(message, registration),
            _ => Err(message),
        }
    }

    async fn drain_pending(&self, shard: ShardId) {
        loop {
            let next = {
                let mut pending = self.pending.lock();
                let Some(queue) = pending.get_mut(&shard) else {
                    break;
                };
                match queue.pop_front() {
                    Some(message) => message,
                    None => {
                        pending.remove(&shard);
                        break;
                    }
                }
            };
            if let Err(e) = self.route(next, true).await {
                tracing::debug!(shard_id = %shard, error = %e, "message not delivered");
            }
        }
    }

    /// Entry point for envelopes forwarded by another node's region.
    #[instrument(skip_all, fields(node = %self.node, entity_address = %envelope.address))]
    pub async fn handle_remote(
        &self,
        envelope: Envelope,
    ) -> Result<Option<ReplyReceiver>, ClusterError> {
        if self.is_closing() {
            return Err(ClusterError::NodeUnavailable {
                node: self.node.clone(),
                source: None,
            });
        }
        let shard_id = envelope.address.shard_id;
        let (message, reply_rx) = IncomingMessage::from_envelope(envelope);
        let Some(message) = self.buffer_if_handing_off(message)? else {
            return Ok(reply_rx);
        };
        if !self.shards.contains_key(&shard_id) {
            return Err(self.not_hosted(shard_id));
        }
        self.deliver_local(message).await.map_err(|(_, e)| e)?;
        Ok(reply_rx)
    }

    /// Start buffering messages for `shard` and forget its cached owner.
    pub fn begin_handoff(&self, shard: ShardId) {
        self.allocation_cache.remove(&shard);
        let mut buffers = self.buffers.lock();
        let buffer = buffers.by_shard.entry(shard).or_default();
        // A pending flush would route to the old owner.
        buffer.flushing = false;
        tracing::debug!(node = %self.node, shard_id = %shard, "buffering shard for handoff");
    }

    /// Stop hosting `shard` after its entities finish in-flight commands.
    /// Messages the shard never handed to an entity go back into the buffer,
    /// ahead of anything buffered since.
    #[instrument(skip(self), fields(node = %self.node, shard_id = %shard))]
    pub async fn hand_off_shard(&self, shard: ShardId) {
        self.begin_handoff(shard);
        let Some((_, hosted)) = self.shards.remove(&shard) else {
            return;
        };
        let leftover = hosted.hand_off(self.config.handoff_timeout).await;
        tracing::debug!(leftover = leftover.len(), "shard handed off");
        if leftover.is_empty() {
            return;
        }
        let count = leftover.len();
        let mut buffers = self.buffers.lock();
        buffers.total += count;
        let buffer = buffers.by_shard.entry(shard).or_default();
        for message in leftover.into_iter().rev() {
            buffer.queue.push_front(message);
        }
        self.metrics.buffered_messages.add(count as i64);
    }

    /// Start hosting `shard`. Idempotent.
    pub fn host_shard(&self, shard: ShardId) {
        if self.is_closing() {
            return;
        }
        self.shards
            .entry(shard)
            .or_insert_with(|| Shard::start(shard, Arc::clone(&self.shard_ctx)));
        self.allocation_cache.insert(shard, self.node.clone());
        tracing::debug!(node = %self.node, shard_id = %shard, "hosting shard");
    }

    /// Record the owner of `shard` and flush its handoff buffer towards it.
    pub fn shard_moved(self: &Arc<Self>, shard: ShardId, owner: NodeAddress) {
        if owner != self.node {
            if let Some((_, stale)) = self.shards.remove(&shard) {
                tracing::warn!(node = %self.node, shard_id = %shard, owner = %owner, "releasing shard owned elsewhere");
                let region = Arc::clone(self);
                tokio::spawn(async move {
                    let leftover = stale.hand_off(region.config.handoff_timeout).await;
                    for message in leftover {
                        let _ = region.route(message, true).await;
                    }
                });
            }
        }
        self.allocation_cache.insert(shard, owner);

        let start_flush = {
            let mut buffers = self.buffers.lock();
            match buffers.by_shard.get_mut(&shard) {
                Some(buffer) if !buffer.flushing => {
                    buffer.flushing = true;
                    true
                }
                _ => false,
            }
        };
        if start_flush {
            let region = Arc::clone(self);
            tokio::spawn(async move { region.flush(shard).await });
        }
    }

    pub fn hosted_shards(&self) -> BTreeSet<ShardId> {
        self.shards.iter().map(|entry| *entry.key()).collect()
    }

    pub fn buffered_shards(&self) -> BTreeSet<ShardId> {
        self.buffers.lock().by_shard.keys().copied().collect()
    }

    /// Entities currently active on this node.
    pub async fn active_entities(&self) -> Vec<EntityAddress> {
        let shards: Vec<Arc<Shard>> = self.shards.iter().map(|e| Arc::clone(e.value())).collect();
        let mut active = Vec::new();
        for shard in shards {
            active.extend(shard.active_entities().await);
        }
        active
    }

    /// Let running flushes finish, drain every hosted shard, and fail
    /// whatever is still buffered.
    pub async fn shutdown(&self) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        let deadline = tokio::time::Instant::now() + self.config.handoff_timeout;
        while self.is_flushing() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(node = %self.node, shards = self.shards.len(), "shutting down region");
        let hosted: Vec<Arc<Shard>> = self.shards.iter().map(|e| Arc::clone(e.value())).collect();
        self.shards.clear();
        for shard in hosted {
            for message in shard.hand_off(self.config.handoff_timeout).await {
                message.fail(&ClusterError::ShuttingDown);
            }
        }
        let buffered = std::mem::take(&mut *self.buffers.lock());
        self.metrics.buffered_messages.sub(buffered.total as i64);
        for (_, buffer) in buffered.by_shard {
            for message in buffer.queue {
                message.fail(&ClusterError::ShuttingDown);
            }
        }
    }

    fn is_flushing(&self) -> bool {
        self.buffers
            .lock()
            .by_shard
            .values()
            .any(|buffer| buffer.flushing)
    }

    async fn flush(&self, shard: ShardId) {
        let mut flushed = 0usize;
        loop {
            let next = {
                let mut buffers = self.buffers.lock();
                let Some(buffer) = buffers.by_shard.get_mut(&shard) else {
                    break;
                };
                if !buffer.flushing {
                    break;
                }
                match buffer.queue.pop_front() {
                    Some(message) => {
                        buffers.total -= 1;
                        message
                    }
                    None => {
                        buffers.by_shard.remove(&shard);
                        break;
                    }
                }
            };
            self.metrics.buffered_messages.dec();
            flushed += 1;
            if let Err(e) = self.route(next, false).await {
                tracing::debug!(shard_id = %shard, error = %e, "buffered message not delivered");
            }
        }
        tracing::debug!(node = %self.node, shard_id = %shard, flushed, "handoff buffer flushed");
    }

    /// Deliver with cached-then-refreshed owner lookup. Transient failures
    /// invalidate the cache and retry. On final failure the message's caller
    /// is failed and the error is returned.
    #[instrument(
        skip_all,
        fields(
            node = %self.node,
            entity_address = %message.envelope().address,
            correlation_id = %message.envelope().correlation_id
        )
    )]
    async fn route(&self, mut message: IncomingMessage, respect_buffer: bool) -> Result<(), ClusterError> {
        let shard_id = message.envelope().address.shard_id;
        let mut attempt = 0u32;
        loop {
            if self.is_closing() {
                let error = ClusterError::ShuttingDown;
                message.fail(&error);
                return Err(error);
            }
            if respect_buffer {
                match self.buffer_if_handing_off(message)? {
                    Some(unbuffered) => message = unbuffered,
                    None => return Ok(()),
                }
            }
            let error = match self.try_deliver(message).await {
                Ok(()) => return Ok(()),
                Err((returned, error)) => {
                    message = returned;
                    error
                }
            };

            if !error.is_transient() {
                message.fail(&error);
                return Err(error);
            }
            if attempt >= self.config.send_retry_count {
                tracing::error!(attempts = attempt + 1, error = %error, "routing retries exhausted");
                let error = ClusterError::RoutingFailure {
                    shard_id,
                    reason: format!("gave up after {} attempts: {error}", attempt + 1),
                };
                message.fail(&error);
                return Err(error);
            }
            attempt += 1;
            self.allocation_cache.remove(&shard_id);
            tracing::warn!(attempt, error = %error, "routing failed, retrying");
            tokio::time::sleep(self.config.send_retry_interval).await;
        }
    }

    async fn try_deliver(
        &self,
        message: IncomingMessage,
    ) -> Result<(), (IncomingMessage, ClusterError)> {
        let shard_id = message.envelope().address.shard_id;
        let owner = match self.resolve_owner(shard_id).await {
            Ok(owner) => owner,
            Err(e) => return Err((message, e)),
        };
        if owner == self.node {
            self.deliver_local(message).await
        } else {
            self.deliver_remote(&owner, message).await
        }
    }

    async fn resolve_owner(&self, shard_id: ShardId) -> Result<NodeAddress, ClusterError> {
        if let Some(owner) = self.allocation_cache.get(&shard_id) {
            return Ok(owner.clone());
        }
        let coordinator = self.coordinator.read().clone().ok_or_else(|| {
            ClusterError::RoutingFailure {
                shard_id,
                reason: "no coordinator attached".to_string(),
            }
        })?;
        let owner = coordinator.shard_home(shard_id).await?;
        self.allocation_cache.insert(shard_id, owner.clone());
        Ok(owner)
    }

    async fn deliver_local(
        &self,
        message: IncomingMessage,
    ) -> Result<(), (IncomingMessage, ClusterError)> {
        let shard_id = message.envelope().address.shard_id;
        let Some(shard) = self.shards.get(&shard_id).map(|e| Arc::clone(e.value())) else {
            return Err((message, self.not_hosted(shard_id)));
        };
        let entity_type = message.envelope().address.entity_type.clone();
        let registration = match self
            .registry
            .wait_for(&entity_type, self.config.entity_registration_timeout)
            .await
        {
            Ok(registration) => registration,
            Err(e) => return Err((message, e)),
        };
        shard
            .deliver(message, registration)
            .map_err(|message| (message, self.not_hosted(shard_id)))
    }

    async fn deliver_remote(
        &self,
        owner: &NodeAddress,
        message: IncomingMessage,
    ) -> Result<(), (IncomingMessage, ClusterError)> {
        let envelope = message.envelope().clone();
        match self.transport.send(owner, envelope).await {
            Ok(Some(remote_reply)) => {
                let owner = owner.clone();
                tokio::spawn(async move {
                    match remote_reply.await {
                        Ok(reply) => message.reply(reply),
                        Err(_) => {
                            let error = ClusterError::DeliveryFailed {
                                address: message.envelope().address.clone(),
                                kind: FailureKind::Interrupted,
                                reason: format!("{owner} dropped the exchange"),
                            };
                            message.fail(&error);
                        }
                    }
                });
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err((message, e)),
        }
    }

    /// `Ok(None)` if the message was buffered, `Ok(Some)` if its shard is not
    /// in handoff. A full buffer fails the message.
    fn buffer_if_handing_off(
        &self,
        message: IncomingMessage,
    ) -> Result<Option<IncomingMessage>, ClusterError> {
        let shard_id = message.envelope().address.shard_id;
        let mut buffers = self.buffers.lock();
        if !buffers.by_shard.contains_key(&shard_id) {
            return Ok(Some(message));
        }
        if buffers.total >= self.config.buffer_size {
            drop(buffers);
            let error = ClusterError::BufferFull {
                shard_id,
                capacity: self.config.buffer_size,
            };
            tracing::warn!(shard_id = %shard_id, "handoff buffer full, rejecting message");
            message.fail(&error);
            return Err(error);
        }
        buffers.total += 1;
        buffers
            .by_shard
            .entry(shard_id)
            .or_default()
            .queue
            .push_back(message);
        self.metrics.buffered_messages.inc();
        Ok(None)
    }

    fn not_hosted(&self, shard_id: ShardId) -> ClusterError {
        ClusterError::ShardNotHosted {
            shard_id,
            node: self.node.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation_store::AllocationStore;
    use crate::membership::ClusterMembership;
    use crate::storage::memory_allocation::MemoryAllocationStore;
    use crate::storage::memory_journal::MemoryJournal;
    use crate::storage::memory_membership::MemoryMembership;
    use crate::reply::ReplyOutcome;
    use crate::transport::local::LocalTransport;

    async fn single_node(config: ShardingConfig) -> (Arc<ShardRegion>, Arc<ShardCoordinator>) {
        let config = Arc::new(config);
        let transport = Arc::new(LocalTransport::new());
        let region = ShardRegion::new(
            Arc::clone(&config),
            Arc::new(MemoryJournal::new()),
            Arc::clone(&transport) as Arc<dyn NodeTransport>,
            Arc::new(ShardingMetrics::unregistered()),
        )
        .unwrap();
        transport.register(&region);
        let membership = Arc::new(MemoryMembership::new());
        membership.join(config.node_address.clone());
        let coordinator = ShardCoordinator::start(
            config,
            Arc::new(MemoryAllocationStore::new()) as Arc<dyn AllocationStore>,
            membership as Arc<dyn ClusterMembership>,
            transport as Arc<dyn NodeTransport>,
        )
        .await
        .unwrap();
        region.attach_coordinator(Arc::clone(&coordinator));
        (region, coordinator)
    }

    fn tell_envelope(region: &ShardRegion, id: &str) -> Envelope {
        Envelope {
            correlation_id: region.next_correlation_id(),
            address: region.entity_address(&EntityType::new("Unregistered"), &EntityId::new(id)),
            payload: Vec::new(),
            expects_reply: false,
        }
    }

    fn ask_envelope(region: &ShardRegion, id: &str) -> Envelope {
        Envelope {
            expects_reply: true,
            ..tell_envelope(region, id)
        }
    }

    async fn failure_kind(reply_rx: ReplyReceiver) -> FailureKind {
        match reply_rx.await.unwrap().outcome {
            ReplyOutcome::Failure { kind, .. } => kind,
            ReplyOutcome::Success(_) => panic!("expected a failure reply"),
        }
    }

    #[tokio::test]
    async fn unregistered_type_is_rejected_after_timeout() {
        let (region, coordinator) = single_node(ShardingConfig {
            entity_registration_timeout: Duration::from_millis(30),
            ..Default::default()
        })
        .await;
        let reply_rx = region.deliver(ask_envelope(&region, "a")).unwrap().unwrap();
        assert_eq!(failure_kind(reply_rx).await, FailureKind::Rejected);
        // The shard was still allocated and hosted locally.
        assert_eq!(region.hosted_shards().len(), 1);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn deliver_returns_before_the_owner_is_resolved() {
        let (region, coordinator) = single_node(ShardingConfig {
            entity_registration_timeout: Duration::from_millis(200),
            ..Default::default()
        })
        .await;
        let started = tokio::time::Instant::now();
        let first = region.deliver(ask_envelope(&region, "a")).unwrap().unwrap();
        let second = region.deliver(ask_envelope(&region, "a")).unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));

        // Both queue behind the owner lookup and then time out waiting for a registration.
        assert_eq!(failure_kind(first).await, FailureKind::Rejected);
        assert_eq!(failure_kind(second).await, FailureKind::Rejected);
        assert!(region.pending.lock().is_empty());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn handoff_buffer_is_bounded() {
        let (region, coordinator) = single_node(ShardingConfig {
            buffer_size: 2,
            ..Default::default()
        })
        .await;
        let first = tell_envelope(&region, "a");
        let shard = first.address.shard_id;
        region.begin_handoff(shard);

        assert!(region.deliver(first).unwrap().is_none());
        region.deliver(tell_envelope(&region, "a")).unwrap();
        let err = region.deliver(tell_envelope(&region, "a")).unwrap_err();
        assert!(matches!(err, ClusterError::BufferFull { capacity: 2, .. }));
        assert_eq!(err.failure_kind(), FailureKind::Routing);
        assert_eq!(region.buffered_shards(), [shard].into());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_fails_buffered_messages() {
        let (region, coordinator) = single_node(ShardingConfig::default()).await;
        let envelope = ask_envelope(&region, "a");
        region.begin_handoff(envelope.address.shard_id);
        let reply_rx = region.deliver(envelope).unwrap().unwrap();

        region.shutdown().await;
        assert_eq!(failure_kind(reply_rx).await, FailureKind::Interrupted);
        assert!(region.buffered_shards().is_empty());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn remote_delivery_to_non_owner_is_rejected() {
        let (region, coordinator) = single_node(ShardingConfig::default()).await;
        let envelope = tell_envelope(&region, "a");
        let err = region.handle_remote(envelope).await.unwrap_err();
        assert!(matches!(err, ClusterError::ShardNotHosted { .. }));
        coordinator.shutdown().await;
    }
}
