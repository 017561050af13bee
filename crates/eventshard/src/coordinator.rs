//! The shard coordinator: sole owner of the shard allocation table.
//!
//! Allocation happens lazily on the first message for a shard. Relocation
//! (rebalance, graceful leave, member loss) always runs the same sequence:
//! every region starts buffering the shard, the previous owner drains it, the
//! new owner is picked and persisted, the new owner starts hosting, and only
//! then does every region learn the new owner and flush its buffer. No two
//! nodes host the shard at the same time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::allocation::{LeastShardAllocationStrategy, ShardsByNode};
use crate::allocation_store::{AllocationStore, CoordinatorState};
use crate::config::ShardingConfig;
use crate::error::ClusterError;
use crate::membership::{ClusterMembership, MembershipEvent, MembershipStream};
use crate::transport::NodeTransport;
use crate::types::{NodeAddress, ShardId};

pub struct ShardCoordinator {
    config: Arc<ShardingConfig>,
    strategy: LeastShardAllocationStrategy,
    store: Arc<dyn AllocationStore>,
    membership: Arc<dyn ClusterMembership>,
    transport: Arc<dyn NodeTransport>,
    inner: tokio::sync::Mutex<Inner>,
    /// Signalled whenever a relocation finishes.
    relocated: Notify,
    cancel: CancellationToken,
    background_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    state: CoordinatorState,
    in_progress: BTreeSet<ShardId>,
    /// Members being drained before they leave. They receive no new shards.
    leaving: BTreeSet<NodeAddress>,
}

impl Inner {
    fn placement_view(&self) -> ShardsByNode {
        let mut view = self.state.shards_by_node();
        view.retain(|node, _| self.state.nodes.contains(node) && !self.leaving.contains(node));
        view
    }
}

impl ShardCoordinator {
    /// Recover the allocation table, announce it to every region, and start
    /// following membership changes.
    #[instrument(skip_all)]
    pub async fn start(
        config: Arc<ShardingConfig>,
        store: Arc<dyn AllocationStore>,
        membership: Arc<dyn ClusterMembership>,
        transport: Arc<dyn NodeTransport>,
    ) -> Result<Arc<Self>, ClusterError> {
        config.validate()?;
        let events = membership.subscribe().await?;
        let members = membership.current_members().await?;
        let state = recover_state(store.as_ref(), transport.as_ref(), &members).await;

        let coordinator = Arc::new(Self {
            strategy: LeastShardAllocationStrategy::new(
                config.rebalance_threshold,
                config.max_simultaneous_rebalance,
            ),
            config,
            store,
            membership,
            transport,
            inner: tokio::sync::Mutex::new(Inner {
                state,
                in_progress: BTreeSet::new(),
                leaving: BTreeSet::new(),
            }),
            relocated: Notify::new(),
            cancel: CancellationToken::new(),
            background_tasks: parking_lot::Mutex::new(Vec::new()),
        });

        {
            let mut inner = coordinator.inner.lock().await;
            inner.state.version += 1;
            coordinator.persist(&inner.state).await;
        }
        coordinator.announce().await;

        let watcher = tokio::spawn(Arc::clone(&coordinator).watch_membership(events));
        let rebalancer = tokio::spawn(Arc::clone(&coordinator).rebalance_loop());
        coordinator
            .background_tasks
            .lock()
            .extend([watcher, rebalancer]);
        Ok(coordinator)
    }

    /// Owner of `shard`, allocating it to the least loaded node if it has none.
    /// The returned node is already hosting the shard.
    #[instrument(skip(self), fields(shard_id = %shard))]
    pub async fn shard_home(&self, shard: ShardId) -> Result<NodeAddress, ClusterError> {
        let mut inner = self.inner.lock().await;
        if let Some(owner) = inner.state.allocations.get(&shard) {
            return Ok(owner.clone());
        }
        if inner.in_progress.contains(&shard) {
            return Err(ClusterError::ShardNotHosted {
                shard_id: shard,
                node: self.config.node_address.clone(),
            });
        }
        let owner = self
            .strategy
            .allocate_shard(&inner.placement_view())
            .ok_or_else(|| ClusterError::RoutingFailure {
                shard_id: shard,
                reason: "no nodes available to host the shard".to_string(),
            })?;
        self.transport.host_shard(&owner, shard).await?;

        inner.state.allocations.insert(shard, owner.clone());
        inner.state.version += 1;
        self.persist(&inner.state).await;
        tracing::debug!(node = %owner, "allocated shard");
        Ok(owner)
    }

    pub async fn allocations(&self) -> BTreeMap<ShardId, NodeAddress> {
        self.inner.lock().await.state.allocations.clone()
    }

    /// Move every shard off `node` with a full drain, and stop placing shards
    /// there. Call before the node leaves the cluster.
    #[instrument(skip(self), fields(node = %node))]
    pub async fn drain_node(&self, node: &NodeAddress) -> Result<(), ClusterError> {
        let shards = {
            let mut inner = self.inner.lock().await;
            inner.leaving.insert(node.clone());
            owned_by(&inner.state, node)
        };
        for shard in shards {
            self.relocate(shard, node, true).await?;
        }
        self.wait_for_relocations().await;
        Ok(())
    }

    /// Bring the node set in line with the membership provider. Idempotent.
    pub async fn reconcile_membership(&self) -> Result<(), ClusterError> {
        let members = self.membership.current_members().await?;
        let known = self.inner.lock().await.state.nodes.clone();
        for node in known.difference(&members) {
            self.on_member_left(node).await;
        }
        for node in members.difference(&known) {
            self.on_member_joined(node).await;
        }
        self.wait_for_relocations().await;
        Ok(())
    }

    /// Move shards off overloaded nodes. Returns the number of shards moved.
    #[instrument(skip(self))]
    pub async fn rebalance(&self) -> Result<usize, ClusterError> {
        let moves: Vec<(ShardId, NodeAddress)> = {
            let inner = self.inner.lock().await;
            self.strategy
                .rebalance(&inner.placement_view(), &inner.in_progress)
                .into_iter()
                .filter_map(|shard| {
                    inner
                        .state
                        .allocations
                        .get(&shard)
                        .map(|owner| (shard, owner.clone()))
                })
                .collect()
        };
        if moves.is_empty() {
            return Ok(0);
        }
        tracing::debug!(shards = moves.len(), "rebalancing");
        let results = futures::future::join_all(
            moves
                .iter()
                .map(|(shard, owner)| self.relocate(*shard, owner, true)),
        )
        .await;
        let mut moved = 0;
        for result in results {
            if result?.is_some() {
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Relocate shards of departed nodes and rebalance until no further move
    /// is planned and nothing is in flight.
    pub async fn settle(&self) -> Result<(), ClusterError> {
        loop {
            self.wait_for_relocations().await;
            let (orphaned, settled) = {
                let inner = self.inner.lock().await;
                let orphaned: Vec<(ShardId, NodeAddress)> = inner
                    .state
                    .allocations
                    .iter()
                    .filter(|(_, owner)| !inner.state.nodes.contains(*owner))
                    .map(|(shard, owner)| (*shard, owner.clone()))
                    .collect();
                let settled = orphaned.is_empty()
                    && inner.in_progress.is_empty()
                    && self
                        .strategy
                        .rebalance(&inner.placement_view(), &inner.in_progress)
                        .is_empty();
                (orphaned, settled)
            };
            if settled {
                return Ok(());
            }
            for (shard, from) in orphaned {
                self.relocate(shard, &from, false).await?;
            }
            self.rebalance().await?;
        }
    }

    /// Stop background tasks. Hosted shards are unaffected.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.background_tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn on_member_joined(&self, node: &NodeAddress) {
        {
            let mut inner = self.inner.lock().await;
            inner.leaving.remove(node);
            if !inner.state.nodes.insert(node.clone()) {
                return;
            }
            inner.state.version += 1;
            self.persist(&inner.state).await;
        }
        tracing::info!(node = %node, "node joined");
        if let Err(e) = self.rebalance().await {
            tracing::warn!(node = %node, error = %e, "rebalance after join failed");
        }
    }

    /// The node is gone: its shards move without a drain.
    async fn on_member_left(&self, node: &NodeAddress) {
        let shards = {
            let mut inner = self.inner.lock().await;
            inner.leaving.remove(node);
            if !inner.state.nodes.remove(node) {
                return;
            }
            inner.state.version += 1;
            self.persist(&inner.state).await;
            owned_by(&inner.state, node)
        };
        tracing::info!(node = %node, shards = shards.len(), "node left, relocating its shards");
        for shard in shards {
            if let Err(e) = self.relocate(shard, node, false).await {
                tracing::error!(shard_id = %shard, error = %e, "relocating shard of departed node failed");
            }
        }
    }

    /// Returns the new owner, or `None` if the shard is not owned by `from`
    /// or is already moving.
    #[instrument(skip(self), fields(shard_id = %shard, from = %from))]
    async fn relocate(
        &self,
        shard: ShardId,
        from: &NodeAddress,
        drain: bool,
    ) -> Result<Option<NodeAddress>, ClusterError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.in_progress.contains(&shard) || inner.state.allocations.get(&shard) != Some(from)
            {
                return Ok(None);
            }
            inner.in_progress.insert(shard);
        }
        let result = self.move_shard(shard, from, drain).await;
        self.inner.lock().await.in_progress.remove(&shard);
        self.relocated.notify_waiters();
        result.map(Some)
    }

    async fn move_shard(
        &self,
        shard: ShardId,
        from: &NodeAddress,
        drain: bool,
    ) -> Result<NodeAddress, ClusterError> {
        let mut notify: BTreeSet<NodeAddress> = self.inner.lock().await.state.nodes.clone();
        notify.insert(from.clone());
        for node in &notify {
            if let Err(e) = self.transport.begin_handoff(node, shard).await {
                tracing::debug!(node = %node, error = %e, "begin handoff not delivered");
            }
        }

        if drain {
            if let Err(e) = self.transport.hand_off(from, shard).await {
                tracing::warn!(error = %e, "previous owner unreachable, relocating without drain");
            }
        }

        let owner = {
            let mut inner = self.inner.lock().await;
            inner.state.allocations.remove(&shard);
            let owner = self.strategy.allocate_shard(&inner.placement_view());
            if let Some(owner) = &owner {
                inner.state.allocations.insert(shard, owner.clone());
            }
            inner.state.version += 1;
            self.persist(&inner.state).await;
            owner.ok_or_else(|| ClusterError::RoutingFailure {
                shard_id: shard,
                reason: "no nodes available to host the shard".to_string(),
            })?
        };

        if let Err(e) = self.transport.host_shard(&owner, shard).await {
            tracing::error!(node = %owner, error = %e, "new owner did not accept the shard");
        }
        for node in &notify {
            if let Err(e) = self.transport.shard_moved(node, shard, &owner).await {
                tracing::debug!(node = %node, error = %e, "shard move announcement not delivered");
            }
        }
        tracing::info!(to = %owner, "shard relocated");
        Ok(owner)
    }

    async fn wait_for_relocations(&self) {
        loop {
            let notified = self.relocated.notified();
            if self.inner.lock().await.in_progress.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Make every owner host its shards and every region learn the table,
    /// then resolve shards regions are still buffering for.
    async fn announce(&self) {
        let (allocations, nodes) = {
            let inner = self.inner.lock().await;
            (inner.state.allocations.clone(), inner.state.nodes.clone())
        };
        for (shard, owner) in &allocations {
            if let Err(e) = self.transport.host_shard(owner, *shard).await {
                tracing::warn!(shard_id = %shard, node = %owner, error = %e, "owner did not confirm hosting");
            }
        }
        for node in &nodes {
            for (shard, owner) in &allocations {
                if let Err(e) = self.transport.shard_moved(node, *shard, owner).await {
                    tracing::debug!(node = %node, error = %e, "announcement not delivered");
                    break;
                }
            }
        }

        let mut orphaned = BTreeSet::new();
        for node in &nodes {
            if let Ok(buffered) = self.transport.buffered_shards(node).await {
                orphaned.extend(buffered.into_iter().filter(|s| !allocations.contains_key(s)));
            }
        }
        for shard in orphaned {
            match self.shard_home(shard).await {
                Ok(owner) => {
                    for node in &nodes {
                        let _ = self.transport.shard_moved(node, shard, &owner).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(shard_id = %shard, error = %e, "could not place buffered shard");
                }
            }
        }
    }

    async fn watch_membership(self: Arc<Self>, mut events: MembershipStream) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(MembershipEvent::Joined(node)) => self.on_member_joined(&node).await,
                    Some(MembershipEvent::Left(node)) => self.on_member_left(&node).await,
                    None => break,
                },
            }
        }
    }

    async fn rebalance_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.rebalance_interval) => {}
            }
            if let Err(e) = self.rebalance().await {
                tracing::warn!(error = %e, "periodic rebalance failed");
            }
        }
    }

    /// Store failures are logged: the in-memory table stays authoritative and
    /// the next successful save carries every change.
    async fn persist(&self, state: &CoordinatorState) {
        if let Err(e) = self.store.save(state).await {
            tracing::error!(version = state.version, error = %e, "persisting allocation table failed");
        }
    }
}

fn owned_by(state: &CoordinatorState, node: &NodeAddress) -> Vec<ShardId> {
    state
        .allocations
        .iter()
        .filter(|(_, owner)| *owner == node)
        .map(|(shard, _)| *shard)
        .collect()
}

/// Persisted table if every owner it names is a member that answers a ping,
/// otherwise rebuilt by asking each reachable member which shards it hosts.
async fn recover_state(
    store: &dyn AllocationStore,
    transport: &dyn NodeTransport,
    members: &BTreeSet<NodeAddress>,
) -> CoordinatorState {
    let previous_version = match store.load().await {
        Ok(Some(state)) if state.references_non_members(members) => {
            tracing::warn!(
                version = state.version,
                "persisted allocation table references departed nodes, rebuilding"
            );
            state.version
        }
        Ok(Some(mut state)) => {
            let unreachable = unreachable_owners(transport, &state).await;
            if unreachable.is_empty() {
                tracing::info!(
                    version = state.version,
                    shards = state.allocations.len(),
                    "recovered allocation table"
                );
                state.nodes = members.clone();
                return state;
            }
            tracing::warn!(
                version = state.version,
                unreachable = ?unreachable,
                "persisted allocation table names unreachable nodes, rebuilding"
            );
            state.version
        }
        Ok(None) => 0,
        Err(e) => {
            tracing::warn!(error = %e, "loading allocation table failed, rebuilding");
            0
        }
    };

    let mut state = CoordinatorState {
        nodes: members.clone(),
        version: previous_version,
        ..Default::default()
    };
    for node in members {
        let hosted = match transport.hosted_shards(node).await {
            Ok(hosted) => hosted,
            Err(e) => {
                tracing::warn!(node = %node, error = %e, "could not query hosted shards");
                continue;
            }
        };
        for shard in hosted {
            if let Some(owner) = state.allocations.get(&shard) {
                // Keep the first claimant; the duplicate releases the shard.
                tracing::error!(shard_id = %shard, kept = %owner, released = %node, "shard hosted twice");
                if let Err(e) = transport.hand_off(node, shard).await {
                    tracing::warn!(node = %node, error = %e, "releasing duplicate shard failed");
                }
                continue;
            }
            state.allocations.insert(shard, node.clone());
        }
    }
    tracing::info!(shards = state.allocations.len(), "rebuilt allocation table from live nodes");
    state
}

async fn unreachable_owners(
    transport: &dyn NodeTransport,
    state: &CoordinatorState,
) -> BTreeSet<NodeAddress> {
    let owners: BTreeSet<&NodeAddress> = state.allocations.values().collect();
    let mut unreachable = BTreeSet::new();
    for owner in owners {
        if let Err(e) = transport.ping(owner).await {
            tracing::debug!(node = %owner, error = %e, "ping failed");
            unreachable.insert(owner.clone());
        }
    }
    unreachable
}
