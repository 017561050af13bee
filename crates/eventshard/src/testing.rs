//! In-process multi-node cluster for unit and integration testing.
//!
//! Every node is a full [`ShardRegion`] wired to shared in-memory storage
//! (journal, allocation store, membership) and a [`LocalTransport`]. Nodes
//! can be added, drained, crashed and disconnected, and the coordinator can
//! be restarted, all from a single test.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::allocation_store::AllocationStore;
use crate::config::ShardingConfig;
use crate::coordinator::ShardCoordinator;
use crate::entity::{EntityContext, PersistentEntity};
use crate::error::ClusterError;
use crate::journal::EventJournal;
use crate::membership::ClusterMembership;
use crate::metrics::ShardingMetrics;
use crate::region::ShardRegion;
use crate::registry::PassivationPolicy;
use crate::sharding::{ClusterSharding, EntityTypeKey};
use crate::storage::memory_allocation::MemoryAllocationStore;
use crate::storage::memory_journal::MemoryJournal;
use crate::storage::memory_membership::MemoryMembership;
use crate::transport::local::LocalTransport;
use crate::transport::NodeTransport;
use crate::types::NodeAddress;

type Registrar = Box<dyn Fn(&ClusterSharding) -> Result<(), ClusterError> + Send + Sync>;

/// An in-memory cluster of one or more nodes.
///
/// # Example
///
/// ```ignore
/// let cluster = TestCluster::with_nodes(2).await;
/// cluster.register(&key, |_| HelloWorld, PassivationPolicy::Default).unwrap();
/// let greeter = cluster.sharding().entity_ref_for(&key, "world-1");
/// let reply = greeter.ask(|reply_to| Command::Greet { whom: "alice".into(), reply_to }, timeout).await?;
/// cluster.shutdown().await;
/// ```
pub struct TestCluster {
    template: ShardingConfig,
    journal: Arc<MemoryJournal>,
    membership: Arc<MemoryMembership>,
    store: Arc<MemoryAllocationStore>,
    transport: Arc<LocalTransport>,
    nodes: parking_lot::Mutex<BTreeMap<NodeAddress, ClusterSharding>>,
    coordinator: parking_lot::RwLock<Arc<ShardCoordinator>>,
    registrars: parking_lot::Mutex<Vec<Registrar>>,
    next_port: parking_lot::Mutex<u16>,
}

impl TestCluster {
    /// A single node with default configuration.
    pub async fn new() -> Self {
        Self::with_config(ShardingConfig::default()).await
    }

    pub async fn with_config(config: ShardingConfig) -> Self {
        Self::with_nodes_and_config(1, config).await
    }

    pub async fn with_nodes(count: usize) -> Self {
        Self::with_nodes_and_config(count, ShardingConfig::default()).await
    }

    /// `count` nodes on consecutive ports starting at `config.node_address`.
    /// All nodes join before the coordinator starts, so no rebalance runs
    /// during construction.
    pub async fn with_nodes_and_config(count: usize, config: ShardingConfig) -> Self {
        let journal = Arc::new(MemoryJournal::new());
        let membership = Arc::new(MemoryMembership::new());
        let store = Arc::new(MemoryAllocationStore::new());
        let transport = Arc::new(LocalTransport::new());

        let mut nodes = BTreeMap::new();
        let mut port = config.node_address.port;
        for _ in 0..count.max(1) {
            let node = NodeAddress::new(config.node_address.host.clone(), port);
            port += 1;
            let sharding = build_node(&config, &node, &journal, &transport);
            membership.join(node.clone());
            nodes.insert(node, sharding);
        }

        let coordinator = start_coordinator(&config, &store, &membership, &transport)
            .await
            .expect("TestCluster coordinator should start");
        for sharding in nodes.values() {
            sharding.region().attach_coordinator(Arc::clone(&coordinator));
        }

        Self {
            template: config,
            journal,
            membership,
            store,
            transport,
            nodes: parking_lot::Mutex::new(nodes),
            coordinator: parking_lot::RwLock::new(coordinator),
            registrars: parking_lot::Mutex::new(Vec::new()),
            next_port: parking_lot::Mutex::new(port),
        }
    }

    /// Register an entity type on every current and future node.
    pub fn register<B, F>(
        &self,
        key: &EntityTypeKey<B>,
        factory: F,
        passivation: PassivationPolicy,
    ) -> Result<(), ClusterError>
    where
        B: PersistentEntity,
        F: Fn(&EntityContext) -> B + Clone + Send + Sync + 'static,
    {
        let key = key.clone();
        let registrar: Registrar = Box::new(move |sharding: &ClusterSharding| {
            sharding.register(&key, factory.clone(), passivation)
        });
        for sharding in self.nodes.lock().values() {
            registrar(sharding)?;
        }
        self.registrars.lock().push(registrar);
        Ok(())
    }

    /// Sharding facade of the lowest-addressed node.
    pub fn sharding(&self) -> ClusterSharding {
        self.nodes
            .lock()
            .values()
            .next()
            .cloned()
            .expect("TestCluster always has a node")
    }

    pub fn node(&self, node: &NodeAddress) -> Option<ClusterSharding> {
        self.nodes.lock().get(node).cloned()
    }

    pub fn node_addresses(&self) -> Vec<NodeAddress> {
        self.nodes.lock().keys().cloned().collect()
    }

    pub fn journal(&self) -> &Arc<MemoryJournal> {
        &self.journal
    }

    pub fn allocation_store(&self) -> &Arc<MemoryAllocationStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    pub fn coordinator(&self) -> Arc<ShardCoordinator> {
        Arc::clone(&self.coordinator.read())
    }

    /// Start a node, register every known entity type on it, and let the
    /// coordinator rebalance towards it.
    pub async fn add_node(&self) -> Result<NodeAddress, ClusterError> {
        let node = {
            let mut port = self.next_port.lock();
            let node = NodeAddress::new(self.template.node_address.host.clone(), *port);
            *port += 1;
            node
        };
        let sharding = build_node(&self.template, &node, &self.journal, &self.transport);
        for registrar in self.registrars.lock().iter() {
            registrar(&sharding)?;
        }
        sharding.region().attach_coordinator(self.coordinator());
        self.nodes.lock().insert(node.clone(), sharding);
        self.membership.join(node.clone());
        let coordinator = self.coordinator();
        coordinator.reconcile_membership().await?;
        coordinator.settle().await?;
        Ok(node)
    }

    /// Graceful leave: drain the node's shards onto the others, then stop it.
    pub async fn remove_node(&self, node: &NodeAddress) -> Result<(), ClusterError> {
        let coordinator = self.coordinator();
        coordinator.drain_node(node).await?;
        self.membership.leave(node);
        coordinator.reconcile_membership().await?;
        let removed = self.nodes.lock().remove(node);
        if let Some(sharding) = removed {
            sharding.shutdown().await;
        }
        Ok(())
    }

    /// Abrupt loss: the node becomes unreachable and its shards move
    /// without a drain.
    pub async fn crash_node(&self, node: &NodeAddress) -> Result<(), ClusterError> {
        self.transport.disconnect(node);
        let removed = self.nodes.lock().remove(node);
        if let Some(sharding) = removed {
            sharding.shutdown().await;
        }
        self.membership.leave(node);
        let coordinator = self.coordinator();
        coordinator.reconcile_membership().await?;
        coordinator.settle().await
    }

    /// Stop the coordinator and start a fresh one from the allocation store.
    pub async fn restart_coordinator(&self) -> Result<Arc<ShardCoordinator>, ClusterError> {
        self.coordinator().shutdown().await;
        let coordinator =
            start_coordinator(&self.template, &self.store, &self.membership, &self.transport)
                .await?;
        for sharding in self.nodes.lock().values() {
            sharding.region().attach_coordinator(Arc::clone(&coordinator));
        }
        *self.coordinator.write() = Arc::clone(&coordinator);
        Ok(coordinator)
    }

    pub async fn shutdown(&self) {
        self.coordinator().shutdown().await;
        let nodes: Vec<ClusterSharding> = self.nodes.lock().values().cloned().collect();
        for sharding in nodes {
            sharding.shutdown().await;
        }
    }
}

fn build_node(
    template: &ShardingConfig,
    node: &NodeAddress,
    journal: &Arc<MemoryJournal>,
    transport: &Arc<LocalTransport>,
) -> ClusterSharding {
    let config = Arc::new(ShardingConfig {
        node_address: node.clone(),
        ..template.clone()
    });
    let region = ShardRegion::new(
        config,
        Arc::clone(journal) as Arc<dyn EventJournal>,
        Arc::clone(transport) as Arc<dyn NodeTransport>,
        Arc::new(ShardingMetrics::unregistered()),
    )
    .expect("TestCluster config should be valid");
    transport.register(&region);
    ClusterSharding::new(region)
}

async fn start_coordinator(
    template: &ShardingConfig,
    store: &Arc<MemoryAllocationStore>,
    membership: &Arc<MemoryMembership>,
    transport: &Arc<LocalTransport>,
) -> Result<Arc<ShardCoordinator>, ClusterError> {
    ShardCoordinator::start(
        Arc::new(template.clone()),
        Arc::clone(store) as Arc<dyn AllocationStore>,
        Arc::clone(membership) as Arc<dyn ClusterMembership>,
        Arc::clone(transport) as Arc<dyn NodeTransport>,
    )
    .await
}
