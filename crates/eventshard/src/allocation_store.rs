use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::allocation::ShardsByNode;
use crate::error::ClusterError;
use crate::types::{NodeAddress, ShardId};

/// Everything the coordinator must survive a restart with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorState {
    pub allocations: BTreeMap<ShardId, NodeAddress>,
    /// Nodes known to host regions.
    pub nodes: BTreeSet<NodeAddress>,
    /// Incremented on every persisted change.
    pub version: u64,
}

impl CoordinatorState {
    /// Allocations grouped by node, including nodes that own no shard.
    pub fn shards_by_node(&self) -> ShardsByNode {
        let mut by_node: ShardsByNode = self
            .nodes
            .iter()
            .map(|node| (node.clone(), BTreeSet::new()))
            .collect();
        for (shard, node) in &self.allocations {
            by_node.entry(node.clone()).or_default().insert(*shard);
        }
        by_node
    }

    /// `true` if an allocation points at a node outside `members`.
    pub fn references_non_members(&self, members: &BTreeSet<NodeAddress>) -> bool {
        self.allocations.values().any(|node| !members.contains(node))
    }
}

/// Durable home of the coordinator state.
#[async_trait]
pub trait AllocationStore: Send + Sync {
    /// Returns `None` if nothing has been saved yet.
    async fn load(&self) -> Result<Option<CoordinatorState>, ClusterError>;

    async fn save(&self, state: &CoordinatorState) -> Result<(), ClusterError>;
}
