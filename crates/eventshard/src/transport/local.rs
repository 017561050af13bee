use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use crate::envelope::Envelope;
use crate::error::ClusterError;
use crate::message::ReplyReceiver;
use crate::region::ShardRegion;
use crate::transport::NodeTransport;
use crate::types::{NodeAddress, ShardId};

/// In-process transport connecting regions that live in the same process.
///
/// Used for single-node deployments and multi-node tests. Nodes can be
/// disconnected to simulate a network partition or a crashed process.
#[derive(Default)]
pub struct LocalTransport {
    nodes: DashMap<NodeAddress, Weak<ShardRegion>>,
    unreachable: DashSet<NodeAddress>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, region: &Arc<ShardRegion>) {
        self.unreachable.remove(region.node());
        self.nodes
            .insert(region.node().clone(), Arc::downgrade(region));
    }

    /// Make every call to `node` fail with `NodeUnavailable`.
    pub fn disconnect(&self, node: &NodeAddress) {
        self.unreachable.insert(node.clone());
    }

    pub fn reconnect(&self, node: &NodeAddress) {
        self.unreachable.remove(node);
    }

    fn region(&self, node: &NodeAddress) -> Result<Arc<ShardRegion>, ClusterError> {
        let unavailable = || ClusterError::NodeUnavailable {
            node: node.clone(),
            source: None,
        };
        if self.unreachable.contains(node) {
            return Err(unavailable());
        }
        self.nodes
            .get(node)
            .and_then(|region| region.upgrade())
            .filter(|region| !region.is_closing())
            .ok_or_else(unavailable)
    }
}

#[async_trait]
impl NodeTransport for LocalTransport {
    async fn ping(&self, node: &NodeAddress) -> Result<(), ClusterError> {
        self.region(node).map(|_| ())
    }

    async fn send(
        &self,
        node: &NodeAddress,
        envelope: Envelope,
    ) -> Result<Option<ReplyReceiver>, ClusterError> {
        self.region(node)?.handle_remote(envelope).await
    }

    async fn begin_handoff(&self, node: &NodeAddress, shard: ShardId) -> Result<(), ClusterError> {
        self.region(node)?.begin_handoff(shard);
        Ok(())
    }

    async fn hand_off(&self, node: &NodeAddress, shard: ShardId) -> Result<(), ClusterError> {
        self.region(node)?.hand_off_shard(shard).await;
        Ok(())
    }

    async fn host_shard(&self, node: &NodeAddress, shard: ShardId) -> Result<(), ClusterError> {
        self.region(node)?.host_shard(shard);
        Ok(())
    }

    async fn shard_moved(
        &self,
        node: &NodeAddress,
        shard: ShardId,
        owner: &NodeAddress,
    ) -> Result<(), ClusterError> {
        self.region(node)?.shard_moved(shard, owner.clone());
        Ok(())
    }

    async fn hosted_shards(&self, node: &NodeAddress) -> Result<BTreeSet<ShardId>, ClusterError> {
        Ok(self.region(node)?.hosted_shards())
    }

    async fn buffered_shards(
        &self,
        node: &NodeAddress,
    ) -> Result<BTreeSet<ShardId>, ClusterError> {
        Ok(self.region(node)?.buffered_shards())
    }
}
