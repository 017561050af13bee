//! Node-to-node communication used by regions and the coordinator.

pub mod local;

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::ClusterError;
use crate::message::ReplyReceiver;
use crate::types::{NodeAddress, ShardId};

#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Ping a node to check liveness.
    async fn ping(&self, node: &NodeAddress) -> Result<(), ClusterError>;

    /// Deliver an envelope to the region on `node`.
    ///
    /// Returns the reply receiver for asks, `None` for tells. Fails with
    /// `ShardNotHosted` if `node` does not own the envelope's shard.
    async fn send(
        &self,
        node: &NodeAddress,
        envelope: Envelope,
    ) -> Result<Option<ReplyReceiver>, ClusterError>;

    /// Tell the region on `node` to start buffering messages for `shard`.
    async fn begin_handoff(&self, node: &NodeAddress, shard: ShardId) -> Result<(), ClusterError>;

    /// Tell the current owner to drain and release `shard`. Completes once the
    /// shard's entities have stopped.
    async fn hand_off(&self, node: &NodeAddress, shard: ShardId) -> Result<(), ClusterError>;

    /// Tell `node` to host `shard`. Completes once it accepts messages.
    async fn host_shard(&self, node: &NodeAddress, shard: ShardId) -> Result<(), ClusterError>;

    /// Announce the new owner of `shard`. Regions update their cache and
    /// flush what they buffered for it.
    async fn shard_moved(
        &self,
        node: &NodeAddress,
        shard: ShardId,
        owner: &NodeAddress,
    ) -> Result<(), ClusterError>;

    /// Shards currently hosted by `node`.
    async fn hosted_shards(&self, node: &NodeAddress) -> Result<BTreeSet<ShardId>, ClusterError>;

    /// Shards `node` is holding handoff buffers for.
    async fn buffered_shards(&self, node: &NodeAddress)
        -> Result<BTreeSet<ShardId>, ClusterError>;
}
