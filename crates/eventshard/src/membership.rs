//! Cluster membership capability. Failure detection and quorum are the
//! provider's business; the coordinator only consumes join and leave events.

use std::collections::BTreeSet;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ClusterError;
use crate::types::NodeAddress;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(NodeAddress),
    /// The node left or was declared unreachable by the provider.
    Left(NodeAddress),
}

pub type MembershipStream = Pin<Box<dyn Stream<Item = MembershipEvent> + Send>>;

#[async_trait]
pub trait ClusterMembership: Send + Sync {
    async fn current_members(&self) -> Result<BTreeSet<NodeAddress>, ClusterError>;

    /// Events after the call. Pair with `current_members` for the starting point.
    async fn subscribe(&self) -> Result<MembershipStream, ClusterError>;

    /// The node that should run the coordinator, if any member exists.
    async fn leader(&self) -> Result<Option<NodeAddress>, ClusterError>;
}
