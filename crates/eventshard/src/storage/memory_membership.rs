use std::collections::BTreeSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::ClusterError;
use crate::membership::{ClusterMembership, MembershipEvent, MembershipStream};
use crate::types::NodeAddress;

/// In-memory membership for testing. The lowest address is the leader.
pub struct MemoryMembership {
    inner: Mutex<Inner>,
}

struct Inner {
    members: BTreeSet<NodeAddress>,
    watchers: Vec<mpsc::UnboundedSender<MembershipEvent>>,
}

impl MemoryMembership {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                members: BTreeSet::new(),
                watchers: Vec::new(),
            }),
        }
    }

    pub fn join(&self, node: NodeAddress) {
        let mut inner = self.inner.lock();
        if inner.members.insert(node.clone()) {
            Self::notify_watchers(&mut inner, MembershipEvent::Joined(node));
        }
    }

    pub fn leave(&self, node: &NodeAddress) {
        let mut inner = self.inner.lock();
        if inner.members.remove(node) {
            Self::notify_watchers(&mut inner, MembershipEvent::Left(node.clone()));
        }
    }

    fn notify_watchers(inner: &mut Inner, event: MembershipEvent) {
        inner.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for MemoryMembership {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterMembership for MemoryMembership {
    async fn current_members(&self) -> Result<BTreeSet<NodeAddress>, ClusterError> {
        Ok(self.inner.lock().members.clone())
    }

    async fn subscribe(&self) -> Result<MembershipStream, ClusterError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().watchers.push(tx);
        Ok(Box::pin(
            tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
        ))
    }

    async fn leader(&self) -> Result<Option<NodeAddress>, ClusterError> {
        Ok(self.inner.lock().members.first().cloned())
    }
}
