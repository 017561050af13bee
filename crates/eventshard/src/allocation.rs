use std::collections::{BTreeMap, BTreeSet};

use crate::types::{NodeAddress, ShardId};

/// Current shard ownership grouped by node. Members without shards map to an
/// empty set.
pub type ShardsByNode = BTreeMap<NodeAddress, BTreeSet<ShardId>>;

/// Places new shards on the least loaded node and moves shards off nodes that
/// hold more than their fair share.
///
/// Both decisions are pure functions of the inputs, so every coordinator
/// incarnation computes the same plan from the same state.
#[derive(Debug, Clone)]
pub struct LeastShardAllocationStrategy {
    /// Minimum difference between the most and least loaded node before any
    /// shard is moved.
    pub rebalance_threshold: usize,
    /// Upper bound on shards in handoff at the same time.
    pub max_simultaneous_rebalance: usize,
}

impl LeastShardAllocationStrategy {
    pub fn new(rebalance_threshold: usize, max_simultaneous_rebalance: usize) -> Self {
        Self {
            rebalance_threshold,
            max_simultaneous_rebalance,
        }
    }

    /// Pick the node with the fewest shards. Ties go to the lowest address.
    pub fn allocate_shard(&self, current: &ShardsByNode) -> Option<NodeAddress> {
        current
            .iter()
            .min_by(|(a_node, a), (b_node, b)| a.len().cmp(&b.len()).then(a_node.cmp(b_node)))
            .map(|(node, _)| node.clone())
    }

    /// Shards to move so that no node holds more than `ceil(total / nodes)`.
    pub fn rebalance(&self, current: &ShardsByNode, in_progress: &BTreeSet<ShardId>) -> BTreeSet<ShardId> {
        let budget = self
            .max_simultaneous_rebalance
            .saturating_sub(in_progress.len());
        if budget == 0 || current.len() < 2 {
            return BTreeSet::new();
        }

        let loads = current.values().map(BTreeSet::len);
        let (min, max) = loads.fold((usize::MAX, 0), |(min, max), n| (min.min(n), max.max(n)));
        if max - min < self.rebalance_threshold {
            return BTreeSet::new();
        }

        let total: usize = current.values().map(BTreeSet::len).sum();
        let optimal = total.div_ceil(current.len());

        let mut by_load: Vec<_> = current.iter().collect();
        by_load.sort_by(|(a_node, a), (b_node, b)| b.len().cmp(&a.len()).then(a_node.cmp(b_node)));

        let mut moves = BTreeSet::new();
        for (_, shards) in by_load {
            if shards.len() <= optimal {
                break;
            }
            let excess = shards.len() - optimal;
            moves.extend(
                shards
                    .iter()
                    .rev()
                    .filter(|shard| !in_progress.contains(shard))
                    .take(excess)
                    .copied(),
            );
            if moves.len() >= budget {
                break;
            }
        }
        moves.into_iter().take(budget).collect()
    }
}
