use crate::error::ClusterError;
use crate::types::NodeAddress;
use std::time::Duration;

/// Configuration for a sharding node.
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// Address this node advertises to the coordinator and other regions.
    pub node_address: NodeAddress,
    /// Fixed number of shards. Must not change while the cluster holds data. Default: 100.
    pub number_of_shards: u32,
    /// Idle time after which an entity is passivated, for entity types
    /// registered with `PassivationPolicy::Default`. Default: 120s.
    pub entity_max_idle_time: Duration,
    /// How long a message for a locally owned shard waits for its entity type
    /// to be registered before it is rejected. Default: 5s.
    pub entity_registration_timeout: Duration,
    /// Activation attempts after the first one before pending commands are
    /// failed with a recovery error. Default: 3.
    pub entity_recovery_max_retries: u32,
    /// Backoff before the first activation retry. Grows by a factor of 1.5,
    /// capped at `entity_recovery_max_backoff`. Default: 200ms.
    pub entity_recovery_initial_backoff: Duration,
    /// Default: 5s.
    pub entity_recovery_max_backoff: Duration,
    /// Time a shard gets to drain in-flight commands when handed off
    /// before its entities are aborted. Default: 10s.
    pub handoff_timeout: Duration,
    /// Routing retries after a transient failure (stale cache, unreachable
    /// node). 0 = no retries. Default: 3.
    pub send_retry_count: u32,
    /// Pause between routing retries. Default: 100ms.
    pub send_retry_interval: Duration,
    /// Maximum number of messages a region buffers for shards in handoff. Default: 100000.
    pub buffer_size: usize,
    /// How often the coordinator checks whether shards should move. Default: 10s.
    pub rebalance_interval: Duration,
    /// Minimum difference in shard count between the most and least loaded
    /// nodes before a rebalance starts. Default: 1.
    pub rebalance_threshold: usize,
    /// Upper bound on shards relocated in one rebalance round. Default: 3.
    pub max_simultaneous_rebalance: usize,
}

impl ShardingConfig {
    /// Validate configuration values.
    ///
    /// Checks:
    /// - `number_of_shards >= 1` (shard derivation divides by it)
    /// - `buffer_size`, `rebalance_threshold`, `max_simultaneous_rebalance` >= 1
    /// - timeouts and intervals are non-zero
    /// - recovery backoff bounds are ordered
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.number_of_shards < 1 {
            return Err(ClusterError::InvalidConfig {
                reason: format!(
                    "number_of_shards must be >= 1, got {}",
                    self.number_of_shards
                ),
            });
        }
        if self.buffer_size == 0 {
            return Err(ClusterError::InvalidConfig {
                reason: "buffer_size must be >= 1".to_string(),
            });
        }
        if self.rebalance_threshold == 0 {
            return Err(ClusterError::InvalidConfig {
                reason: "rebalance_threshold must be >= 1".to_string(),
            });
        }
        if self.max_simultaneous_rebalance == 0 {
            return Err(ClusterError::InvalidConfig {
                reason: "max_simultaneous_rebalance must be >= 1".to_string(),
            });
        }
        if self.handoff_timeout.is_zero() {
            return Err(ClusterError::InvalidConfig {
                reason: "handoff_timeout must be > 0".to_string(),
            });
        }
        if self.rebalance_interval.is_zero() {
            return Err(ClusterError::InvalidConfig {
                reason: "rebalance_interval must be > 0".to_string(),
            });
        }
        if self.entity_recovery_initial_backoff > self.entity_recovery_max_backoff {
            return Err(ClusterError::InvalidConfig {
                reason: format!(
                    "entity_recovery_initial_backoff ({:?}) must not exceed entity_recovery_max_backoff ({:?})",
                    self.entity_recovery_initial_backoff, self.entity_recovery_max_backoff
                ),
            });
        }
        Ok(())
    }
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            node_address: NodeAddress::new("127.0.0.1", 9000),
            number_of_shards: 100,
            entity_max_idle_time: Duration::from_secs(120),
            entity_registration_timeout: Duration::from_secs(5),
            entity_recovery_max_retries: 3,
            entity_recovery_initial_backoff: Duration::from_millis(200),
            entity_recovery_max_backoff: Duration::from_secs(5),
            handoff_timeout: Duration::from_secs(10),
            send_retry_count: 3,
            send_retry_interval: Duration::from_millis(100),
            buffer_size: 100_000,
            rebalance_interval: Duration::from_secs(10),
            rebalance_threshold: 1,
            max_simultaneous_rebalance: 3,
        }
    }
}
