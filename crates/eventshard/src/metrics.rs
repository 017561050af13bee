use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Prometheus metrics for one sharding node.
pub struct ShardingMetrics {
    /// Number of active entity runtimes.
    pub entities: IntGauge,
    /// Number of shards hosted by this node.
    pub shards: IntGauge,
    /// Messages held by the region while their shard is in handoff.
    pub buffered_messages: IntGauge,
    /// Entity runtimes stopped by passivation.
    pub passivations: IntCounter,
    /// Completed entity recoveries.
    pub recoveries: IntCounter,
    /// Events appended to the journal.
    pub persisted_events: IntCounter,
}

impl ShardingMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::build()?;
        registry.register(Box::new(metrics.entities.clone()))?;
        registry.register(Box::new(metrics.shards.clone()))?;
        registry.register(Box::new(metrics.buffered_messages.clone()))?;
        registry.register(Box::new(metrics.passivations.clone()))?;
        registry.register(Box::new(metrics.recoveries.clone()))?;
        registry.register(Box::new(metrics.persisted_events.clone()))?;
        Ok(metrics)
    }

    /// Create metrics without registering them (tests, embedded use).
    pub fn unregistered() -> Self {
        Self::build().expect("valid metric names")
    }

    fn build() -> Result<Self, prometheus::Error> {
        Ok(Self {
            entities: IntGauge::with_opts(Opts::new(
                "sharding_entities",
                "Number of active entity runtimes",
            ))?,
            shards: IntGauge::with_opts(Opts::new(
                "sharding_shards",
                "Number of shards hosted by this node",
            ))?,
            buffered_messages: IntGauge::with_opts(Opts::new(
                "sharding_buffered_messages",
                "Messages buffered while their shard is handed off",
            ))?,
            passivations: IntCounter::with_opts(Opts::new(
                "sharding_passivations_total",
                "Entity runtimes stopped by passivation",
            ))?,
            recoveries: IntCounter::with_opts(Opts::new(
                "sharding_recoveries_total",
                "Completed entity recoveries",
            ))?,
            persisted_events: IntCounter::with_opts(Opts::new(
                "sharding_persisted_events_total",
                "Events appended to the journal",
            ))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_metrics_work() {
        let m = ShardingMetrics::unregistered();
        m.entities.set(5);
        m.persisted_events.inc_by(3);
        assert_eq!(m.entities.get(), 5);
        assert_eq!(m.persisted_events.get(), 3);
    }

    #[test]
    fn registered_metrics_are_gathered() {
        let registry = Registry::new();
        let m = ShardingMetrics::new(&registry).unwrap();
        m.shards.set(2);
        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"sharding_shards".to_string()));
        assert!(names.contains(&"sharding_recoveries_total".to_string()));
    }

    #[test]
    fn double_registration_fails() {
        let registry = Registry::new();
        ShardingMetrics::new(&registry).unwrap();
        assert!(ShardingMetrics::new(&registry).is_err());
    }
}
