//! LoadBalancer — routes requests to healthy instances of a service.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use scalegrid_core::{BalancerSettings, LoadBalanceStrategy};
use scalegrid_registry::{ServiceInstance, ServiceRegistry};

use crate::error::{BalancerError, BalancerResult};
use crate::stats::RoutingStats;
use crate::strategy::{self, RequestMetadata, RoundRobinCounter};

/// Routes requests over the instances of a [`ServiceRegistry`].
///
/// All methods take `&self` and are safe to call from many request
/// handlers at once; the only per-call writes are an atomic connection
/// increment and a routing counter.
pub struct LoadBalancer {
    registry: ServiceRegistry,
    default_strategy: LoadBalanceStrategy,
    overrides: RwLock<HashMap<String, LoadBalanceStrategy>>,
    cursors: RwLock<HashMap<String, Arc<RoundRobinCounter>>>,
    stats: RoutingStats,
}

impl LoadBalancer {
    pub fn new(registry: ServiceRegistry, strategy: LoadBalanceStrategy) -> Self {
        Self {
            registry,
            default_strategy: strategy,
            overrides: RwLock::new(HashMap::new()),
            cursors: RwLock::new(HashMap::new()),
            stats: RoutingStats::new(),
        }
    }

    /// Build a balancer with the default strategy and per-service overrides
    /// from config.
    pub fn from_settings(registry: ServiceRegistry, settings: &BalancerSettings) -> Self {
        let balancer = Self::new(registry, settings.strategy);
        for (service, strategy) in &settings.services {
            balancer.set_service_strategy(service, *strategy);
        }
        balancer
    }

    pub fn set_service_strategy(&self, service: &str, strategy: LoadBalanceStrategy) {
        self.overrides.write().insert(service.to_string(), strategy);
        debug!(%service, %strategy, "service strategy set");
    }

    pub fn strategy_for(&self, service: &str) -> LoadBalanceStrategy {
        self.overrides
            .read()
            .get(service)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    pub fn stats(&self) -> &RoutingStats {
        &self.stats
    }

    /// Pick a healthy instance for `service` and count a new connection on it.
    pub fn route(
        &self,
        service: &str,
        metadata: Option<&RequestMetadata>,
    ) -> BalancerResult<Arc<ServiceInstance>> {
        let candidates = self.registry.healthy(service);
        let strategy = self.strategy_for(service);

        let index = match candidates.len() {
            0 => None,
            1 => Some(0),
            _ => self.select(service, strategy, &candidates, metadata),
        };

        let instance = index
            .and_then(|i| candidates.get(i).cloned())
            .ok_or_else(|| BalancerError::NoHealthyInstance {
                service: service.to_string(),
            })?;

        let previous = instance.acquire_connection();
        self.stats.record_selection(service, instance.id());

        debug!(
            %service,
            instance = %instance.id(),
            %strategy,
            candidates = candidates.len(),
            connections = previous + 1,
            "request routed"
        );
        Ok(instance)
    }

    /// Report a finished request: close its connection and fold the
    /// response time into the instance's moving average.
    ///
    /// Status is never touched here; only probes change health.
    pub fn release(&self, instance: &ServiceInstance, response_time_ms: f64, success: bool) {
        let remaining = instance.release_connection();
        let average = instance.record_response_time(response_time_ms);
        self.stats.record_outcome(instance.service(), success);

        debug!(
            service = %instance.service(),
            instance = %instance.id(),
            response_time_ms,
            average_ms = average,
            success,
            connections = remaining,
            "request released"
        );
    }

    fn select(
        &self,
        service: &str,
        strategy: LoadBalanceStrategy,
        candidates: &[Arc<ServiceInstance>],
        metadata: Option<&RequestMetadata>,
    ) -> Option<usize> {
        match strategy {
            LoadBalanceStrategy::RoundRobin => self.next_round_robin(service, candidates.len()),
            LoadBalanceStrategy::LeastConnections => strategy::least_connections(candidates),
            LoadBalanceStrategy::WeightedRoundRobin => {
                let mut rng = rand::rng();
                strategy::weighted(candidates, &mut rng)
                    .or_else(|| self.next_round_robin(service, candidates.len()))
            }
            LoadBalanceStrategy::ConsistentHash => match metadata {
                Some(meta) => strategy::by_hash(candidates, meta),
                None => self.next_round_robin(service, candidates.len()),
            },
            LoadBalanceStrategy::PerformanceBased => strategy::lowest_load(candidates),
        }
    }

    fn next_round_robin(&self, service: &str, count: usize) -> Option<usize> {
        let cursor = self.cursors.read().get(service).cloned();
        let cursor = match cursor {
            Some(cursor) => cursor,
            None => self
                .cursors
                .write()
                .entry(service.to_string())
                .or_default()
                .clone(),
        };
        cursor.next(count)
    }
}
