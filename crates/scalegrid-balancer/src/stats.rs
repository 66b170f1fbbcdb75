//! Per-service routing counters.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

#[derive(Default)]
struct ServiceCounters {
    /// instance id → times selected.
    selections: Mutex<HashMap<String, u64>>,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Routing counters for one service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceRoutingStats {
    /// How many times each instance was selected.
    pub routing_distribution: BTreeMap<String, u64>,
    /// Requests released back to the balancer.
    pub total_requests: u64,
    /// Released requests reported as failed.
    pub failed_requests: u64,
}

/// Selection and outcome counters, keyed by service.
#[derive(Default)]
pub struct RoutingStats {
    services: RwLock<HashMap<String, Arc<ServiceCounters>>>,
}

impl RoutingStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, service: &str) -> Arc<ServiceCounters> {
        if let Some(counters) = self.services.read().get(service) {
            return counters.clone();
        }
        self.services
            .write()
            .entry(service.to_string())
            .or_default()
            .clone()
    }

    pub fn record_selection(&self, service: &str, instance_id: &str) {
        let counters = self.counters(service);
        *counters
            .selections
            .lock()
            .entry(instance_id.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_outcome(&self, service: &str, success: bool) {
        let counters = self.counters(service);
        counters.completed.fetch_add(1, Ordering::Relaxed);
        if !success {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counters for one service; zeroed if it was never routed.
    pub fn service(&self, service: &str) -> ServiceRoutingStats {
        let counters = self.services.read().get(service).cloned();
        counters.map(|c| snapshot(&c)).unwrap_or_default()
    }

    pub fn all(&self) -> BTreeMap<String, ServiceRoutingStats> {
        self.services
            .read()
            .iter()
            .map(|(name, c)| (name.clone(), snapshot(c)))
            .collect()
    }
}

fn snapshot(counters: &ServiceCounters) -> ServiceRoutingStats {
    ServiceRoutingStats {
        routing_distribution: counters
            .selections
            .lock()
            .iter()
            .map(|(id, n)| (id.clone(), *n))
            .collect(),
        total_requests: counters.completed.load(Ordering::Relaxed),
        failed_requests: counters.failed.load(Ordering::Relaxed),
    }
}
