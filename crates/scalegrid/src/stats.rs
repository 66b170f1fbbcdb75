//! Point-in-time view of the whole system.

use std::collections::BTreeMap;

use serde::Serialize;

use scalegrid_autoscale::ScalingEvent;

/// Per-service counters and averages.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceStats {
    pub instance_count: usize,
    pub healthy_count: usize,
    /// Times each instance was selected by the balancer.
    pub routing_distribution: BTreeMap<String, u64>,
    /// Mean of the instances' smoothed response times; 0 with no instances.
    pub avg_response_time_ms: f64,
    pub total_requests: u64,
    pub failed_requests: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemStats {
    pub services: BTreeMap<String, ServiceStats>,
    /// Retained scaling events, oldest first.
    pub scaling_history: Vec<ScalingEvent>,
}
