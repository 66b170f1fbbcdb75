//! Rule evaluation: metric aggregation, cooldown, and scale decisions.

use std::sync::Arc;

use tokio::time::Instant;

use scalegrid_core::{ScalingMetric, ScalingRule};
use scalegrid_registry::ServiceInstance;

/// A scaling decision for one rule of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Add this many instances.
    ScaleUp(u32),
    /// Remove this many instances.
    ScaleDown(u32),
    NoChange,
}

/// A rule together with the time it last produced a successful action.
#[derive(Debug, Clone)]
pub struct TrackedRule {
    pub(crate) id: u64,
    pub rule: ScalingRule,
    pub last_scaled: Option<Instant>,
}

impl TrackedRule {
    pub(crate) fn new(id: u64, rule: ScalingRule) -> Self {
        Self {
            id,
            rule,
            last_scaled: None,
        }
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.last_scaled
            .is_some_and(|at| now.saturating_duration_since(at) < self.rule.cooldown())
    }
}

/// Arithmetic mean of `metric` over `instances`; `None` when there are none.
pub fn aggregate(metric: ScalingMetric, instances: &[Arc<ServiceInstance>]) -> Option<f64> {
    if instances.is_empty() {
        return None;
    }
    let total: f64 = instances.iter().map(|i| metric_value(metric, i)).sum();
    Some(total / instances.len() as f64)
}

fn metric_value(metric: ScalingMetric, instance: &ServiceInstance) -> f64 {
    match metric {
        ScalingMetric::Cpu => instance.cpu_usage(),
        ScalingMetric::Memory => instance.memory_usage_mb(),
        ScalingMetric::Connections => f64::from(instance.current_connections()),
        ScalingMetric::ResponseTime => instance.response_time_ms(),
        ScalingMetric::LoadFactor => instance.load_factor(),
    }
}

/// Compare an aggregated value against a rule, clamped to the rule's bounds.
///
/// `live` counts instances that are not draining.
pub fn decide(rule: &ScalingRule, value: f64, live: u32) -> ScaleDecision {
    if value > rule.threshold_up && live < rule.max_instances {
        let count = rule.scale_up_count.min(rule.max_instances - live);
        return ScaleDecision::ScaleUp(count);
    }
    if value < rule.threshold_down && live > rule.min_instances {
        let count = rule.scale_down_count.min(live - rule.min_instances);
        return ScaleDecision::ScaleDown(count);
    }
    ScaleDecision::NoChange
}
