//! Policy types shared across scalegrid crates.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Metric a scaling rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMetric {
    /// Mean CPU usage (0–100) across healthy instances.
    Cpu,
    /// Mean memory usage in MB across healthy instances.
    Memory,
    /// Mean open connections per healthy instance.
    Connections,
    /// Mean smoothed response time in milliseconds.
    ResponseTime,
    /// Mean composite load factor (0–1).
    LoadFactor,
}

impl ScalingMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Connections => "connections",
            Self::ResponseTime => "response_time",
            Self::LoadFactor => "load_factor",
        }
    }
}

impl fmt::Display for ScalingMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance selection strategy used by the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    /// Modulo hash of the request metadata over the current candidates.
    ///
    /// Affinity is lost whenever the healthy set changes size; this is not
    /// a hash ring.
    ConsistentHash,
    /// Lowest load factor wins.
    #[default]
    PerformanceBased,
}

impl LoadBalanceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::ConsistentHash => "consistent_hash",
            Self::PerformanceBased => "performance_based",
        }
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One autoscaling policy bound to a metric.
///
/// The time of the last successful scale action lives with the autoscaler,
/// not here, so rules stay plain configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingRule {
    pub metric: ScalingMetric,
    /// Scale up when the aggregate metric is strictly above this value.
    pub threshold_up: f64,
    /// Scale down when the aggregate metric is strictly below this value.
    pub threshold_down: f64,
    #[serde(default = "default_step")]
    pub scale_up_count: u32,
    #[serde(default = "default_step")]
    pub scale_down_count: u32,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_min_instances")]
    pub min_instances: u32,
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
}

fn default_step() -> u32 {
    1
}

fn default_cooldown_seconds() -> u64 {
    300
}

fn default_min_instances() -> u32 {
    1
}

fn default_max_instances() -> u32 {
    10
}

impl ScalingRule {
    /// Create a rule with single-instance steps, a 5 minute cooldown and
    /// bounds of 1..=10 instances.
    pub fn new(metric: ScalingMetric, threshold_up: f64, threshold_down: f64) -> Self {
        Self {
            metric,
            threshold_up,
            threshold_down,
            scale_up_count: default_step(),
            scale_down_count: default_step(),
            cooldown_seconds: default_cooldown_seconds(),
            min_instances: default_min_instances(),
            max_instances: default_max_instances(),
        }
    }

    pub fn with_bounds(mut self, min_instances: u32, max_instances: u32) -> Self {
        self.min_instances = min_instances;
        self.max_instances = max_instances;
        self
    }

    pub fn with_steps(mut self, scale_up_count: u32, scale_down_count: u32) -> Self {
        self.scale_up_count = scale_up_count;
        self.scale_down_count = scale_down_count;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_seconds = cooldown.as_secs();
        self
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    /// Reject rules that could never be honoured or that would flap.
    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |reason: String| ConfigError::InvalidRule {
            metric: self.metric.to_string(),
            reason,
        };

        if !self.threshold_up.is_finite() || !self.threshold_down.is_finite() {
            return Err(invalid("thresholds must be finite numbers".to_string()));
        }
        if self.threshold_down >= self.threshold_up {
            return Err(invalid(format!(
                "threshold_down ({}) must be below threshold_up ({})",
                self.threshold_down, self.threshold_up
            )));
        }
        if self.min_instances > self.max_instances {
            return Err(invalid(format!(
                "min_instances ({}) exceeds max_instances ({})",
                self.min_instances, self.max_instances
            )));
        }
        if self.max_instances == 0 {
            return Err(invalid("max_instances must be at least 1".to_string()));
        }
        if self.scale_up_count == 0 || self.scale_down_count == 0 {
            return Err(invalid("scale counts must be at least 1".to_string()));
        }
        Ok(())
    }
}
