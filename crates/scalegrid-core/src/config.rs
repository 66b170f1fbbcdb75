//! scalegrid.toml configuration parser.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::humanized;
use crate::error::{ConfigError, ConfigResult};
use crate::types::{LoadBalanceStrategy, ScalingRule};

/// Longest interval or timeout a config may set.
pub const MAX_CONFIG_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Top-level configuration for a scaling system.
///
/// Every section and field has a default, so an empty file is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalegridConfig {
    pub health: HealthSettings,
    pub balancer: BalancerSettings,
    pub autoscale: AutoscaleSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Time between probe sweeps.
    #[serde(with = "humanized")]
    pub interval: Duration,
    /// Upper bound on a single probe.
    #[serde(with = "humanized")]
    pub timeout: Duration,
    /// Consecutive failed probes before an instance is marked unhealthy.
    pub unhealthy_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerSettings {
    /// Strategy for services without an override.
    pub strategy: LoadBalanceStrategy,
    /// Per-service strategy overrides.
    pub services: BTreeMap<String, LoadBalanceStrategy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleSettings {
    /// Time between rule evaluations.
    #[serde(with = "humanized")]
    pub interval: Duration,
    /// How long a stopping instance may keep open connections.
    #[serde(with = "humanized")]
    pub drain_timeout: Duration,
    #[serde(with = "humanized")]
    pub drain_poll_interval: Duration,
    /// Upper bound on a single provisioner call.
    #[serde(with = "humanized")]
    pub provision_timeout: Duration,
    /// Scaling events kept in memory.
    pub history_limit: usize,
    pub rules: Vec<ServiceRule>,
}

impl Default for AutoscaleSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(30),
            drain_poll_interval: Duration::from_millis(250),
            provision_timeout: Duration::from_secs(60),
            history_limit: 1000,
            rules: Vec::new(),
        }
    }
}

/// A scaling rule bound to the service it applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRule {
    pub service: String,
    #[serde(flatten)]
    pub rule: ScalingRule,
}

impl ScalegridConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a config document.
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: ScalegridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Strategy configured for a service, falling back to the default.
    pub fn strategy_for(&self, service: &str) -> LoadBalanceStrategy {
        self.balancer
            .services
            .get(service)
            .copied()
            .unwrap_or(self.balancer.strategy)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.health.interval.is_zero() || self.autoscale.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "loop intervals must be greater than zero".to_string(),
            ));
        }
        if self.health.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "health.timeout must be greater than zero".to_string(),
            ));
        }
        if self.health.unhealthy_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health.unhealthy_threshold must be at least 1".to_string(),
            ));
        }
        if self.autoscale.drain_poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "autoscale.drain_poll_interval must be greater than zero".to_string(),
            ));
        }
        for (name, value) in [
            ("health.interval", self.health.interval),
            ("health.timeout", self.health.timeout),
            ("autoscale.interval", self.autoscale.interval),
            ("autoscale.drain_timeout", self.autoscale.drain_timeout),
            ("autoscale.drain_poll_interval", self.autoscale.drain_poll_interval),
            ("autoscale.provision_timeout", self.autoscale.provision_timeout),
        ] {
            if value > MAX_CONFIG_DURATION {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be at most {}",
                    crate::duration::format_duration(MAX_CONFIG_DURATION)
                )));
            }
        }
        if self.autoscale.history_limit == 0 {
            return Err(ConfigError::Invalid(
                "autoscale.history_limit must be at least 1".to_string(),
            ));
        }
        for entry in &self.autoscale.rules {
            if entry.service.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "scaling rule without a service name".to_string(),
                ));
            }
            entry.rule.validate()?;
        }
        Ok(())
    }
}
