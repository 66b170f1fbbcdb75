//! scalegrid-core — shared policy types and configuration for scalegrid.
//!
//! Everything here is plain data: the scaling rule and balancing strategy
//! types that the registry, balancer and autoscaler agree on, plus the
//! `scalegrid.toml` configuration model and its duration syntax.

pub mod config;
pub mod duration;
pub mod error;
pub mod types;

pub use config::{
    AutoscaleSettings, BalancerSettings, HealthSettings, MAX_CONFIG_DURATION, ScalegridConfig,
    ServiceRule,
};
pub use duration::{format_duration, parse_duration};
pub use error::{ConfigError, ConfigResult};
pub use types::{LoadBalanceStrategy, ScalingMetric, ScalingRule};
