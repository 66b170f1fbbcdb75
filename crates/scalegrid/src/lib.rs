//! scalegrid — dynamic scaling for a fleet of service instances.
//!
//! [`ScalingSystem`] is the composition root: one registry shared by a
//! load balancer, a health checker and an autoscaler.
//!
//! # Architecture
//!
//! ```text
//!                    ScalingSystem
//!        ┌──────────────┼───────────────┐
//!   LoadBalancer   HealthChecker    AutoScaler ──► Provisioner
//!   (route/release)  (30 s loop)    (60 s loop)
//!        │              │  ▲            │
//!        │              │  └─ HealthProbe
//!        └──────────────┴───────┬───────┘
//!                        ServiceRegistry
//! ```
//!
//! Routing is synchronous and caller-driven; the two loops run as tokio
//! tasks between [`ScalingSystem::start`] and [`ScalingSystem::stop`].

pub mod error;
pub mod stats;
pub mod system;

pub use error::{ScalegridError, ScalegridResult};
pub use stats::{ServiceStats, SystemStats};
pub use system::ScalingSystem;

pub use scalegrid_autoscale::{Provisioner, ScaleDecision, ScalingDirection, ScalingEvent};
pub use scalegrid_balancer::RequestMetadata;
pub use scalegrid_core::{LoadBalanceStrategy, ScalegridConfig, ScalingMetric, ScalingRule};
pub use scalegrid_health::{HealthProbe, ProbeError, ProbeReport};
pub use scalegrid_registry::{InstanceSnapshot, InstanceSpec, InstanceStatus, ServiceInstance};
