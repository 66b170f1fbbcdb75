//! scalegrid-health — periodic health checking for registered instances.
//!
//! The transport behind a probe (HTTP, gRPC, TCP) belongs to whoever owns
//! the service; this crate only drives a [`HealthProbe`] implementation on
//! a schedule and turns its answers into instance status changes.
//!
//! # Architecture
//!
//! ```text
//! HealthChecker
//!   ├── background loop (interval, watch-based shutdown)
//!   └── check_all() sweep
//!         ├── one task per probed instance
//!         │     └── run_probe() → ProbeResult (bounded by timeout)
//!         └── HealthTracker::record() → InstanceVitals / InstanceStatus
//! ```
//!
//! # Thresholds
//!
//! A single successful probe marks an instance `Healthy` and resets its
//! failure counter. `unhealthy_threshold` consecutive failures (errors,
//! timeouts, panics or `healthy = false` reports) mark it `Unhealthy`.
//! Instances in `Maintenance` or `Stopping` are never probed.

pub mod checker;
pub mod monitor;

pub use checker::{HealthProbe, HealthTracker, ProbeError, ProbeReport, ProbeResult, run_probe};
pub use monitor::{HealthChecker, SweepSummary};
