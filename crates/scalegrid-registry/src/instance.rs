//! Service instance records.
//!
//! A [`ServiceInstance`] splits into immutable identity (id, address,
//! weight, capacity, metadata), an atomic connection counter touched on
//! every routed request, and [`InstanceVitals`] behind a per-instance mutex
//! for the fields written by the health checker and by `release`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Unique identifier for an instance within a service.
pub type InstanceId = String;

/// Smoothing factor for the response time moving average.
pub const RESPONSE_TIME_ALPHA: f64 = 0.3;

/// Instances at or above this CPU usage are not routable.
pub const CPU_LIMIT_PERCENT: f64 = 90.0;

/// Instances at or above this smoothed response time are not routable.
pub const RESPONSE_TIME_LIMIT_MS: f64 = 5000.0;

/// Lifecycle status of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Registered, not yet confirmed by a probe.
    Starting,
    Healthy,
    Unhealthy,
    /// Draining before removal.
    Stopping,
    /// Manually parked; ignored by probes, routing and scaling.
    Maintenance,
}

impl InstanceStatus {
    /// Whether health probes may run against, and change, this status.
    pub fn is_probed(self) -> bool {
        !matches!(self, Self::Stopping | Self::Maintenance)
    }

    /// Whether the instance counts toward a service's live capacity.
    ///
    /// Live instances are exactly the ones scale-down may pick.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Stopping | Self::Maintenance)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Stopping => "stopping",
            Self::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of an instance handed to the registry by a provisioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Explicit id; one is generated from the service name when absent.
    #[serde(default)]
    pub id: Option<InstanceId>,
    /// Network address (host:port, URL, ...).
    pub address: String,
    /// Routing priority for weighted selection.
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_weight() -> u32 {
    1
}

fn default_max_connections() -> u32 {
    100
}

impl InstanceSpec {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            id: None,
            address: address.into(),
            weight: default_weight(),
            max_connections: default_max_connections(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<InstanceId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Mutable health and performance fields of an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceVitals {
    pub status: InstanceStatus,
    /// Smoothed response time in milliseconds.
    pub response_time_ms: f64,
    /// CPU usage, 0–100.
    pub cpu_usage: f64,
    pub memory_usage_mb: f64,
    /// Unix timestamp (seconds) of the last completed probe.
    pub last_health_check: Option<u64>,
    pub consecutive_failures: u32,
}

impl InstanceVitals {
    fn starting() -> Self {
        Self {
            status: InstanceStatus::Starting,
            response_time_ms: 0.0,
            cpu_usage: 0.0,
            memory_usage_mb: 0.0,
            last_health_check: None,
            consecutive_failures: 0,
        }
    }
}

/// One addressable backend replica.
#[derive(Debug)]
pub struct ServiceInstance {
    id: InstanceId,
    service: String,
    address: String,
    weight: u32,
    max_connections: u32,
    metadata: HashMap<String, String>,
    connections: AtomicU32,
    vitals: Mutex<InstanceVitals>,
}

impl ServiceInstance {
    /// Build a new instance in `Starting` state.
    pub fn new(service: impl Into<String>, id: impl Into<InstanceId>, spec: InstanceSpec) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            address: spec.address,
            weight: spec.weight,
            max_connections: spec.max_connections,
            metadata: spec.metadata,
            connections: AtomicU32::new(0),
            vitals: Mutex::new(InstanceVitals::starting()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn status(&self) -> InstanceStatus {
        self.vitals.lock().status
    }

    /// Set the status and return the previous one.
    pub fn set_status(&self, status: InstanceStatus) -> InstanceStatus {
        std::mem::replace(&mut self.vitals.lock().status, status)
    }

    /// Copy of the current vitals.
    pub fn vitals(&self) -> InstanceVitals {
        self.vitals.lock().clone()
    }

    /// Run `f` with exclusive access to the vitals.
    ///
    /// Keeps read-modify-write sequences (probe bookkeeping, EWMA updates)
    /// atomic with respect to other writers of the same instance.
    pub fn with_vitals<R>(&self, f: impl FnOnce(&mut InstanceVitals) -> R) -> R {
        f(&mut self.vitals.lock())
    }

    /// Move a live instance to `Stopping`.
    ///
    /// Returns false, leaving the status alone, if the instance is already
    /// stopping or parked in maintenance.
    pub fn begin_drain(&self) -> bool {
        self.with_vitals(|v| {
            if !v.status.is_live() {
                return false;
            }
            v.status = InstanceStatus::Stopping;
            true
        })
    }

    pub fn current_connections(&self) -> u32 {
        self.connections.load(Ordering::Acquire)
    }

    /// Count a new in-flight request. Returns the count before the increment.
    pub fn acquire_connection(&self) -> u32 {
        self.connections.fetch_add(1, Ordering::AcqRel)
    }

    /// Finish an in-flight request, never going below zero.
    /// Returns the count after the decrement.
    pub fn release_connection(&self) -> u32 {
        let previous = self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Fold a response time sample into the moving average.
    /// Returns the new average.
    pub fn record_response_time(&self, sample_ms: f64) -> f64 {
        let sample = if sample_ms.is_finite() { sample_ms.max(0.0) } else { 0.0 };
        self.with_vitals(|v| {
            v.response_time_ms =
                RESPONSE_TIME_ALPHA * sample + (1.0 - RESPONSE_TIME_ALPHA) * v.response_time_ms;
            v.response_time_ms
        })
    }

    /// Overwrite CPU and memory readings.
    pub fn update_resource_usage(&self, cpu_usage: f64, memory_usage_mb: f64) {
        self.with_vitals(|v| {
            v.cpu_usage = cpu_usage.clamp(0.0, 100.0);
            v.memory_usage_mb = memory_usage_mb.max(0.0);
        });
    }

    pub fn response_time_ms(&self) -> f64 {
        self.vitals.lock().response_time_ms
    }

    pub fn cpu_usage(&self) -> f64 {
        self.vitals.lock().cpu_usage
    }

    pub fn memory_usage_mb(&self) -> f64 {
        self.vitals.lock().memory_usage_mb
    }

    /// Composite load score in `[0, 1]`.
    pub fn load_factor(&self) -> f64 {
        let vitals = self.vitals.lock();
        load_factor(
            self.current_connections(),
            self.max_connections,
            vitals.cpu_usage,
            vitals.response_time_ms,
        )
    }

    /// Whether routing may pick this instance right now.
    pub fn is_healthy(&self) -> bool {
        let vitals = self.vitals.lock();
        vitals.status == InstanceStatus::Healthy
            && self.current_connections() < self.max_connections
            && vitals.cpu_usage < CPU_LIMIT_PERCENT
            && vitals.response_time_ms < RESPONSE_TIME_LIMIT_MS
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let vitals = self.vitals();
        let current_connections = self.current_connections();
        InstanceSnapshot {
            id: self.id.clone(),
            service: self.service.clone(),
            address: self.address.clone(),
            weight: self.weight,
            max_connections: self.max_connections,
            current_connections,
            load_factor: load_factor(
                current_connections,
                self.max_connections,
                vitals.cpu_usage,
                vitals.response_time_ms,
            ),
            status: vitals.status,
            response_time_ms: vitals.response_time_ms,
            cpu_usage: vitals.cpu_usage,
            memory_usage_mb: vitals.memory_usage_mb,
            last_health_check: vitals.last_health_check,
            consecutive_failures: vitals.consecutive_failures,
            metadata: self.metadata.clone(),
        }
    }
}

/// 0.4 × connection utilisation + 0.3 × CPU + 0.3 × latency (capped at 1s).
pub fn load_factor(connections: u32, max_connections: u32, cpu_usage: f64, response_time_ms: f64) -> f64 {
    let connection_ratio = if max_connections == 0 {
        1.0
    } else {
        (connections as f64 / max_connections as f64).min(1.0)
    };
    let cpu_ratio = (cpu_usage / 100.0).clamp(0.0, 1.0);
    let latency_ratio = (response_time_ms / 1000.0).clamp(0.0, 1.0);
    0.4 * connection_ratio + 0.3 * cpu_ratio + 0.3 * latency_ratio
}

/// Point-in-time, serializable view of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub service: String,
    pub address: String,
    pub weight: u32,
    pub max_connections: u32,
    pub current_connections: u32,
    pub load_factor: f64,
    pub status: InstanceStatus,
    pub response_time_ms: f64,
    pub cpu_usage: f64,
    pub memory_usage_mb: f64,
    pub last_health_check: Option<u64>,
    pub consecutive_failures: u32,
    pub metadata: HashMap<String, String>,
}
