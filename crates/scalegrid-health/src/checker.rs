//! Health probe contract and per-instance result tracking.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use scalegrid_registry::{InstanceSnapshot, InstanceStatus, InstanceVitals};

/// What a probe learned about an instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeReport {
    pub healthy: bool,
    /// CPU usage, 0–100.
    pub cpu_usage: f64,
    pub memory_mb: f64,
}

impl ProbeReport {
    pub fn healthy(cpu_usage: f64, memory_mb: f64) -> Self {
        Self {
            healthy: true,
            cpu_usage,
            memory_mb,
        }
    }

    pub fn unhealthy() -> Self {
        Self {
            healthy: false,
            cpu_usage: 0.0,
            memory_mb: 0.0,
        }
    }
}

/// A probe that could not produce a report.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe failed: {0}")]
    Failed(String),

    #[error("probe task panicked")]
    Panicked,
}

/// Liveness check supplied by the owner of a service.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn probe(&self, instance: &InstanceSnapshot) -> Result<ProbeReport, ProbeError>;
}

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeResult {
    /// The probe reported the instance healthy, with fresh resource usage.
    Healthy { cpu_usage: f64, memory_mb: f64 },
    /// The probe answered but reported the instance unhealthy.
    Unhealthy,
    /// The probe errored, timed out or panicked.
    Failed,
}

impl ProbeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }
}

impl From<Result<ProbeReport, ProbeError>> for ProbeResult {
    fn from(result: Result<ProbeReport, ProbeError>) -> Self {
        match result {
            Ok(report) if report.healthy => Self::Healthy {
                cpu_usage: report.cpu_usage,
                memory_mb: report.memory_mb,
            },
            Ok(_) => Self::Unhealthy,
            Err(_) => Self::Failed,
        }
    }
}

/// Run one probe in its own task, bounded by `timeout`.
///
/// The probe task is aborted when the timeout fires, and a panic inside the
/// probe is reported as a failure instead of unwinding into the caller.
pub async fn run_probe(
    probe: Arc<dyn HealthProbe>,
    snapshot: InstanceSnapshot,
    timeout: Duration,
) -> ProbeResult {
    let instance_id = snapshot.id.clone();
    let mut task = tokio::spawn(async move { probe.probe(&snapshot).await });

    let outcome = match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            debug!(instance = %instance_id, error = %join_err, "health probe task failed");
            Err(ProbeError::Panicked)
        }
        Err(_) => {
            task.abort();
            Err(ProbeError::Timeout(timeout))
        }
    };

    if let Err(e) = &outcome {
        debug!(instance = %instance_id, error = %e, "health probe failed");
    }
    outcome.into()
}

/// Applies probe results to instance vitals.
#[derive(Debug, Clone, Copy)]
pub struct HealthTracker {
    /// Consecutive failures before marking unhealthy.
    unhealthy_threshold: u32,
}

impl HealthTracker {
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self {
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    pub fn unhealthy_threshold(&self) -> u32 {
        self.unhealthy_threshold
    }

    /// Record a probe result and return the resulting status.
    ///
    /// Statuses that probes do not own (`Stopping`, `Maintenance`) are left
    /// alone even if they were set while the probe was in flight.
    pub fn record(&self, vitals: &mut InstanceVitals, result: ProbeResult, checked_at: u64) -> InstanceStatus {
        vitals.last_health_check = Some(checked_at);

        match result {
            ProbeResult::Healthy {
                cpu_usage,
                memory_mb,
            } => {
                vitals.consecutive_failures = 0;
                vitals.cpu_usage = cpu_usage.clamp(0.0, 100.0);
                vitals.memory_usage_mb = memory_mb.max(0.0);

                if vitals.status.is_probed() && vitals.status != InstanceStatus::Healthy {
                    debug!(from = %vitals.status, "instance recovered to healthy");
                    vitals.status = InstanceStatus::Healthy;
                }
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                vitals.consecutive_failures = vitals.consecutive_failures.saturating_add(1);

                if vitals.consecutive_failures >= self.unhealthy_threshold
                    && vitals.status.is_probed()
                    && vitals.status != InstanceStatus::Unhealthy
                {
                    warn!(
                        failures = vitals.consecutive_failures,
                        threshold = self.unhealthy_threshold,
                        "instance marked unhealthy"
                    );
                    vitals.status = InstanceStatus::Unhealthy;
                }
            }
        }

        vitals.status
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(3)
    }
}
