//! Health checker — background sweep over every registered instance.
//!
//! Each sweep probes all instances concurrently, one task per instance,
//! so a single unresponsive backend only costs its own timeout.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use scalegrid_core::HealthSettings;
use scalegrid_registry::{InstanceStatus, ServiceInstance, ServiceRegistry};

use crate::checker::{HealthProbe, HealthTracker, ProbeResult, run_probe};

/// Counts from one probe sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub probed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Instances skipped because they are in maintenance or draining.
    pub skipped: usize,
}

/// Handle to the running background loop.
struct LoopSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Periodically probes every instance in a registry.
pub struct HealthChecker {
    registry: ServiceRegistry,
    probe: Arc<dyn HealthProbe>,
    tracker: HealthTracker,
    interval: Duration,
    timeout: Duration,
    task: Mutex<Option<LoopSlot>>,
}

impl HealthChecker {
    pub fn new(registry: ServiceRegistry, probe: Arc<dyn HealthProbe>, settings: &HealthSettings) -> Self {
        Self {
            registry,
            probe,
            tracker: HealthTracker::new(settings.unhealthy_threshold),
            interval: settings.interval,
            timeout: settings.timeout,
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Probe one instance right away and return its resulting status.
    ///
    /// Instances in `Maintenance` or `Stopping` are returned untouched.
    pub async fn check_instance(&self, instance: &Arc<ServiceInstance>) -> InstanceStatus {
        let status = instance.status();
        if !status.is_probed() {
            return status;
        }
        let result = run_probe(self.probe.clone(), instance.snapshot(), self.timeout).await;
        apply_result(&self.tracker, instance, result)
    }

    /// Run one sweep over every probed instance.
    pub async fn check_all(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();
        let mut probes = JoinSet::new();

        for instance in self.registry.all_instances() {
            if !instance.status().is_probed() {
                summary.skipped += 1;
                continue;
            }

            let probe = self.probe.clone();
            let tracker = self.tracker;
            let timeout = self.timeout;
            probes.spawn(async move {
                let result = run_probe(probe, instance.snapshot(), timeout).await;
                apply_result(&tracker, &instance, result);
                result.is_success()
            });
        }

        while let Some(joined) = probes.join_next().await {
            summary.probed += 1;
            match joined {
                Ok(true) => summary.succeeded += 1,
                Ok(false) => summary.failed += 1,
                Err(e) => {
                    error!(error = %e, "health check task failed");
                    summary.failed += 1;
                }
            }
        }

        debug!(
            probed = summary.probed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "health sweep complete"
        );
        summary
    }

    /// Spawn the background loop. Returns `false` if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut task = self.task.lock();
        if task.is_some() {
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let checker = self.clone();
        let handle = tokio::spawn(async move {
            checker.run(shutdown_rx).await;
        });
        *task = Some(LoopSlot {
            handle,
            shutdown_tx,
        });

        info!(
            interval_secs = self.interval.as_secs(),
            timeout_ms = self.timeout.as_millis() as u64,
            threshold = self.tracker.unhealthy_threshold(),
            "health checker started"
        );
        true
    }

    /// Signal the loop to stop and wait for its current sweep to finish.
    pub async fn stop(&self) {
        let slot = self.task.lock().take();
        if let Some(slot) = slot {
            let _ = slot.shutdown_tx.send(true);
            if let Err(e) = slot.handle.await {
                error!(error = %e, "health checker task ended abnormally");
            }
            info!("health checker stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.check_all().await;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    debug!("health loop shutting down");
                    break;
                }
            }
        }
    }
}

fn apply_result(tracker: &HealthTracker, instance: &ServiceInstance, result: ProbeResult) -> InstanceStatus {
    let checked_at = epoch_secs();
    let (previous, current) = instance.with_vitals(|vitals| {
        let previous = vitals.status;
        (previous, tracker.record(vitals, result, checked_at))
    });

    if previous != current {
        info!(
            service = %instance.service(),
            instance = %instance.id(),
            from = %previous,
            to = %current,
            "instance health changed"
        );
    }
    current
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use scalegrid_registry::{InstanceSnapshot, InstanceSpec};

    use crate::checker::{ProbeError, ProbeReport};

    /// Plays back scripted reports per instance; healthy once a script runs out.
    #[derive(Default)]
    struct ScriptedProbe {
        scripts: parking_lot::Mutex<HashMap<String, VecDeque<Result<ProbeReport, ProbeError>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn script(&self, id: &str, results: Vec<Result<ProbeReport, ProbeError>>) {
            self.scripts.lock().insert(id.to_string(), results.into());
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, instance: &InstanceSnapshot) -> Result<ProbeReport, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if instance.id == "hang" {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.scripts
                .lock()
                .get_mut(&instance.id)
                .and_then(|q| q.pop_front())
                .unwrap_or(Ok(ProbeReport::healthy(20.0, 128.0)))
        }
    }

    fn settings(threshold: u32) -> HealthSettings {
        HealthSettings {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(1),
            unhealthy_threshold: threshold,
        }
    }

    fn register(registry: &ServiceRegistry, service: &str, id: &str) -> Arc<ServiceInstance> {
        registry
            .register(service, InstanceSpec::new(format!("{id}:80")).with_id(id))
            .unwrap()
    }

    #[tokio::test]
    async fn sweep_promotes_starting_instances() {
        let registry = ServiceRegistry::new();
        let a = register(&registry, "video", "a");
        let b = register(&registry, "cache", "b");

        let checker = HealthChecker::new(registry, Arc::new(ScriptedProbe::default()), &settings(3));
        let summary = checker.check_all().await;

        assert_eq!(summary.probed, 2);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(a.status(), InstanceStatus::Healthy);
        assert_eq!(b.status(), InstanceStatus::Healthy);
        assert_eq!(a.cpu_usage(), 20.0);
        assert!(a.vitals().last_health_check.is_some());
    }

    #[tokio::test]
    async fn three_failures_then_recovery() {
        let registry = ServiceRegistry::new();
        let x = register(&registry, "video", "x");
        x.set_status(InstanceStatus::Healthy);

        let probe = Arc::new(ScriptedProbe::default());
        probe.script(
            "x",
            vec![
                Ok(ProbeReport::unhealthy()),
                Ok(ProbeReport::unhealthy()),
                Ok(ProbeReport::unhealthy()),
                Ok(ProbeReport::healthy(10.0, 64.0)),
            ],
        );
        let checker = HealthChecker::new(registry, probe, &settings(3));

        checker.check_all().await;
        checker.check_all().await;
        assert_eq!(x.status(), InstanceStatus::Healthy);

        checker.check_all().await;
        assert_eq!(x.status(), InstanceStatus::Unhealthy);
        assert_eq!(x.vitals().consecutive_failures, 3);

        checker.check_all().await;
        assert_eq!(x.status(), InstanceStatus::Healthy);
        assert_eq!(x.vitals().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn maintenance_and_stopping_are_skipped() {
        let registry = ServiceRegistry::new();
        let parked = register(&registry, "video", "parked");
        let leaving = register(&registry, "video", "leaving");
        parked.set_status(InstanceStatus::Maintenance);
        leaving.set_status(InstanceStatus::Stopping);

        let probe = Arc::new(ScriptedProbe::default());
        let checker = HealthChecker::new(registry, probe.clone(), &settings(3));
        let summary = checker.check_all().await;

        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.probed, 0);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        assert_eq!(parked.status(), InstanceStatus::Maintenance);
        assert_eq!(
            checker.check_instance(&leaving).await,
            InstanceStatus::Stopping
        );
    }

    #[tokio::test]
    async fn errors_do_not_stop_other_probes() {
        let registry = ServiceRegistry::new();
        let bad = register(&registry, "video", "bad");
        let good = register(&registry, "video", "good");

        let probe = Arc::new(ScriptedProbe::default());
        probe.script("bad", vec![Err(ProbeError::Failed("connection refused".into()))]);
        let checker = HealthChecker::new(registry, probe, &settings(1));

        let summary = checker.check_all().await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(bad.status(), InstanceStatus::Unhealthy);
        assert_eq!(good.status(), InstanceStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_probe_only_costs_its_timeout() {
        let registry = ServiceRegistry::new();
        let hang = register(&registry, "video", "hang");
        let fine = register(&registry, "video", "fine");
        hang.set_status(InstanceStatus::Healthy);

        let checker = HealthChecker::new(registry, Arc::new(ScriptedProbe::default()), &settings(1));
        let started = tokio::time::Instant::now();
        let summary = checker.check_all().await;

        assert!(started.elapsed() <= Duration::from_secs(2));
        assert_eq!(summary.failed, 1);
        assert_eq!(hang.status(), InstanceStatus::Unhealthy);
        assert_eq!(fine.status(), InstanceStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_runs_until_stopped() {
        let registry = ServiceRegistry::new();
        register(&registry, "video", "a");

        let probe = Arc::new(ScriptedProbe::default());
        let checker = Arc::new(HealthChecker::new(registry, probe.clone(), &settings(3)));

        assert!(checker.start());
        assert!(!checker.start(), "second start is a no-op");
        assert!(checker.is_running());

        // Immediate sweep plus two interval sweeps.
        tokio::time::sleep(Duration::from_secs(61)).await;
        checker.stop().await;
        assert!(!checker.is_running());

        let calls = probe.calls.load(Ordering::SeqCst);
        assert_eq!(calls, 3);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), calls, "no sweeps after stop");
    }
}
