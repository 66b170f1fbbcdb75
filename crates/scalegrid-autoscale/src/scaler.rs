//! Autoscaler — threshold-driven instance scaling.
//!
//! Each pass aggregates every rule's metric over the healthy instances of
//! its service, compares against the rule's thresholds, and provisions or
//! drains instances through a [`Provisioner`]. A rule that moved the
//! registry by the full step is held back for its cooldown window.
//! Deprovision calls that fail after an instance left the registry are
//! queued and retried at the start of later passes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use scalegrid_core::{AutoscaleSettings, ConfigResult, ScalingRule};
use scalegrid_health::HealthChecker;
use scalegrid_registry::{ServiceInstance, ServiceRegistry, wait_for_drain};

use crate::error::{ScaleError, ScaleResult};
use crate::history::{ScalingDirection, ScalingEvent, ScalingHistory};
use crate::provisioner::Provisioner;
use crate::rules::{ScaleDecision, TrackedRule, aggregate, decide};

/// Result of a scale-up or scale-down action.
#[derive(Debug)]
pub struct ScaleOutcome {
    pub requested: u32,
    /// Instances added to or removed from the registry.
    pub instance_ids: Vec<String>,
    /// First error hit; the action stops at a failed provision but keeps
    /// going past a failed removal. A failed deprovision is reported here
    /// even though its instance is listed in `instance_ids`.
    pub error: Option<ScaleError>,
}

impl ScaleOutcome {
    fn new(requested: u32) -> Self {
        Self {
            requested,
            instance_ids: Vec::new(),
            error: None,
        }
    }

    pub fn completed(&self) -> u32 {
        self.instance_ids.len() as u32
    }

    /// Whether the registry changed by the full requested amount.
    pub fn reached_target(&self) -> bool {
        self.completed() == self.requested
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.reached_target()
    }
}

struct LoopSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Evaluates scaling rules and grows or shrinks services to match.
pub struct AutoScaler {
    registry: ServiceRegistry,
    provisioner: Arc<dyn Provisioner>,
    health: Option<Arc<HealthChecker>>,
    rules: RwLock<HashMap<String, Vec<TrackedRule>>>,
    next_rule_id: AtomicU64,
    history: ScalingHistory,
    /// `(service, instance id)` pairs removed from the registry whose
    /// deprovision call failed.
    pending_deprovisions: Mutex<Vec<(String, String)>>,
    interval: Duration,
    drain_timeout: Duration,
    drain_poll_interval: Duration,
    provision_timeout: Duration,
    /// Serializes evaluation passes so a manual pass and the loop never
    /// act on the same service at once.
    pass: tokio::sync::Mutex<()>,
    task: Mutex<Option<LoopSlot>>,
}

impl AutoScaler {
    pub fn new(
        registry: ServiceRegistry,
        provisioner: Arc<dyn Provisioner>,
        settings: &AutoscaleSettings,
    ) -> Self {
        Self {
            registry,
            provisioner,
            health: None,
            rules: RwLock::new(HashMap::new()),
            next_rule_id: AtomicU64::new(1),
            history: ScalingHistory::new(settings.history_limit),
            pending_deprovisions: Mutex::new(Vec::new()),
            interval: settings.interval,
            drain_timeout: settings.drain_timeout,
            drain_poll_interval: settings.drain_poll_interval,
            provision_timeout: settings.provision_timeout,
            pass: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        }
    }

    /// Probe newly provisioned instances right away instead of waiting for
    /// the next health sweep.
    pub fn with_health_checker(mut self, checker: Arc<HealthChecker>) -> Self {
        self.health = Some(checker);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn history(&self) -> &ScalingHistory {
        &self.history
    }

    /// Validate a rule and add it to `service`.
    pub fn add_rule(&self, service: &str, rule: ScalingRule) -> ConfigResult<()> {
        rule.validate()?;
        let tracked = TrackedRule::new(self.next_rule_id.fetch_add(1, Ordering::Relaxed), rule);
        info!(
            %service,
            metric = %tracked.rule.metric,
            threshold_up = tracked.rule.threshold_up,
            threshold_down = tracked.rule.threshold_down,
            "scaling rule added"
        );
        self.rules
            .write()
            .entry(service.to_string())
            .or_default()
            .push(tracked);
        Ok(())
    }

    /// Swap every rule of `service` at once. Nothing changes if any rule is
    /// invalid; an empty list removes the service's rules.
    pub fn replace_rules(&self, service: &str, rules: Vec<ScalingRule>) -> ConfigResult<()> {
        for rule in &rules {
            rule.validate()?;
        }

        let tracked: Vec<TrackedRule> = rules
            .into_iter()
            .map(|rule| TrackedRule::new(self.next_rule_id.fetch_add(1, Ordering::Relaxed), rule))
            .collect();
        let count = tracked.len();

        let mut all = self.rules.write();
        if tracked.is_empty() {
            all.remove(service);
        } else {
            all.insert(service.to_string(), tracked);
        }
        info!(%service, rules = count, "scaling rules replaced");
        Ok(())
    }

    pub fn rules(&self, service: &str) -> Vec<ScalingRule> {
        self.rules
            .read()
            .get(service)
            .map(|rules| rules.iter().map(|t| t.rule.clone()).collect())
            .unwrap_or_default()
    }

    pub fn services_with_rules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rules.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Instances that left the registry but still wait on a successful
    /// deprovision call.
    pub fn pending_deprovisions(&self) -> Vec<(String, String)> {
        self.pending_deprovisions.lock().clone()
    }

    /// Run one pass over every service with rules.
    ///
    /// Queued deprovisions are retried first. A failing service is logged
    /// and recorded; the others still run.
    pub async fn evaluate_all(&self) -> Vec<(String, ScaleDecision)> {
        let _pass = self.pass.lock().await;
        self.retry_deprovisions(None).await;

        let mut decisions = Vec::new();
        for service in self.services_with_rules() {
            for decision in self.evaluate_rules(&service).await {
                decisions.push((service.clone(), decision));
            }
        }
        decisions
    }

    /// Evaluate every rule of one service, acting on each decision.
    ///
    /// A service with no healthy instances has no aggregate and is skipped.
    pub async fn evaluate_service(&self, service: &str) -> Vec<ScaleDecision> {
        let _pass = self.pass.lock().await;
        self.retry_deprovisions(Some(service)).await;
        self.evaluate_rules(service).await
    }

    async fn evaluate_rules(&self, service: &str) -> Vec<ScaleDecision> {
        let tracked = self.rules.read().get(service).cloned().unwrap_or_default();
        let mut decisions = Vec::with_capacity(tracked.len());

        for entry in tracked {
            let healthy = self.registry.healthy(service);
            let Some(value) = aggregate(entry.rule.metric, &healthy) else {
                debug!(%service, "no healthy instances; skipping scaling evaluation");
                break;
            };

            if entry.in_cooldown(Instant::now()) {
                debug!(%service, metric = %entry.rule.metric, "rule in cooldown");
                decisions.push(ScaleDecision::NoChange);
                continue;
            }

            let live = self.registry.live_count(service) as u32;
            let decision = decide(&entry.rule, value, live);
            let outcome = match decision {
                ScaleDecision::ScaleUp(count) => {
                    info!(
                        %service,
                        metric = %entry.rule.metric,
                        value,
                        threshold = entry.rule.threshold_up,
                        live,
                        count,
                        "scaling up"
                    );
                    Some((ScalingDirection::Up, self.scale_up(service, count).await))
                }
                ScaleDecision::ScaleDown(count) => {
                    info!(
                        %service,
                        metric = %entry.rule.metric,
                        value,
                        threshold = entry.rule.threshold_down,
                        live,
                        count,
                        "scaling down"
                    );
                    Some((ScalingDirection::Down, self.scale_down(service, count).await))
                }
                ScaleDecision::NoChange => None,
            };

            if let Some((direction, outcome)) = outcome {
                if outcome.reached_target() {
                    self.mark_scaled(service, entry.id);
                }
                if !outcome.is_success() {
                    warn!(
                        %service,
                        %direction,
                        requested = outcome.requested,
                        completed = outcome.completed(),
                        error = ?outcome.error,
                        "scaling action incomplete"
                    );
                }
                self.record(service, direction, &entry.rule, value, outcome);
            }
            decisions.push(decision);
        }

        decisions
    }

    /// Provision and register `count` instances, stopping at the first
    /// failure.
    pub async fn scale_up(&self, service: &str, count: u32) -> ScaleOutcome {
        let mut outcome = ScaleOutcome::new(count);
        for _ in 0..count {
            match self.provision_one(service).await {
                Ok(instance) => outcome.instance_ids.push(instance.id().to_string()),
                Err(e) => {
                    outcome.error = Some(e);
                    break;
                }
            }
        }
        outcome
    }

    /// Drain and remove up to `count` of the least-loaded live instances.
    ///
    /// Only live instances are chosen, the same ones `live_count` counts,
    /// and `count` is capped at how many there are. Draining waits for
    /// open connections to close, up to the drain timeout; stragglers are
    /// removed anyway.
    pub async fn scale_down(&self, service: &str, count: u32) -> ScaleOutcome {
        let mut candidates: Vec<Arc<ServiceInstance>> = self
            .registry
            .list(service)
            .into_iter()
            .filter(|i| i.status().is_live())
            .collect();
        candidates.sort_by(|a, b| a.load_factor().total_cmp(&b.load_factor()));
        candidates.truncate(count as usize);

        let mut outcome = ScaleOutcome::new(candidates.len() as u32);

        // Status may have changed since the listing; only drain what is
        // still live at the moment it is claimed.
        candidates.retain(|instance| {
            let claimed = instance.begin_drain();
            if claimed {
                debug!(%service, instance = %instance.id(), "instance draining");
            } else {
                debug!(%service, instance = %instance.id(), "instance no longer live; skipped");
            }
            claimed
        });

        let stragglers = wait_for_drain(&candidates, self.drain_timeout, self.drain_poll_interval).await;
        if !stragglers.is_empty() {
            warn!(%service, instances = ?stragglers, "removing instances with open connections");
        }

        for instance in &candidates {
            if let Err(e) = self.registry.unregister(service, instance.id()) {
                warn!(%service, instance = %instance.id(), error = %e, "instance removal failed");
                if outcome.error.is_none() {
                    outcome.error = Some(e.into());
                }
                continue;
            }
            outcome.instance_ids.push(instance.id().to_string());

            if let Err(e) = self.deprovision(service, instance.id()).await {
                warn!(%service, instance = %instance.id(), error = %e, "deprovision failed; queued for retry");
                self.pending_deprovisions
                    .lock()
                    .push((service.to_string(), instance.id().to_string()));
                if outcome.error.is_none() {
                    outcome.error = Some(e);
                }
            }
        }
        outcome
    }

    async fn provision_one(&self, service: &str) -> ScaleResult<Arc<ServiceInstance>> {
        let spec = match tokio::time::timeout(self.provision_timeout, self.provisioner.provision(service)).await {
            Ok(Ok(spec)) => spec,
            Ok(Err(error)) => {
                return Err(ScaleError::Provision {
                    service: service.to_string(),
                    error,
                });
            }
            Err(_) => {
                return Err(ScaleError::ProvisionTimeout {
                    service: service.to_string(),
                    timeout: self.provision_timeout,
                });
            }
        };

        let instance = self.registry.register(service, spec)?;
        if let Some(checker) = &self.health {
            let status = checker.check_instance(&instance).await;
            debug!(%service, instance = %instance.id(), %status, "initial health check");
        }
        Ok(instance)
    }

    /// Retry queued deprovisions, all of them or those of one service.
    /// Returns how many are still pending afterwards.
    pub async fn retry_deprovisions(&self, service: Option<&str>) -> usize {
        let due: Vec<(String, String)> = {
            let mut pending = self.pending_deprovisions.lock();
            let (due, keep): (Vec<_>, Vec<_>) = pending
                .drain(..)
                .partition(|(svc, _)| service.is_none_or(|s| s == svc.as_str()));
            *pending = keep;
            due
        };

        for (svc, id) in due {
            match self.deprovision(&svc, &id).await {
                Ok(()) => info!(service = %svc, instance = %id, "queued deprovision succeeded"),
                Err(e) => {
                    warn!(service = %svc, instance = %id, error = %e, "deprovision retry failed");
                    self.pending_deprovisions.lock().push((svc, id));
                }
            }
        }
        self.pending_deprovisions.lock().len()
    }

    async fn deprovision(&self, service: &str, instance_id: &str) -> ScaleResult<()> {
        self.provisioner
            .deprovision(service, instance_id)
            .await
            .map_err(|error| ScaleError::Deprovision {
                service: service.to_string(),
                id: instance_id.to_string(),
                error,
            })
    }

    fn mark_scaled(&self, service: &str, rule_id: u64) {
        let mut rules = self.rules.write();
        // The rule may have been replaced while the action ran.
        if let Some(tracked) = rules
            .get_mut(service)
            .and_then(|rules| rules.iter_mut().find(|t| t.id == rule_id))
        {
            tracked.last_scaled = Some(Instant::now());
        }
    }

    fn record(
        &self,
        service: &str,
        direction: ScalingDirection,
        rule: &ScalingRule,
        value: f64,
        outcome: ScaleOutcome,
    ) {
        let success = outcome.is_success();
        self.history.push(ScalingEvent {
            service: service.to_string(),
            direction,
            metric: rule.metric,
            metric_value: value,
            requested: outcome.requested,
            completed: outcome.completed(),
            success,
            error: outcome.error.map(|e| e.to_string()),
            instance_ids: outcome.instance_ids,
            timestamp: epoch_secs(),
        });
    }

    /// Spawn the background loop. Returns `false` if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut task = self.task.lock();
        if task.is_some() {
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scaler = self.clone();
        let handle = tokio::spawn(async move {
            scaler.run(shutdown_rx).await;
        });
        *task = Some(LoopSlot {
            handle,
            shutdown_tx,
        });

        info!(interval_secs = self.interval.as_secs(), "autoscaler started");
        true
    }

    /// Signal the loop to stop and wait for the current pass to finish.
    pub async fn stop(&self) {
        let slot = self.task.lock().take();
        if let Some(slot) = slot {
            let _ = slot.shutdown_tx.send(true);
            if let Err(e) = slot.handle.await {
                error!(error = %e, "autoscaler task ended abnormally");
            }
            info!("autoscaler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let decisions = self.evaluate_all().await;
                    debug!(evaluated = decisions.len(), "autoscale pass complete");
                }
                _ = shutdown.changed() => {
                    debug!("autoscale loop shutting down");
                    break;
                }
            }
        }
    }
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
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use scalegrid_core::{HealthSettings, ScalingMetric};
    use scalegrid_health::{HealthProbe, ProbeError, ProbeReport};
    use scalegrid_registry::{InstanceSnapshot, InstanceSpec, InstanceStatus};

    /// Hands out `new-N` instances; the first `fail_first` calls error.
    /// The first `fail_deprovisions` deprovision calls error too.
    #[derive(Default)]
    struct FakeProvisioner {
        provisioned: AtomicUsize,
        fail_first: AtomicUsize,
        fail_deprovisions: AtomicUsize,
        hang: bool,
        removed: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Provisioner for FakeProvisioner {
        async fn provision(&self, _service: &str) -> anyhow::Result<InstanceSpec> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("quota exceeded");
            }
            let n = self.provisioned.fetch_add(1, Ordering::SeqCst);
            Ok(InstanceSpec::new(format!("10.0.0.{n}:80")).with_id(format!("new-{n}")))
        }

        async fn deprovision(&self, _service: &str, instance_id: &str) -> anyhow::Result<()> {
            if self
                .fail_deprovisions
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("cloud api unavailable");
            }
            self.removed.lock().push(instance_id.to_string());
            Ok(())
        }
    }

    struct AlwaysHealthy;

    #[async_trait]
    impl HealthProbe for AlwaysHealthy {
        async fn probe(&self, _instance: &InstanceSnapshot) -> Result<ProbeReport, ProbeError> {
            Ok(ProbeReport::healthy(5.0, 64.0))
        }
    }

    fn settings() -> AutoscaleSettings {
        AutoscaleSettings {
            drain_timeout: Duration::from_secs(30),
            drain_poll_interval: Duration::from_millis(100),
            provision_timeout: Duration::from_secs(10),
            ..AutoscaleSettings::default()
        }
    }

    fn healthy(registry: &ServiceRegistry, service: &str, id: &str, cpu: f64) -> Arc<ServiceInstance> {
        let inst = registry
            .register(service, InstanceSpec::new(format!("{id}:80")).with_id(id))
            .unwrap();
        inst.set_status(InstanceStatus::Healthy);
        inst.update_resource_usage(cpu, 128.0);
        inst
    }

    fn scaler(registry: &ServiceRegistry, provisioner: Arc<FakeProvisioner>) -> AutoScaler {
        AutoScaler::new(registry.clone(), provisioner, &settings())
    }

    #[test]
    fn invalid_rules_are_rejected() {
        let registry = ServiceRegistry::new();
        let scaler = scaler(&registry, Arc::default());

        let bad = ScalingRule::new(ScalingMetric::Cpu, 30.0, 70.0);
        assert!(scaler.add_rule("video", bad.clone()).is_err());
        assert!(scaler.rules("video").is_empty());

        let good = ScalingRule::new(ScalingMetric::Cpu, 70.0, 30.0);
        assert!(scaler.replace_rules("video", vec![good.clone(), bad]).is_err());
        assert!(scaler.rules("video").is_empty());

        scaler.replace_rules("video", vec![good.clone()]).unwrap();
        assert_eq!(scaler.rules("video"), vec![good]);
        scaler.replace_rules("video", vec![]).unwrap();
        assert!(scaler.services_with_rules().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn one_scale_up_per_cooldown_window() {
        let registry = ServiceRegistry::new();
        healthy(&registry, "video", "v1", 85.0);
        let provisioner = Arc::new(FakeProvisioner::default());
        let scaler = scaler(&registry, provisioner.clone());
        scaler
            .add_rule(
                "video",
                ScalingRule::new(ScalingMetric::Cpu, 70.0, 30.0)
                    .with_bounds(1, 10)
                    .with_cooldown(Duration::from_secs(300)),
            )
            .unwrap();

        // Evaluated every 60 s for the first 300 s.
        let mut ups = 0;
        for _ in 0..5 {
            for (_, decision) in scaler.evaluate_all().await {
                if let ScaleDecision::ScaleUp(_) = decision {
                    ups += 1;
                }
            }
            tokio::time::advance(Duration::from_secs(60)).await;
        }
        assert_eq!(ups, 1);
        assert_eq!(provisioner.provisioned.load(Ordering::SeqCst), 1);

        // Cooldown over at t = 300 s.
        let decisions = scaler.evaluate_service("video").await;
        assert_eq!(decisions, vec![ScaleDecision::ScaleUp(1)]);
        assert_eq!(registry.instance_count("video"), 3);
        assert_eq!(scaler.history().len(), 2);
    }

    #[tokio::test]
    async fn failed_provision_is_retried_next_pass() {
        let registry = ServiceRegistry::new();
        healthy(&registry, "video", "v1", 85.0);
        let provisioner = Arc::new(FakeProvisioner::default());
        provisioner.fail_first.store(1, Ordering::SeqCst);
        let scaler = scaler(&registry, provisioner.clone());
        scaler
            .add_rule("video", ScalingRule::new(ScalingMetric::Cpu, 70.0, 30.0))
            .unwrap();

        scaler.evaluate_all().await;
        let events = scaler.history().events();
        let first = &events[0];
        assert!(!first.success);
        assert_eq!(first.completed, 0);
        assert!(first.error.as_deref().unwrap_or_default().contains("quota exceeded"));
        assert_eq!(registry.instance_count("video"), 1);

        // No cooldown after a failure.
        scaler.evaluate_all().await;
        let events = scaler.history().events();
        let second = &events[1];
        assert!(second.success);
        assert_eq!(second.instance_ids, vec!["new-0".to_string()]);
        assert_eq!(registry.instance_count("video"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn provision_timeout_is_a_failure() {
        let registry = ServiceRegistry::new();
        let provisioner = Arc::new(FakeProvisioner {
            hang: true,
            ..FakeProvisioner::default()
        });
        let scaler = scaler(&registry, provisioner);

        let outcome = scaler.scale_up("video", 2).await;
        assert_eq!(outcome.completed(), 0);
        assert!(matches!(outcome.error, Some(ScaleError::ProvisionTimeout { .. })));
        assert_eq!(registry.instance_count("video"), 0);
    }

    #[tokio::test]
    async fn respects_max_instances() {
        let registry = ServiceRegistry::new();
        healthy(&registry, "video", "v1", 85.0);
        healthy(&registry, "video", "v2", 85.0);
        let scaler = scaler(&registry, Arc::default());
        scaler
            .add_rule(
                "video",
                ScalingRule::new(ScalingMetric::Cpu, 70.0, 30.0)
                    .with_bounds(1, 3)
                    .with_steps(5, 1)
                    .with_cooldown(Duration::ZERO),
            )
            .unwrap();

        assert_eq!(scaler.evaluate_service("video").await, vec![ScaleDecision::ScaleUp(1)]);
        assert_eq!(scaler.evaluate_service("video").await, vec![ScaleDecision::NoChange]);
        assert_eq!(registry.instance_count("video"), 3);
    }

    #[tokio::test]
    async fn scale_down_removes_least_loaded_down_to_min() {
        let registry = ServiceRegistry::new();
        healthy(&registry, "video", "busy", 25.0);
        healthy(&registry, "video", "idle", 2.0);
        healthy(&registry, "video", "quiet", 8.0);
        healthy(&registry, "video", "spare", 15.0);
        let parked = healthy(&registry, "video", "parked", 0.0);
        parked.set_status(InstanceStatus::Maintenance);

        let provisioner = Arc::new(FakeProvisioner::default());
        let scaler = scaler(&registry, provisioner.clone());
        scaler
            .add_rule(
                "video",
                ScalingRule::new(ScalingMetric::Cpu, 70.0, 30.0)
                    .with_bounds(2, 10)
                    .with_steps(1, 5),
            )
            .unwrap();

        let decisions = scaler.evaluate_service("video").await;
        assert_eq!(decisions, vec![ScaleDecision::ScaleDown(2)]);

        let removed: HashSet<String> = provisioner.removed.lock().iter().cloned().collect();
        assert_eq!(removed, HashSet::from(["idle".to_string(), "quiet".to_string()]));
        assert!(registry.get("video", "busy").is_some());
        assert!(registry.get("video", "parked").is_some());
        assert_eq!(registry.live_count("video"), 2);
    }

    #[tokio::test]
    async fn maintenance_instances_do_not_count_toward_min() {
        let registry = ServiceRegistry::new();
        healthy(&registry, "video", "routable", 5.0);
        for id in ["m1", "m2"] {
            healthy(&registry, "video", id, 5.0).set_status(InstanceStatus::Maintenance);
        }

        let provisioner = Arc::new(FakeProvisioner::default());
        let scaler = scaler(&registry, provisioner.clone());
        scaler
            .add_rule(
                "video",
                ScalingRule::new(ScalingMetric::Cpu, 70.0, 30.0)
                    .with_bounds(2, 10)
                    .with_cooldown(Duration::ZERO),
            )
            .unwrap();

        assert_eq!(scaler.evaluate_service("video").await, vec![ScaleDecision::NoChange]);
        assert_eq!(registry.healthy("video").len(), 1);
        assert!(provisioner.removed.lock().is_empty());
        assert!(scaler.history().is_empty());
    }

    #[tokio::test]
    async fn scale_down_caps_count_at_live_instances() {
        let registry = ServiceRegistry::new();
        healthy(&registry, "video", "a", 5.0);
        healthy(&registry, "video", "b", 5.0);
        healthy(&registry, "video", "parked", 5.0).set_status(InstanceStatus::Maintenance);
        let scaler = scaler(&registry, Arc::default());

        let outcome = scaler.scale_down("video", 5).await;
        assert_eq!(outcome.requested, 2);
        assert_eq!(outcome.completed(), 2);
        assert!(outcome.is_success());
        assert_eq!(registry.instance_count("video"), 1);
        assert_eq!(
            registry.get("video", "parked").unwrap().status(),
            InstanceStatus::Maintenance
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_deprovision_is_retried_without_removing_more() {
        let registry = ServiceRegistry::new();
        for id in ["a", "b", "c", "d"] {
            healthy(&registry, "video", id, 5.0);
        }
        let provisioner = Arc::new(FakeProvisioner::default());
        provisioner.fail_deprovisions.store(2, Ordering::SeqCst);
        let scaler = scaler(&registry, provisioner.clone());
        scaler
            .add_rule(
                "video",
                ScalingRule::new(ScalingMetric::Cpu, 70.0, 30.0)
                    .with_bounds(1, 10)
                    .with_steps(1, 1)
                    .with_cooldown(Duration::from_secs(300)),
            )
            .unwrap();

        scaler.evaluate_all().await;
        let events = scaler.history().events();
        let first = &events[0];
        assert!(!first.success);
        assert_eq!(first.completed, 1);
        assert_eq!(first.instance_ids.len(), 1);
        assert!(first.error.as_deref().unwrap_or_default().contains("cloud api unavailable"));
        let removed_id = first.instance_ids[0].clone();
        assert_eq!(registry.instance_count("video"), 3);
        assert_eq!(
            scaler.pending_deprovisions(),
            vec![("video".to_string(), removed_id.clone())]
        );

        // The removal started the cooldown; the next pass only retries
        // the deprovision, which fails once more.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(
            scaler.evaluate_all().await,
            vec![("video".to_string(), ScaleDecision::NoChange)]
        );
        assert_eq!(registry.instance_count("video"), 3);
        assert_eq!(scaler.pending_deprovisions().len(), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        scaler.evaluate_all().await;
        assert!(scaler.pending_deprovisions().is_empty());
        assert_eq!(*provisioner.removed.lock(), vec![removed_id]);
        assert_eq!(registry.instance_count("video"), 3);
        assert_eq!(scaler.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scale_down_waits_for_drain() {
        let registry = ServiceRegistry::new();
        let inst = healthy(&registry, "video", "v1", 1.0);
        inst.acquire_connection();
        let provisioner = Arc::new(FakeProvisioner::default());
        let scaler = scaler(&registry, provisioner.clone());

        let draining = inst.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            draining.release_connection();
        });

        let started = Instant::now();
        let outcome = scaler.scale_down("video", 1).await;
        let waited = started.elapsed();

        assert!(outcome.is_success());
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(30));
        assert_eq!(inst.status(), InstanceStatus::Stopping);
        assert_eq!(registry.instance_count("video"), 0);
        assert_eq!(*provisioner.removed.lock(), vec!["v1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeout_still_removes() {
        let registry = ServiceRegistry::new();
        let inst = healthy(&registry, "video", "stuck", 1.0);
        inst.acquire_connection();
        let scaler = scaler(&registry, Arc::default());

        let started = Instant::now();
        let outcome = scaler.scale_down("video", 1).await;
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(outcome.is_success());
        assert_eq!(registry.instance_count("video"), 0);
    }

    #[tokio::test]
    async fn no_healthy_instances_skips_service() {
        let registry = ServiceRegistry::new();
        let down = healthy(&registry, "video", "v1", 85.0);
        down.set_status(InstanceStatus::Unhealthy);
        let provisioner = Arc::new(FakeProvisioner::default());
        let scaler = scaler(&registry, provisioner.clone());
        scaler
            .add_rule("video", ScalingRule::new(ScalingMetric::Cpu, 70.0, 30.0))
            .unwrap();

        assert!(scaler.evaluate_all().await.is_empty());
        assert_eq!(provisioner.provisioned.load(Ordering::SeqCst), 0);
        assert!(scaler.history().is_empty());
    }

    #[tokio::test]
    async fn new_instances_are_probed_immediately() {
        let registry = ServiceRegistry::new();
        let checker = Arc::new(HealthChecker::new(
            registry.clone(),
            Arc::new(AlwaysHealthy),
            &HealthSettings::default(),
        ));
        let scaler = scaler(&registry, Arc::default()).with_health_checker(checker);

        let outcome = scaler.scale_up("video", 2).await;
        assert!(outcome.is_success());
        assert_eq!(registry.healthy("video").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_runs_until_stopped() {
        let registry = ServiceRegistry::new();
        healthy(&registry, "video", "v1", 85.0);
        let provisioner = Arc::new(FakeProvisioner::default());
        let scaler = Arc::new(scaler(&registry, provisioner.clone()));
        scaler
            .add_rule(
                "video",
                ScalingRule::new(ScalingMetric::Cpu, 70.0, 30.0).with_cooldown(Duration::ZERO),
            )
            .unwrap();

        assert!(scaler.start());
        assert!(!scaler.start());

        // Passes at 60 s and 120 s.
        tokio::time::sleep(Duration::from_secs(150)).await;
        scaler.stop().await;
        assert!(!scaler.is_running());
        assert_eq!(provisioner.provisioned.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(provisioner.provisioned.load(Ordering::SeqCst), 2);
    }
}
