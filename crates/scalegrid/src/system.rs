//! ScalingSystem — wires the registry, balancer, health checker and
//! autoscaler together behind one handle.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use scalegrid_autoscale::{AutoScaler, Provisioner};
use scalegrid_balancer::{LoadBalancer, RequestMetadata};
use scalegrid_core::{LoadBalanceStrategy, ScalegridConfig, ScalingRule};
use scalegrid_health::{HealthChecker, HealthProbe};
use scalegrid_registry::{
    InstanceId, InstanceSpec, InstanceStatus, RegistryError, ServiceInstance, ServiceRegistry,
    wait_for_drain,
};

use crate::error::ScalegridResult;
use crate::stats::{ServiceStats, SystemStats};

pub struct ScalingSystem {
    config: ScalegridConfig,
    registry: ServiceRegistry,
    balancer: LoadBalancer,
    health: Arc<HealthChecker>,
    scaler: Arc<AutoScaler>,
}

impl ScalingSystem {
    /// Build every component from `config`.
    ///
    /// The config is validated and its scaling rules are installed. Nothing
    /// runs until [`start`](Self::start).
    pub fn new(
        config: ScalegridConfig,
        probe: Arc<dyn HealthProbe>,
        provisioner: Arc<dyn Provisioner>,
    ) -> ScalegridResult<Self> {
        config.validate()?;

        let registry = ServiceRegistry::new();
        let balancer = LoadBalancer::from_settings(registry.clone(), &config.balancer);
        let health = Arc::new(HealthChecker::new(registry.clone(), probe, &config.health));
        let scaler = AutoScaler::new(registry.clone(), provisioner, &config.autoscale)
            .with_health_checker(health.clone());

        for entry in &config.autoscale.rules {
            scaler.add_rule(&entry.service, entry.rule.clone())?;
        }

        info!(
            strategy = %config.balancer.strategy,
            overrides = config.balancer.services.len(),
            rules = config.autoscale.rules.len(),
            "scaling system initialized"
        );

        Ok(Self {
            config,
            registry,
            balancer,
            health,
            scaler: Arc::new(scaler),
        })
    }

    pub fn config(&self) -> &ScalegridConfig {
        &self.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn health_checker(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    pub fn autoscaler(&self) -> &Arc<AutoScaler> {
        &self.scaler
    }

    /// Add an instance in `Starting` state and return its id.
    pub fn register(&self, service: &str, spec: InstanceSpec) -> ScalegridResult<InstanceId> {
        let instance = self.registry.register(service, spec)?;
        Ok(instance.id().to_string())
    }

    /// Drain an instance and remove it from the registry.
    ///
    /// The instance stops receiving traffic at once; removal waits for its
    /// open connections to close, up to the configured drain timeout. The
    /// provisioner is not involved.
    pub async fn unregister(&self, service: &str, instance_id: &str) -> ScalegridResult<()> {
        let instance = self
            .registry
            .get(service, instance_id)
            .ok_or_else(|| RegistryError::InstanceNotFound {
                service: service.to_string(),
                id: instance_id.to_string(),
            })?;

        instance.set_status(InstanceStatus::Stopping);
        let stragglers = wait_for_drain(
            std::slice::from_ref(&instance),
            self.config.autoscale.drain_timeout,
            self.config.autoscale.drain_poll_interval,
        )
        .await;
        if !stragglers.is_empty() {
            warn!(%service, instance = %instance_id, "unregistering with open connections");
        }

        self.registry.unregister(service, instance_id)?;
        Ok(())
    }

    pub fn route(
        &self,
        service: &str,
        metadata: Option<&RequestMetadata>,
    ) -> ScalegridResult<Arc<ServiceInstance>> {
        Ok(self.balancer.route(service, metadata)?)
    }

    pub fn release(&self, instance: &ServiceInstance, response_time_ms: f64, success: bool) {
        self.balancer.release(instance, response_time_ms, success);
    }

    pub fn add_scaling_rule(&self, service: &str, rule: ScalingRule) -> ScalegridResult<()> {
        self.scaler.add_rule(service, rule)?;
        Ok(())
    }

    pub fn replace_scaling_rules(&self, service: &str, rules: Vec<ScalingRule>) -> ScalegridResult<()> {
        self.scaler.replace_rules(service, rules)?;
        Ok(())
    }

    pub fn set_service_strategy(&self, service: &str, strategy: LoadBalanceStrategy) {
        self.balancer.set_service_strategy(service, strategy);
    }

    /// Take an instance out of probing, routing and scale-down selection.
    pub fn set_maintenance(&self, service: &str, instance_id: &str) -> ScalegridResult<()> {
        let previous = self
            .registry
            .set_status(service, instance_id, InstanceStatus::Maintenance)?;
        info!(%service, instance = %instance_id, from = %previous, "instance in maintenance");
        Ok(())
    }

    /// Return an instance from maintenance. It restarts as `Starting` and
    /// becomes routable after its next successful probe.
    pub fn clear_maintenance(&self, service: &str, instance_id: &str) -> ScalegridResult<()> {
        let instance = self
            .registry
            .get(service, instance_id)
            .ok_or_else(|| RegistryError::InstanceNotFound {
                service: service.to_string(),
                id: instance_id.to_string(),
            })?;

        let cleared = instance.with_vitals(|vitals| {
            if vitals.status != InstanceStatus::Maintenance {
                return false;
            }
            vitals.status = InstanceStatus::Starting;
            vitals.consecutive_failures = 0;
            true
        });
        if cleared {
            info!(%service, instance = %instance_id, "instance left maintenance");
        }
        Ok(())
    }

    pub fn stats(&self) -> SystemStats {
        let routing = self.balancer.stats().all();
        let mut services = BTreeMap::new();

        for name in self.registry.services() {
            let instances = self.registry.list(&name);
            let avg_response_time_ms = if instances.is_empty() {
                0.0
            } else {
                instances.iter().map(|i| i.response_time_ms()).sum::<f64>() / instances.len() as f64
            };
            let routed = routing.get(&name).cloned().unwrap_or_default();

            services.insert(
                name.clone(),
                ServiceStats {
                    instance_count: instances.len(),
                    healthy_count: instances.iter().filter(|i| i.is_healthy()).count(),
                    routing_distribution: routed.routing_distribution,
                    avg_response_time_ms,
                    total_requests: routed.total_requests,
                    failed_requests: routed.failed_requests,
                },
            );
        }

        SystemStats {
            services,
            scaling_history: self.scaler.history().events(),
        }
    }

    /// Launch the health and autoscale loops. Calling it twice is a no-op.
    pub fn start(&self) {
        let health = self.health.start();
        let scaler = self.scaler.start();
        if health || scaler {
            info!("scaling system started");
        }
    }

    /// Stop both loops and wait for their in-flight passes to finish.
    pub async fn stop(&self) {
        self.scaler.stop().await;
        self.health.stop().await;
        info!("scaling system stopped");
    }

    pub fn is_running(&self) -> bool {
        self.health.is_running() || self.scaler.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use scalegrid_core::ScalingMetric;
    use scalegrid_health::{ProbeError, ProbeReport};
    use scalegrid_registry::InstanceSnapshot;

    use crate::error::ScalegridError;

    struct Healthy;

    #[async_trait]
    impl HealthProbe for Healthy {
        async fn probe(&self, _instance: &InstanceSnapshot) -> Result<ProbeReport, ProbeError> {
            Ok(ProbeReport::healthy(10.0, 64.0))
        }
    }

    struct NoCapacity;

    #[async_trait]
    impl Provisioner for NoCapacity {
        async fn provision(&self, _service: &str) -> anyhow::Result<InstanceSpec> {
            anyhow::bail!("no capacity")
        }

        async fn deprovision(&self, _service: &str, _instance_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn system() -> ScalingSystem {
        ScalingSystem::new(ScalegridConfig::default(), Arc::new(Healthy), Arc::new(NoCapacity)).unwrap()
    }

    #[test]
    fn config_rules_are_installed() {
        let config = ScalegridConfig::from_toml(
            r#"
[[autoscale.rules]]
service = "video"
metric = "cpu"
threshold_up = 70.0
threshold_down = 30.0
"#,
        )
        .unwrap();
        let system = ScalingSystem::new(config, Arc::new(Healthy), Arc::new(NoCapacity)).unwrap();
        assert_eq!(system.autoscaler().rules("video").len(), 1);
    }

    #[test]
    fn invalid_rule_is_a_config_error() {
        let system = system();
        let err = system
            .add_scaling_rule("video", ScalingRule::new(ScalingMetric::Cpu, 20.0, 80.0))
            .unwrap_err();
        assert!(matches!(err, ScalegridError::Config(_)));
    }

    #[test]
    fn maintenance_round_trip() {
        let system = system();
        let id = system.register("api", InstanceSpec::new("a:80")).unwrap();
        system.registry().set_status("api", &id, InstanceStatus::Healthy).unwrap();

        system.set_maintenance("api", &id).unwrap();
        assert!(matches!(system.route("api", None), Err(ScalegridError::Balancer(_))));

        system.clear_maintenance("api", &id).unwrap();
        let instance = system.registry().get("api", &id).unwrap();
        assert_eq!(instance.status(), InstanceStatus::Starting);

        // Clearing an instance that is not in maintenance leaves it alone.
        instance.set_status(InstanceStatus::Healthy);
        system.clear_maintenance("api", &id).unwrap();
        assert_eq!(instance.status(), InstanceStatus::Healthy);

        assert!(matches!(
            system.set_maintenance("api", "missing"),
            Err(ScalegridError::Registry(RegistryError::InstanceNotFound { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_drains_first() {
        let system = system();
        let id = system.register("api", InstanceSpec::new("a:80")).unwrap();
        let instance = system.registry().get("api", &id).unwrap();
        instance.set_status(InstanceStatus::Healthy);

        let routed = system.route("api", None).unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            routed.release_connection();
        });

        system.unregister("api", &id).await.unwrap();
        release.await.unwrap();

        assert_eq!(instance.status(), InstanceStatus::Stopping);
        assert!(system.registry().get("api", &id).is_none());
        assert!(system.unregister("api", &id).await.is_err());
    }
}
