//! ServiceRegistry — in-memory ownership of all service instances.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{RegistryError, RegistryResult};
use crate::instance::{InstanceSpec, InstanceStatus, ServiceInstance};

/// Instances of one service, in registration order.
#[derive(Default)]
struct ServicePool {
    instances: RwLock<Vec<Arc<ServiceInstance>>>,
}

#[derive(Default)]
struct RegistryInner {
    services: RwLock<HashMap<String, Arc<ServicePool>>>,
    next_seq: AtomicU64,
}

/// Thread-safe registry of service instances.
///
/// Cloning is cheap and every clone sees the same instances, so one
/// registry can be handed to the health checker, load balancer and
/// autoscaler of a single scaling system.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self, service: &str) -> Option<Arc<ServicePool>> {
        self.inner.services.read().get(service).cloned()
    }

    fn pool_or_create(&self, service: &str) -> Arc<ServicePool> {
        if let Some(pool) = self.pool(service) {
            return pool;
        }
        self.inner
            .services
            .write()
            .entry(service.to_string())
            .or_default()
            .clone()
    }

    /// Add an instance to a service in `Starting` state.
    ///
    /// Generates `{service}-{n}` when `spec.id` is unset.
    pub fn register(&self, service: &str, spec: InstanceSpec) -> RegistryResult<Arc<ServiceInstance>> {
        if spec.address.trim().is_empty() {
            return Err(RegistryError::EmptyAddress);
        }

        let pool = self.pool_or_create(service);
        let mut instances = pool.instances.write();

        let id = match spec.id.clone() {
            Some(id) => {
                if instances.iter().any(|i| i.id() == id) {
                    return Err(RegistryError::DuplicateInstance {
                        service: service.to_string(),
                        id,
                    });
                }
                id
            }
            None => loop {
                let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
                let candidate = format!("{service}-{seq}");
                if !instances.iter().any(|i| i.id() == candidate) {
                    break candidate;
                }
            },
        };

        let instance = Arc::new(ServiceInstance::new(service, id, spec));
        instances.push(instance.clone());

        info!(
            %service,
            instance = %instance.id(),
            address = %instance.address(),
            "instance registered"
        );
        Ok(instance)
    }

    /// Remove an instance immediately and hand back its record.
    pub fn unregister(&self, service: &str, instance_id: &str) -> RegistryResult<Arc<ServiceInstance>> {
        let not_found = || RegistryError::InstanceNotFound {
            service: service.to_string(),
            id: instance_id.to_string(),
        };

        let pool = self.pool(service).ok_or_else(not_found)?;
        let mut instances = pool.instances.write();
        let index = instances
            .iter()
            .position(|i| i.id() == instance_id)
            .ok_or_else(not_found)?;
        let removed = instances.remove(index);

        info!(%service, instance = %instance_id, "instance unregistered");
        Ok(removed)
    }

    pub fn get(&self, service: &str, instance_id: &str) -> Option<Arc<ServiceInstance>> {
        let pool = self.pool(service)?;
        let instances = pool.instances.read();
        instances.iter().find(|i| i.id() == instance_id).cloned()
    }

    /// All instances of a service in registration order.
    pub fn list(&self, service: &str) -> Vec<Arc<ServiceInstance>> {
        self.pool(service)
            .map(|pool| pool.instances.read().clone())
            .unwrap_or_default()
    }

    /// Instances that currently pass `is_healthy`, in registration order.
    pub fn healthy(&self, service: &str) -> Vec<Arc<ServiceInstance>> {
        self.pool(service)
            .map(|pool| {
                pool.instances
                    .read()
                    .iter()
                    .filter(|i| i.is_healthy())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every service name that has ever had an instance, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every instance across all services.
    pub fn all_instances(&self) -> Vec<Arc<ServiceInstance>> {
        let pools: Vec<Arc<ServicePool>> = self.inner.services.read().values().cloned().collect();
        pools
            .iter()
            .flat_map(|pool| pool.instances.read().clone())
            .collect()
    }

    pub fn instance_count(&self, service: &str) -> usize {
        self.pool(service)
            .map(|pool| pool.instances.read().len())
            .unwrap_or(0)
    }

    /// Instances neither draining nor parked in maintenance.
    pub fn live_count(&self, service: &str) -> usize {
        self.pool(service)
            .map(|pool| {
                pool.instances
                    .read()
                    .iter()
                    .filter(|i| i.status().is_live())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Force an instance into a status. Returns the previous status.
    pub fn set_status(
        &self,
        service: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> RegistryResult<InstanceStatus> {
        let instance = self
            .get(service, instance_id)
            .ok_or_else(|| RegistryError::InstanceNotFound {
                service: service.to_string(),
                id: instance_id.to_string(),
            })?;
        let previous = instance.set_status(status);
        debug!(%service, instance = %instance_id, from = %previous, to = %status, "status set");
        Ok(previous)
    }
}
