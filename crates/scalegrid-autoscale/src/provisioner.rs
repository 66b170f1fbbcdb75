use async_trait::async_trait;

use scalegrid_registry::InstanceSpec;

/// Creates and destroys the backing resources of service instances.
///
/// The autoscaler registers whatever `provision` returns and calls
/// `deprovision` only after the instance has been drained and removed from
/// the registry.
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    async fn provision(&self, service: &str) -> anyhow::Result<InstanceSpec>;

    async fn deprovision(&self, service: &str, instance_id: &str) -> anyhow::Result<()>;
}
