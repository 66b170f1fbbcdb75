use std::time::Duration;

use thiserror::Error;

use scalegrid_registry::RegistryError;

/// A scaling action that did not complete.
#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("provisioning an instance for {service} failed: {error:#}")]
    Provision {
        service: String,
        error: anyhow::Error,
    },

    #[error("provisioning an instance for {service} timed out after {timeout:?}")]
    ProvisionTimeout { service: String, timeout: Duration },

    #[error("deprovisioning {service}/{id} failed: {error:#}")]
    Deprovision {
        service: String,
        id: String,
        error: anyhow::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type ScaleResult<T> = Result<T, ScaleError>;
