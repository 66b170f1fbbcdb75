use thiserror::Error;

use scalegrid_balancer::BalancerError;
use scalegrid_core::ConfigError;
use scalegrid_registry::RegistryError;

#[derive(Debug, Error)]
pub enum ScalegridError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Balancer(#[from] BalancerError),
}

pub type ScalegridResult<T> = Result<T, ScalegridError>;
