//! Registry error types.

use thiserror::Error;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("instance {id} already registered for service {service}")]
    DuplicateInstance { service: String, id: String },

    #[error("instance {id} not found in service {service}")]
    InstanceNotFound { service: String, id: String },

    #[error("instance address must not be empty")]
    EmptyAddress,
}
