//! Routing error types.

use thiserror::Error;

/// Result type alias for routing operations.
pub type BalancerResult<T> = Result<T, BalancerError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BalancerError {
    /// Nothing in the service can take traffic right now. Callers should
    /// back off and retry or report a capacity error upstream.
    #[error("no healthy instance available for service {service}")]
    NoHealthyInstance { service: String },
}
