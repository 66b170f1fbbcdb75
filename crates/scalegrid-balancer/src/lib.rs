//! scalegrid-balancer — request routing over a service registry.
//!
//! `route` narrows a service to its healthy instances, picks one with the
//! configured [`LoadBalanceStrategy`](scalegrid_core::LoadBalanceStrategy)
//! and counts the new connection; `release` closes it and feeds the
//! response time into the instance's moving average. Executing the
//! request in between is the caller's job.
//!
//! # Strategies
//!
//! | Strategy               | Selection                                        |
//! |------------------------|--------------------------------------------------|
//! | `round_robin`          | per-service atomic counter mod candidate count   |
//! | `least_connections`    | fewest open connections, first match on ties     |
//! | `weighted_round_robin` | random draw in `[1, Σweight]`, cumulative walk    |
//! | `consistent_hash`      | SHA-256 of the metadata mod candidate count      |
//! | `performance_based`    | lowest load factor, first match on ties          |
//!
//! `consistent_hash` keeps affinity only while the healthy set keeps its
//! size. A bounded-load ring with virtual nodes is the production-grade
//! alternative when membership churns.

pub mod balancer;
pub mod error;
pub mod stats;
pub mod strategy;

pub use balancer::LoadBalancer;
pub use error::{BalancerError, BalancerResult};
pub use stats::{RoutingStats, ServiceRoutingStats};
pub use strategy::{RequestMetadata, hash_metadata};
