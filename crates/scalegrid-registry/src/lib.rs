//! scalegrid-registry — the single owner of service instance state.
//!
//! The registry maps service names to an ordered pool of
//! [`ServiceInstance`] records. Every other component (health checker,
//! load balancer, autoscaler) receives a cloned [`ServiceRegistry`] handle
//! and works on `Arc<ServiceInstance>` references handed out by it.
//!
//! # Concurrency
//!
//! ```text
//! ServiceRegistry (Clone, Arc inside)
//!   └── RwLock<service → ServicePool>
//!         └── RwLock<Vec<Arc<ServiceInstance>>>   (per service)
//!               ├── AtomicU32 current_connections
//!               └── Mutex<InstanceVitals>         (per instance)
//! ```
//!
//! Unrelated services never contend on the same pool lock, and routing
//! only takes read locks plus one atomic increment.

pub mod drain;
pub mod error;
pub mod instance;
pub mod registry;

pub use drain::wait_for_drain;
pub use error::{RegistryError, RegistryResult};
pub use instance::{
    InstanceId, InstanceSnapshot, InstanceSpec, InstanceStatus, InstanceVitals, ServiceInstance,
};
pub use registry::ServiceRegistry;
