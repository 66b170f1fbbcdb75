//! scalegrid-autoscale — rule-driven instance scaling.
//!
//! Rules are plain [`ScalingRule`](scalegrid_core::ScalingRule) values
//! attached to a service. Every pass the [`AutoScaler`] aggregates each
//! rule's metric over the service's healthy instances and acts through a
//! [`Provisioner`].
//!
//! # Scaling Algorithm
//!
//! ```text
//! value = mean(metric over healthy instances)     // none healthy: skip
//! live  = instances not stopping
//!
//! if in cooldown(rule):                           NoChange
//! if value > threshold_up   and live < max:       ScaleUp(min(up_count, max - live))
//! if value < threshold_down and live > min:       ScaleDown(min(down_count, live - min))
//! ```
//!
//! Scale-down drains the least-loaded instances first: they are marked
//! `Stopping`, given up to `drain_timeout` to close connections, then
//! unregistered and deprovisioned. Only a fully successful action starts
//! the rule's cooldown, so a failed one is retried on the next pass.

pub mod error;
pub mod history;
pub mod provisioner;
pub mod rules;
pub mod scaler;

pub use error::{ScaleError, ScaleResult};
pub use history::{ScalingDirection, ScalingEvent, ScalingHistory};
pub use provisioner::Provisioner;
pub use rules::{ScaleDecision, TrackedRule};
pub use scaler::{AutoScaler, ScaleOutcome};
