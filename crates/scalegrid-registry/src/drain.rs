//! Connection draining for instances on their way out.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::instance::ServiceInstance;

/// Wait until every instance has zero open connections or `timeout` passes.
///
/// Polls every `poll_interval`. Returns the ids of instances that still had
/// connections when the timeout hit (empty on a clean drain). A timeout too
/// large to represent as a deadline waits until the instances drain.
pub async fn wait_for_drain(
    instances: &[Arc<ServiceInstance>],
    timeout: Duration,
    poll_interval: Duration,
) -> Vec<String> {
    let deadline = Instant::now().checked_add(timeout);

    loop {
        let busy: Vec<&Arc<ServiceInstance>> = instances
            .iter()
            .filter(|i| i.current_connections() > 0)
            .collect();

        if busy.is_empty() {
            debug!(count = instances.len(), "instances drained");
            return Vec::new();
        }

        let now = Instant::now();
        let Some(deadline) = deadline else {
            tokio::time::sleep(poll_interval).await;
            continue;
        };
        if now >= deadline {
            let ids: Vec<String> = busy.iter().map(|i| i.id().to_string()).collect();
            warn!(
                instances = ?ids,
                timeout_ms = timeout.as_millis() as u64,
                "drain timed out with open connections"
            );
            return ids;
        }

        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}
