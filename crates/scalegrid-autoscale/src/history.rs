//! Bounded in-memory log of scaling actions.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use scalegrid_core::ScalingMetric;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingDirection {
    Up,
    Down,
}

impl fmt::Display for ScalingDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
        })
    }
}

/// One executed scaling action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub service: String,
    pub direction: ScalingDirection,
    pub metric: ScalingMetric,
    /// Aggregated metric value that triggered the action.
    pub metric_value: f64,
    /// Instances the rule asked for.
    pub requested: u32,
    /// Instances actually added or removed.
    pub completed: u32,
    pub success: bool,
    pub error: Option<String>,
    /// Ids of the instances added or removed.
    pub instance_ids: Vec<String>,
    /// Unix epoch seconds.
    pub timestamp: u64,
}

/// Ring buffer of the most recent scaling events.
pub struct ScalingHistory {
    limit: usize,
    events: Mutex<VecDeque<ScalingEvent>>,
}

impl ScalingHistory {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            events: Mutex::new(VecDeque::with_capacity(limit.min(64))),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn push(&self, event: ScalingEvent) {
        let mut events = self.events.lock();
        while events.len() >= self.limit {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// All retained events, oldest first.
    pub fn events(&self) -> Vec<ScalingEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn for_service(&self, service: &str) -> Vec<ScalingEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.service == service)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl Default for ScalingHistory {
    fn default() -> Self {
        Self::new(1000)
    }
}
