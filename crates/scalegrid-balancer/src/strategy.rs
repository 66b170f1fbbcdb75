//! Selection strategies over a slice of candidate instances.
//!
//! Every function returns an index into `candidates`, or `None` when it
//! cannot choose (empty slice, zero total weight).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use sha2::{Digest, Sha256};

use scalegrid_registry::ServiceInstance;

/// Caller-supplied request attributes used for hash-based affinity.
///
/// A `BTreeMap` so the serialized form, and therefore the hash, does not
/// depend on insertion order.
pub type RequestMetadata = BTreeMap<String, serde_json::Value>;

/// Lock-free round-robin cursor for one service.
#[derive(Debug, Default)]
pub struct RoundRobinCounter {
    counter: AtomicUsize,
}

impl RoundRobinCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next index modulo `count`, or `None` if `count` is zero.
    pub fn next(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let ticket = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(ticket % count)
    }

    pub fn current(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }
}

/// Fewest open connections; the earliest candidate wins ties.
pub fn least_connections(candidates: &[Arc<ServiceInstance>]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .min_by_key(|(_, inst)| inst.current_connections())
        .map(|(idx, _)| idx)
}

/// Lowest load factor; the earliest candidate wins ties.
pub fn lowest_load(candidates: &[Arc<ServiceInstance>]) -> Option<usize> {
    candidates
        .iter()
        .map(|inst| inst.load_factor())
        .enumerate()
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(idx, _)| idx)
}

/// Draw in `[1, Σweight]` and return the first candidate whose cumulative
/// weight reaches the draw.
pub fn weighted<R: Rng>(candidates: &[Arc<ServiceInstance>], rng: &mut R) -> Option<usize> {
    let total: u64 = candidates.iter().map(|inst| u64::from(inst.weight())).sum();
    if total == 0 {
        return None;
    }

    let draw = rng.random_range(1..=total);
    let mut cumulative = 0u64;
    for (idx, inst) in candidates.iter().enumerate() {
        cumulative += u64::from(inst.weight());
        if cumulative >= draw {
            return Some(idx);
        }
    }
    None
}

/// Stable 64-bit hash of request metadata.
pub fn hash_metadata(metadata: &RequestMetadata) -> u64 {
    let encoded = serde_json::to_vec(metadata).unwrap_or_default();
    let digest = Sha256::digest(&encoded);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Metadata hash modulo the candidate count.
pub fn by_hash(candidates: &[Arc<ServiceInstance>], metadata: &RequestMetadata) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    Some((hash_metadata(metadata) % candidates.len() as u64) as usize)
}
