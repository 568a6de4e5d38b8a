//! Cache counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live cumulative counters, updated lock-free by cache operations.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    hits: AtomicU64,
    misses: AtomicU64,
    keys_added: AtomicU64,
    keys_updated: AtomicU64,
    keys_evicted: AtomicU64,
    cost_added: AtomicU64,
    cost_evicted: AtomicU64,
    sets_rejected: AtomicU64,
}

impl Metrics {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn added(&self, cost: u64) {
        self.keys_added.fetch_add(1, Ordering::Relaxed);
        self.cost_added.fetch_add(cost, Ordering::Relaxed);
    }

    pub(crate) fn updated(&self, cost: u64) {
        self.keys_updated.fetch_add(1, Ordering::Relaxed);
        self.cost_added.fetch_add(cost, Ordering::Relaxed);
    }

    pub(crate) fn evicted(&self, cost: u64) {
        self.keys_evicted.fetch_add(1, Ordering::Relaxed);
        self.cost_evicted.fetch_add(cost, Ordering::Relaxed);
    }

    pub(crate) fn rejected(&self) {
        self.sets_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            keys_added: self.keys_added.load(Ordering::Relaxed),
            keys_updated: self.keys_updated.load(Ordering::Relaxed),
            keys_evicted: self.keys_evicted.load(Ordering::Relaxed),
            cost_added: self.cost_added.load(Ordering::Relaxed),
            cost_evicted: self.cost_evicted.load(Ordering::Relaxed),
            sets_rejected: self.sets_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the cache counters.
///
/// Counters are read individually, so a snapshot taken under load is not
/// guaranteed to be mutually consistent to the single operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub keys_added: u64,
    pub keys_updated: u64,
    pub keys_evicted: u64,
    pub cost_added: u64,
    pub cost_evicted: u64,
    pub sets_rejected: u64,
}

impl MetricsSnapshot {
    /// Fraction of lookups that were hits, or `0.0` before any lookup.
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hit: {} miss: {} keys-added: {} keys-updated: {} keys-evicted: {} \
             cost-added: {} cost-evicted: {} sets-rejected: {} hit-ratio: {:.2}",
            self.hits,
            self.misses,
            self.keys_added,
            self.keys_updated,
            self.keys_evicted,
            self.cost_added,
            self.cost_evicted,
            self.sets_rejected,
            self.hit_ratio()
        )
    }
}
