//! Bounded in-memory response cache.
//!
//! [`BoundedCache`] maps fingerprint bytes to serialized response bytes under
//! a fixed budget of total value bytes ("cost").
//!
//! - Lookups hit a sharded [`DashMap`] and a lock-free frequency sketch, so
//!   they never wait on writers' bookkeeping.
//! - Inserts take a single policy lock that owns the cost accounting. When a
//!   new entry does not fit, a few resident keys are sampled at random and
//!   the least frequently accessed one is evicted; if the newcomer is less
//!   popular than that victim it is turned away instead.
//!
//! Values are reference-counted [`Bytes`]: a value returned by
//! [`get`](BoundedCache::get) stays valid even if the entry is evicted a
//! moment later.

use std::collections::HashMap;
use std::hash::{BuildHasher, RandomState};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tracing::trace;

mod metrics;
mod sketch;

pub use metrics::MetricsSnapshot;

use metrics::Metrics;
use sketch::FrequencySketch;

/// Number of resident keys examined when choosing an eviction victim.
const EVICTION_SAMPLES: usize = 5;

/// Frequency counters allocated per expected item.
const COUNTERS_PER_ITEM: usize = 10;

/// Errors raised when constructing a cache.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("{field} must be greater than zero")]
    InvalidSize { field: &'static str },
}

/// Sizing and instrumentation for a [`BoundedCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Expected number of resident entries. Sizes the frequency sketch; it is
    /// not a cap on the entry count.
    pub expected_items: usize,
    /// Upper bound on the summed byte length of all cached values.
    pub max_cost: u64,
    /// Whether to keep hit/miss/eviction counters.
    pub metrics: bool,
}

struct Slot {
    cost: u64,
    hash: u64,
    index: usize,
}

/// Cost accounting for resident keys. `keys` allows uniform random sampling.
#[derive(Default)]
struct Policy {
    slots: HashMap<Bytes, Slot>,
    keys: Vec<Bytes>,
    used: u64,
}

impl Policy {
    fn insert(&mut self, key: Bytes, cost: u64, hash: u64) {
        let index = self.keys.len();
        self.keys.push(key.clone());
        self.slots.insert(key, Slot { cost, hash, index });
        self.used += cost;
    }

    fn remove(&mut self, key: &[u8]) -> Option<u64> {
        let slot = self.slots.remove(key)?;
        self.keys.swap_remove(slot.index);
        if let Some(moved) = self.keys.get(slot.index) {
            if let Some(moved_slot) = self.slots.get_mut(moved) {
                moved_slot.index = slot.index;
            }
        }
        self.used -= slot.cost;
        Some(slot.cost)
    }

    /// Sets a resident key's cost, returning the previous cost, or `None`
    /// if the key is not resident.
    fn resize(&mut self, key: &[u8], cost: u64) -> Option<u64> {
        let slot = self.slots.get_mut(key)?;
        let previous = std::mem::replace(&mut slot.cost, cost);
        self.used = self.used - previous + cost;
        Some(previous)
    }

    /// Picks the least frequently used key among a random sample, skipping
    /// `protected`.
    fn victim(
        &self,
        rng: &mut impl Rng,
        sketch: &FrequencySketch,
        protected: Option<&[u8]>,
    ) -> Option<(Bytes, u8)> {
        if self.keys.is_empty() {
            return None;
        }
        let mut best: Option<(&Bytes, u8)> = None;
        for _ in 0..EVICTION_SAMPLES.min(self.keys.len()) {
            let key = &self.keys[rng.gen_range(0..self.keys.len())];
            if protected.is_some_and(|p| p == &key[..]) {
                continue;
            }
            let frequency = self.slots.get(key).map_or(0, |s| sketch.estimate(s.hash));
            if best.is_none_or(|(_, f)| frequency < f) {
                best = Some((key, frequency));
            }
        }
        if best.is_none() {
            // Every sample hit the protected key; fall back to a linear scan.
            best = self
                .keys
                .iter()
                .find(|k| protected.is_none_or(|p| p != &k[..]))
                .map(|k| (k, self.slots.get(k).map_or(0, |s| sketch.estimate(s.hash))));
        }
        best.map(|(key, frequency)| (key.clone(), frequency))
    }
}

/// A concurrent, cost-bounded map from fingerprint bytes to response bytes.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use cacheproxy::cache::{BoundedCache, CacheConfig};
///
/// let cache = BoundedCache::new(CacheConfig {
///     expected_items: 100,
///     max_cost: 1_000,
///     metrics: true,
/// })
/// .unwrap();
///
/// assert!(cache.set(Bytes::from_static(b"/a"), Bytes::from_static(b"response")));
/// assert_eq!(cache.get(b"/a").as_deref(), Some(&b"response"[..]));
/// assert_eq!(cache.metrics().hits, 1);
/// ```
pub struct BoundedCache {
    store: DashMap<Bytes, Bytes>,
    policy: Mutex<Policy>,
    sketch: FrequencySketch,
    hasher: RandomState,
    metrics: Option<Metrics>,
    max_cost: u64,
}

impl BoundedCache {
    /// Creates an empty cache.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidSize`] if `expected_items` or `max_cost`
    /// is zero.
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        if config.expected_items == 0 {
            return Err(CacheError::InvalidSize {
                field: "expected_items",
            });
        }
        if config.max_cost == 0 {
            return Err(CacheError::InvalidSize { field: "max_cost" });
        }

        Ok(Self {
            store: DashMap::with_capacity(config.expected_items),
            policy: Mutex::new(Policy::default()),
            sketch: FrequencySketch::new(config.expected_items.saturating_mul(COUNTERS_PER_ITEM)),
            hasher: RandomState::new(),
            metrics: config.metrics.then(Metrics::default),
            max_cost: config.max_cost,
        })
    }

    /// Looks up a value.
    ///
    /// Every lookup, hit or miss, counts as an access to `key` for the
    /// eviction and admission policy. Absence and an eviction racing this
    /// read both surface as `None`.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.sketch.increment(self.hasher.hash_one(key));
        let value = self.store.get(key).map(|entry| entry.value().clone());
        if let Some(metrics) = &self.metrics {
            match value {
                Some(_) => metrics.hit(),
                None => metrics.miss(),
            }
        }
        value
    }

    /// Offers a value for insertion; its cost is `value.len()`.
    ///
    /// Returns `false` when the admission policy turns the entry away: it is
    /// larger than the whole budget, or it is accessed less often than the
    /// entry it would have to displace. Rejection is not an error. Replacing
    /// the value of a resident key is always accepted.
    pub fn set(&self, key: Bytes, value: Bytes) -> bool {
        let cost = value.len() as u64;
        if cost > self.max_cost {
            trace!(cost, max_cost = self.max_cost, "entry larger than cache budget");
            self.record(Metrics::rejected);
            return false;
        }

        let hash = self.hasher.hash_one(&key[..]);
        let mut policy = self.policy.lock();
        let mut rng = rand::thread_rng();

        if policy.resize(&key, cost).is_some() {
            while policy.used > self.max_cost {
                let Some((victim, _)) = policy.victim(&mut rng, &self.sketch, Some(&key[..])) else {
                    break;
                };
                self.evict(&mut policy, &victim);
            }
            self.store.insert(key, value);
            self.record(|m| m.updated(cost));
            return true;
        }

        let frequency = self.sketch.estimate(hash);
        while policy.used + cost > self.max_cost {
            let Some((victim, victim_frequency)) = policy.victim(&mut rng, &self.sketch, None)
            else {
                break;
            };
            if frequency < victim_frequency {
                trace!(frequency, victim_frequency, "entry refused by admission policy");
                self.record(Metrics::rejected);
                return false;
            }
            self.evict(&mut policy, &victim);
        }

        policy.insert(key.clone(), cost, hash);
        self.store.insert(key, value);
        self.record(|m| m.added(cost));
        true
    }

    /// Returns the current counters, or an all-zero snapshot when metrics
    /// were not enabled.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics
            .as_ref()
            .map(Metrics::snapshot)
            .unwrap_or_default()
    }

    /// Returns `true` if counters are being kept.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }

    /// Summed cost of all resident entries.
    pub fn cost(&self) -> u64 {
        self.policy.lock().used
    }

    pub fn max_cost(&self) -> u64 {
        self.max_cost
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn evict(&self, policy: &mut Policy, key: &[u8]) {
        if let Some(cost) = policy.remove(key) {
            self.store.remove(key);
            trace!(cost, "evicted cache entry");
            self.record(|m| m.evicted(cost));
        }
    }

    fn record(&self, update: impl FnOnce(&Metrics)) {
        if let Some(metrics) = &self.metrics {
            update(metrics);
        }
    }
}
