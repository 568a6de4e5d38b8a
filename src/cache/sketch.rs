//! Approximate access-frequency counting.
//!
//! A count-min sketch with four rows of small saturating counters. Counters
//! are atomics, so recording an access never takes a lock. After `width`
//! recorded accesses every counter is halved, which lets the sketch forget
//! old popularity.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

const DEPTH: usize = 4;
const MAX_COUNT: u8 = 15;
const SEEDS: [u64; DEPTH] = [
    0xc3a5_c85c_97cb_3127,
    0xb492_b66f_be98_f273,
    0x9ae1_6a3b_2f90_404f,
    0xcbf2_9ce4_8422_2325,
];

pub(crate) struct FrequencySketch {
    rows: [Box<[AtomicU8]>; DEPTH],
    mask: u64,
    additions: AtomicU64,
    reset_at: u64,
}

impl FrequencySketch {
    /// Creates a sketch with at least `counters` counters per row.
    pub(crate) fn new(counters: usize) -> Self {
        let width = counters.max(16).next_power_of_two();
        Self {
            rows: std::array::from_fn(|_| (0..width).map(|_| AtomicU8::new(0)).collect()),
            mask: width as u64 - 1,
            additions: AtomicU64::new(0),
            reset_at: width as u64,
        }
    }

    fn index(&self, hash: u64, row: usize) -> usize {
        let mixed = (hash ^ SEEDS[row]).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        ((mixed ^ (mixed >> 32)) & self.mask) as usize
    }

    /// Records one access to the key with this hash.
    pub(crate) fn increment(&self, hash: u64) {
        for row in 0..DEPTH {
            let counter = &self.rows[row][self.index(hash, row)];
            // Err means the counter is saturated.
            let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n < MAX_COUNT).then_some(n + 1)
            });
        }

        if self.additions.fetch_add(1, Ordering::Relaxed) + 1 == self.reset_at {
            self.additions.store(0, Ordering::Relaxed);
            self.age();
        }
    }

    /// Estimated access count for the key with this hash, saturating at 15.
    pub(crate) fn estimate(&self, hash: u64) -> u8 {
        (0..DEPTH)
            .map(|row| self.rows[row][self.index(hash, row)].load(Ordering::Relaxed))
            .min()
            .unwrap_or(0)
    }

    fn age(&self) {
        for row in &self.rows {
            for counter in row.iter() {
                let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n >> 1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accesses() {
        let sketch = FrequencySketch::new(1024);
        for _ in 0..3 {
            sketch.increment(42);
        }
        assert!(sketch.estimate(42) >= 3);
    }

    #[test]
    fn saturates() {
        let sketch = FrequencySketch::new(1024);
        for _ in 0..100 {
            sketch.increment(7);
        }
        assert_eq!(sketch.estimate(7), MAX_COUNT);
    }

    #[test]
    fn ages_after_width_additions() {
        let sketch = FrequencySketch::new(16);
        for _ in 0..8 {
            sketch.increment(1);
        }
        let before = sketch.estimate(1);
        // Push the addition count over the reset point without touching key 1.
        for other in 0..8u64 {
            sketch.increment(1_000 + other);
        }
        assert!(sketch.estimate(1) < before);
    }
}
