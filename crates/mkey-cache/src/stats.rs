//! Cache statistics
//!
//! Two views exist: lock-protected per-entry counters (`cur`, `miss`,
//! `pending`) snapshotted into [`EntryStats`], and relaxed lifetime
//! counters kept cache-wide. The lifetime counters are heuristics for
//! operators; readers tolerate slightly stale values.

use std::sync::atomic::AtomicU64;

use serde::{Deserialize, Serialize};

/// Relaxed cache-wide lifetime counters.
#[derive(Debug, Default)]
pub(crate) struct LifetimeCounters {
    pub created: AtomicU64,
    pub create_failures: AtomicU64,
    pub destroyed: AtomicU64,
    pub checkouts: AtomicU64,
    pub misses: AtomicU64,
    pub releases: AtomicU64,
}

/// Point-in-time view of one size-class entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStats {
    /// Size class of the entry.
    pub order: u8,
    /// Configured low-water mark.
    pub limit: u32,
    /// Keys owned by the entry (idle plus checked out).
    pub cur: u32,
    /// Keys currently idle on the free list.
    pub idle: u32,
    /// Creations in flight.
    pub pending: u32,
    /// Checkout misses since the last reset.
    pub miss: u64,
}

/// Point-in-time view of the whole cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Per-entry snapshots, smallest order first.
    pub entries: Vec<EntryStats>,
    /// Keys created by the cache, through the fill and resize paths.
    pub created: u64,
    /// Creation attempts that failed.
    pub create_failures: u64,
    /// Keys destroyed (trim, teardown, or release after stop).
    pub destroyed: u64,
    /// Checkout attempts.
    pub checkouts: u64,
    /// Checkout attempts that missed.
    pub misses: u64,
    /// Keys released back to the cache.
    pub releases: u64,
    /// Whether fills are currently suppressed by a failure cooldown.
    pub fill_delay: bool,
    /// Whether hysteresis is being bypassed for trims.
    pub rel_imm: bool,
    /// Configured trim quiet window (-1 = never trim).
    pub rel_timeout_secs: i64,
    /// Whether the cache has been stopped.
    pub stopped: bool,
}

impl CacheStats {
    /// Fraction of checkouts served from the pool.
    pub fn hit_rate(&self) -> f64 {
        if self.checkouts == 0 {
            return 0.0;
        }
        (self.checkouts - self.misses) as f64 / self.checkouts as f64
    }

    /// Total keys owned across all entries.
    pub fn total_cur(&self) -> u32 {
        self.entries.iter().map(|entry| entry.cur).sum()
    }

    /// Total creations still in flight across all entries.
    pub fn total_pending(&self) -> u32 {
        self.entries.iter().map(|entry| entry.pending).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CacheStats {
        CacheStats {
            entries: vec![
                EntryStats {
                    order: 2,
                    limit: 8,
                    cur: 16,
                    idle: 12,
                    pending: 0,
                    miss: 1,
                },
                EntryStats {
                    order: 3,
                    limit: 4,
                    cur: 6,
                    idle: 6,
                    pending: 2,
                    miss: 0,
                },
            ],
            created: 22,
            create_failures: 1,
            destroyed: 0,
            checkouts: 10,
            misses: 1,
            releases: 6,
            fill_delay: false,
            rel_imm: false,
            rel_timeout_secs: 300,
            stopped: false,
        }
    }

    #[test]
    fn hit_rate_handles_zero_checkouts() {
        let mut stats = sample();
        stats.checkouts = 0;
        stats.misses = 0;
        assert!((stats.hit_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn aggregates_sum_entries() {
        let stats = sample();
        assert_eq!(stats.total_cur(), 22);
        assert_eq!(stats.total_pending(), 2);
        assert!((stats.hit_rate() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn lifetime_counters_accumulate() {
        use std::sync::atomic::Ordering;

        let counters = LifetimeCounters::default();
        counters.created.fetch_add(2, Ordering::Relaxed);
        counters.misses.fetch_add(1, Ordering::Relaxed);
        assert_eq!(counters.created.load(Ordering::Relaxed), 2);
        assert_eq!(counters.misses.load(Ordering::Relaxed), 1);
        assert_eq!(counters.destroyed.load(Ordering::Relaxed), 0);
    }
}
