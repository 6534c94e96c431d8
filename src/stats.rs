//! Hit/miss/load/eviction accounting.
//!
//! Each stripe owns a [`StatsCounter`] and the cache owns one more for
//! facade-level operations; [`CacheStats`] snapshots are summed across all
//! of them. Counters are wait-free atomics updated with relaxed ordering —
//! they are observational and never affect correctness.

use std::sync::atomic::{AtomicU64, Ordering};

/// Wait-free counter set recorded by cache operations.
#[derive(Debug, Default)]
pub struct StatsCounter {
    hits: AtomicU64,
    misses: AtomicU64,
    load_successes: AtomicU64,
    load_failures: AtomicU64,
    total_load_time: AtomicU64,
    evictions: AtomicU64,
}

impl StatsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hits(&self, count: u64) {
        self.hits.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_misses(&self, count: u64) {
        self.misses.fetch_add(count, Ordering::Relaxed);
    }

    /// Records one successful load that took `load_time` nanoseconds.
    pub fn record_load_success(&self, load_time: u64) {
        self.load_successes.fetch_add(1, Ordering::Relaxed);
        self.total_load_time.fetch_add(load_time, Ordering::Relaxed);
    }

    /// Records one failed load that took `load_time` nanoseconds.
    pub fn record_load_failure(&self, load_time: u64) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
        self.total_load_time.fetch_add(load_time, Ordering::Relaxed);
    }

    /// Records one entry evicted for size or expiration reasons.
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            load_successes: self.load_successes.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            total_load_time: self.total_load_time.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of cache statistics.
///
/// Snapshots taken while the cache is under load are internally consistent
/// per counter but not across counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub load_successes: u64,
    pub load_failures: u64,
    /// Total nanoseconds spent in the loader, success or failure.
    pub total_load_time: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Number of lookups, hit or miss.
    pub fn request_count(&self) -> u64 {
        self.hits.saturating_add(self.misses)
    }

    /// Fraction of lookups that were hits; 1.0 when no lookups happened.
    pub fn hit_rate(&self) -> f64 {
        let requests = self.request_count();
        if requests == 0 {
            1.0
        } else {
            self.hits as f64 / requests as f64
        }
    }

    /// Fraction of lookups that were misses; 0.0 when no lookups happened.
    pub fn miss_rate(&self) -> f64 {
        let requests = self.request_count();
        if requests == 0 {
            0.0
        } else {
            self.misses as f64 / requests as f64
        }
    }

    /// Number of loader invocations, success or failure.
    pub fn load_count(&self) -> u64 {
        self.load_successes.saturating_add(self.load_failures)
    }

    /// Mean nanoseconds per loader invocation; 0.0 when nothing loaded.
    pub fn average_load_penalty(&self) -> f64 {
        let loads = self.load_count();
        if loads == 0 {
            0.0
        } else {
            self.total_load_time as f64 / loads as f64
        }
    }

    /// Componentwise saturating sum of two snapshots.
    pub fn plus(&self, other: &CacheStats) -> CacheStats {
        CacheStats {
            hits: self.hits.saturating_add(other.hits),
            misses: self.misses.saturating_add(other.misses),
            load_successes: self.load_successes.saturating_add(other.load_successes),
            load_failures: self.load_failures.saturating_add(other.load_failures),
            total_load_time: self.total_load_time.saturating_add(other.total_load_time),
            evictions: self.evictions.saturating_add(other.evictions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counter = StatsCounter::new();
        counter.record_hits(3);
        counter.record_misses(2);
        counter.record_load_success(100);
        counter.record_load_failure(50);
        counter.record_eviction();

        let stats = counter.snapshot();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.load_successes, 1);
        assert_eq!(stats.load_failures, 1);
        assert_eq!(stats.total_load_time, 150);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn derived_rates() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            load_successes: 2,
            load_failures: 0,
            total_load_time: 200,
            evictions: 0,
        };
        assert_eq!(stats.request_count(), 4);
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert!((stats.miss_rate() - 0.25).abs() < f64::EPSILON);
        assert!((stats.average_load_penalty() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_snapshot_rates_are_defined() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 1.0);
        assert_eq!(stats.miss_rate(), 0.0);
        assert_eq!(stats.average_load_penalty(), 0.0);
    }

    #[test]
    fn plus_saturates() {
        let a = CacheStats {
            hits: u64::MAX,
            ..CacheStats::default()
        };
        let b = CacheStats {
            hits: 1,
            ..CacheStats::default()
        };
        assert_eq!(a.plus(&b).hits, u64::MAX);
    }
}
