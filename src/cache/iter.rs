//! Weakly consistent iteration over live entries.
//!
//! The iterator walks stripes from last to first and, within each stripe,
//! buckets from the highest index to the lowest. One bucket's live pairs
//! are copied out under the stripe's shared read lock and yielded without
//! any lock held, so iteration never blocks writers and never observes a
//! torn entry. Entries inserted after iteration starts may be missed;
//! entries removed after being buffered may still be yielded.

use std::hash::Hash;
use std::sync::Arc;

use crate::cache::Cache;

/// Weakly consistent iterator returned by [`Cache::iter`].
pub struct Iter<'a, K, V> {
    cache: &'a Cache<K, V>,
    /// One past the current stripe; stripes are visited in reverse.
    stripe: usize,
    /// Buckets left to visit in the current stripe, visited in reverse.
    bucket: usize,
    buffer: Vec<(Arc<K>, Arc<V>)>,
}

impl<'a, K: Eq + Hash, V> Iter<'a, K, V> {
    pub(crate) fn new(cache: &'a Cache<K, V>) -> Self {
        Self {
            cache,
            stripe: cache.stripes().len(),
            bucket: 0,
            buffer: Vec::new(),
        }
    }

    /// Refills the buffer from the next non-empty bucket.
    fn refill(&mut self) -> bool {
        loop {
            if self.bucket == 0 {
                if self.stripe == 0 {
                    return false;
                }
                self.stripe -= 1;
                self.bucket = self.cache.stripes()[self.stripe].table_len();
                continue;
            }
            self.bucket -= 1;
            let now = self.cache.settings().ticker.read();
            let pairs = self.cache.stripes()[self.stripe].bucket_snapshot(self.bucket, now);
            if !pairs.is_empty() {
                self.buffer = pairs;
                return true;
            }
        }
    }
}

impl<K: Eq + Hash, V> Iterator for Iter<'_, K, V> {
    type Item = (Arc<K>, Arc<V>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pair) = self.buffer.pop() {
                return Some(pair);
            }
            if !self.refill() {
                return None;
            }
        }
    }
}
