//! Cache facade: hashing, striping, and fan-out operations.
//!
//! A key is hashed once with the crate's spreader; the top bits select a
//! stripe and the low bits index the stripe's bucket table. Operations on a
//! single key touch exactly one stripe; aggregate operations (`size`,
//! `is_empty`, `contains_value`, `invalidate_all`) fan out, never holding
//! more than one stripe lock at a time.
//!
//! ```text
//!           hash(key) ── spread ──► 32-bit h
//!                                     │
//!               ┌─────────────────────┴─────────────────────┐
//!               ▼                                           ▼
//!        h >> stripe_shift                           h & (table_len-1)
//!        selects the stripe                          selects the bucket
//! ```

pub(crate) mod entry;
mod iter;
mod stripe;

pub use iter::Iter;

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use rustc_hash::FxHasher;

use crate::cache::entry::{Entry, EntryShape};
use crate::cache::stripe::Stripe;
use crate::error::LoadError;
use crate::notify::NotificationBus;
use crate::stats::{CacheStats, StatsCounter};
use crate::time::Ticker;
use crate::traits::{CacheLoader, Weigher};

/// Passes over every stripe when scanning for a value; a stable
/// modification-count sum across a pass confirms a negative. More passes
/// shrink (but cannot eliminate) the chance of a false negative under
/// adversarial interleavings.
const CONTAINS_VALUE_RETRIES: usize = 3;

// ---------------------------------------------------------------------------
// Shared configuration
// ---------------------------------------------------------------------------

/// Immutable configuration and shared collaborators, one per cache.
pub(crate) struct Settings<K, V> {
    pub(crate) ticker: Arc<dyn Ticker>,
    pub(crate) weigher: Arc<Weigher<K, V>>,
    /// Nanoseconds; zero disables the policy.
    pub(crate) expire_after_access: u64,
    pub(crate) expire_after_write: u64,
    pub(crate) refresh_interval: u64,
    /// Entry shape fixed at construction; all entries share it.
    pub(crate) shape: EntryShape,
    pub(crate) weak_values: bool,
    pub(crate) max_weight: Option<u64>,
    pub(crate) bus: NotificationBus<K, V>,
    pub(crate) global_stats: StatsCounter,
    pub(crate) loader: Option<Arc<dyn CacheLoader<K, V>>>,
}

impl<K, V> Settings<K, V> {
    pub(crate) fn expires_after_access(&self) -> bool {
        self.expire_after_access > 0
    }

    pub(crate) fn expires_after_write(&self) -> bool {
        self.expire_after_write > 0
    }

    pub(crate) fn expires(&self) -> bool {
        self.expires_after_access() || self.expires_after_write()
    }

    pub(crate) fn refreshes(&self) -> bool {
        self.refresh_interval > 0
    }

    pub(crate) fn weak_keys(&self) -> bool {
        self.shape.weak_keys
    }

    pub(crate) fn uses_access_queue(&self) -> bool {
        self.shape.access_tracked
    }

    pub(crate) fn uses_write_queue(&self) -> bool {
        self.expires_after_write()
    }

    pub(crate) fn records_access_time(&self) -> bool {
        self.expires_after_access()
    }

    pub(crate) fn records_write_time(&self) -> bool {
        self.shape.write_tracked
    }

    pub(crate) fn is_expired(&self, entry: &Entry<K, V>, now: u64) -> bool {
        (self.expires_after_access()
            && now.saturating_sub(entry.access_time()) >= self.expire_after_access)
            || (self.expires_after_write()
                && now.saturating_sub(entry.write_time()) >= self.expire_after_write)
    }
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Bit-mixing spreader applied once per operation over the key's hash.
///
/// Regularizes both stripe and bucket selection (variant of a single-word
/// Wang/Jenkins mix).
pub(crate) fn spread(mut h: u32) -> u32 {
    h = h.wrapping_add((h << 15) ^ 0xffff_cd7d);
    h ^= h >> 10;
    h = h.wrapping_add(h << 3);
    h ^= h >> 6;
    h = h.wrapping_add((h << 2).wrapping_add(h << 14));
    h ^ (h >> 16)
}

fn hash_key<K: Hash>(key: &K) -> u32 {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    let wide = hasher.finish();
    spread((wide ^ (wide >> 32)) as u32)
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Concurrent striped cache.
///
/// Thread-safe for arbitrary concurrent callers; share it via [`Arc`] or
/// borrow it across scoped threads. Values are returned as `Arc<V>` so a
/// hit never clones the value.
///
/// # Example
///
/// ```
/// use stripecache::builder::CacheBuilder;
///
/// let cache = CacheBuilder::<u64, String>::new().build().unwrap();
/// cache.put(1, "one".to_string());
/// assert_eq!(cache.get_if_present(&1).as_deref(), Some(&"one".to_string()));
/// ```
pub struct Cache<K, V> {
    settings: Arc<Settings<K, V>>,
    stripes: Box<[Stripe<K, V>]>,
    /// `hash >> stripe_shift` selects the stripe; 32 means "one stripe".
    stripe_shift: u32,
}

impl<K, V> std::fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("stripes", &self.stripes.len())
            .finish()
    }
}

impl<K: Eq + Hash, V> Cache<K, V> {
    pub(crate) fn assemble(
        settings: Arc<Settings<K, V>>,
        stripe_weights: Vec<Option<u64>>,
        buckets_per_stripe: usize,
        stripe_shift: u32,
    ) -> Self {
        let stripes = stripe_weights
            .into_iter()
            .map(|weight| Stripe::new(Arc::clone(&settings), weight, buckets_per_stripe))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            settings,
            stripes,
            stripe_shift,
        }
    }

    fn stripe_for(&self, hash: u32) -> &Stripe<K, V> {
        let index = if self.stripe_shift >= 32 {
            0
        } else {
            (hash >> self.stripe_shift) as usize & (self.stripes.len() - 1)
        };
        &self.stripes[index]
    }

    pub(crate) fn stripes(&self) -> &[Stripe<K, V>] {
        &self.stripes
    }

    pub(crate) fn settings(&self) -> &Settings<K, V> {
        &self.settings
    }

    // -- lookups -----------------------------------------------------------

    /// Returns the cached value, counting a hit or miss.
    pub fn get_if_present(&self, key: &K) -> Option<Arc<V>> {
        let hash = hash_key(key);
        let value = self.stripe_for(hash).get(key, hash);
        match value {
            Some(_) => self.settings.global_stats.record_hits(1),
            None => self.settings.global_stats.record_misses(1),
        }
        value
    }

    /// Returns the cached value or loads it with `loader`, coordinating
    /// concurrent misses so the loader runs at most once per key.
    pub fn get_with(&self, key: K, loader: &dyn CacheLoader<K, V>) -> Result<Arc<V>, LoadError> {
        let key = Arc::new(key);
        let hash = hash_key(&key);
        self.stripe_for(hash).get_or_load(&key, hash, loader)
    }

    /// Liveness-checked membership test; does not touch recency.
    pub fn contains_key(&self, key: &K) -> bool {
        let hash = hash_key(key);
        self.stripe_for(hash).contains_key(key, hash)
    }

    /// Scans for a live value equal to `value`.
    ///
    /// Up to three passes over every stripe; a pass whose modification
    /// counts were stable confirms the negative. A false negative is
    /// theoretically possible under adversarial interleavings.
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        let now = self.settings.ticker.read();
        let mut last = u64::MAX;
        for _ in 0..CONTAINS_VALUE_RETRIES {
            let mut sum = 0u64;
            for stripe in self.stripes.iter() {
                if stripe.scan_for_value(value, now) {
                    return true;
                }
                sum = sum.wrapping_add(stripe.mod_count());
            }
            if sum == last {
                break;
            }
            last = sum;
        }
        false
    }

    /// Looks up each key, returning the present mappings and counting one
    /// hit or miss per distinct key.
    pub fn get_all_present<I>(&self, keys: I) -> HashMap<Arc<K>, Arc<V>>
    where
        I: IntoIterator<Item = K>,
    {
        let mut result = HashMap::new();
        let mut hits = 0u64;
        let mut misses = 0u64;
        for key in keys {
            let key = Arc::new(key);
            if result.contains_key(&key) {
                continue;
            }
            let hash = hash_key(&key);
            match self.stripe_for(hash).get(&key, hash) {
                Some(value) => {
                    hits += 1;
                    result.insert(key, value);
                },
                None => misses += 1,
            }
        }
        self.settings.global_stats.record_hits(hits);
        self.settings.global_stats.record_misses(misses);
        result
    }

    // -- writes ------------------------------------------------------------

    /// Associates `value` with `key`, returning the previous value.
    pub fn put(&self, key: K, value: V) -> Option<Arc<V>> {
        self.put_shared(Arc::new(key), Arc::new(value))
    }

    /// `put` for callers that retain the `Arc`s — required for weakly held
    /// keys or values to outlive the call.
    pub fn put_shared(&self, key: Arc<K>, value: Arc<V>) -> Option<Arc<V>> {
        let hash = hash_key(&key);
        self.stripe_for(hash).put(key, hash, value, false)
    }

    /// Associates `value` with `key` only when no live value exists;
    /// returns the existing value otherwise.
    pub fn put_if_absent(&self, key: K, value: V) -> Option<Arc<V>> {
        self.put_if_absent_shared(Arc::new(key), Arc::new(value))
    }

    pub fn put_if_absent_shared(&self, key: Arc<K>, value: Arc<V>) -> Option<Arc<V>> {
        let hash = hash_key(&key);
        self.stripe_for(hash).put(key, hash, value, true)
    }

    pub fn put_all<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in entries {
            self.put(key, value);
        }
    }

    /// Replaces the value only when a live value exists.
    pub fn replace(&self, key: &K, value: V) -> Option<Arc<V>> {
        let hash = hash_key(key);
        self.stripe_for(hash).replace(key, hash, Arc::new(value))
    }

    /// Replaces the value only when the current value equals `expected`.
    pub fn replace_expected(&self, key: &K, expected: &V, value: V) -> bool
    where
        V: PartialEq,
    {
        let hash = hash_key(key);
        self.stripe_for(hash)
            .replace_expected(key, hash, expected, Arc::new(value))
    }

    /// Removes the mapping, emitting an `Explicit` notification.
    pub fn invalidate(&self, key: &K) -> Option<Arc<V>> {
        let hash = hash_key(key);
        self.stripe_for(hash).remove(key, hash)
    }

    /// Removes the mapping only when the current value equals `expected`.
    pub fn invalidate_expected(&self, key: &K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let hash = hash_key(key);
        self.stripe_for(hash).remove_expected(key, hash, expected)
    }

    /// Removes each of `keys`.
    pub fn invalidate_many<'a, I>(&self, keys: I)
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        for key in keys {
            self.invalidate(key);
        }
    }

    /// Removes every entry, emitting `Explicit` notifications for live
    /// entries.
    pub fn invalidate_all(&self) {
        for stripe in self.stripes.iter() {
            stripe.clear();
        }
    }

    // -- aggregates --------------------------------------------------------

    /// Approximate number of live entries, saturating at `usize::MAX`.
    pub fn size(&self) -> usize {
        self.stripes
            .iter()
            .fold(0usize, |sum, stripe| sum.saturating_add(stripe.count()))
    }

    /// Two-pass emptiness check: a nonzero count fails fast, and a second
    /// pass over the modification counts detects racing insertions.
    pub fn is_empty(&self) -> bool {
        let mut sum = 0u64;
        for stripe in self.stripes.iter() {
            if stripe.count() != 0 {
                return false;
            }
            sum = sum.wrapping_add(stripe.mod_count());
        }
        if sum != 0 {
            for stripe in self.stripes.iter() {
                if stripe.count() != 0 {
                    return false;
                }
                sum = sum.wrapping_sub(stripe.mod_count());
            }
            if sum != 0 {
                return false;
            }
        }
        true
    }

    /// Aggregate statistics across the facade counter and every stripe.
    pub fn stats(&self) -> CacheStats {
        let mut total = self.settings.global_stats.snapshot();
        for stripe in self.stripes.iter() {
            total = total.plus(&stripe.stats());
        }
        total
    }

    /// Runs one maintenance round on every stripe: expiration, reclamation,
    /// pending refresh completion, and notification delivery.
    pub fn clean_up(&self) {
        for stripe in self.stripes.iter() {
            stripe.clean_up();
        }
    }

    /// Weakly consistent iterator over live `(key, value)` pairs.
    ///
    /// May miss entries inserted after iteration started and may yield
    /// entries removed afterwards; it never observes a torn entry and
    /// never errors on concurrent modification.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(self)
    }

    /// Weakly consistent snapshot of the live mappings.
    pub fn as_map(&self) -> HashMap<Arc<K>, Arc<V>> {
        self.iter().collect()
    }
}

// ---------------------------------------------------------------------------
// LoadingCache
// ---------------------------------------------------------------------------

/// A [`Cache`] bound to a default loader.
///
/// Built with
/// [`CacheBuilder::build_with_loader`](crate::builder::CacheBuilder::build_with_loader);
/// dereferences to [`Cache`] for all non-loading operations.
pub struct LoadingCache<K, V> {
    inner: Cache<K, V>,
    loader: Arc<dyn CacheLoader<K, V>>,
}

impl<K: Eq + Hash, V> LoadingCache<K, V> {
    pub(crate) fn new(inner: Cache<K, V>, loader: Arc<dyn CacheLoader<K, V>>) -> Self {
        Self { inner, loader }
    }

    /// Returns the cached value, loading it on a miss. Concurrent callers
    /// for the same key share one load.
    pub fn get(&self, key: K) -> Result<Arc<V>, LoadError> {
        self.inner.get_with_shared(Arc::new(key), self.loader.as_ref())
    }

    /// Returns mappings for all of `keys`, using the loader's batch
    /// interface when supported and per-key loads otherwise.
    pub fn get_all<I>(&self, keys: I) -> Result<HashMap<Arc<K>, Arc<V>>, LoadError>
    where
        I: IntoIterator<Item = K>,
    {
        let mut result: HashMap<Arc<K>, Arc<V>> = HashMap::new();
        let mut to_load: Vec<Arc<K>> = Vec::new();
        let mut requested: HashSet<Arc<K>> = HashSet::new();
        let mut hits = 0u64;
        let mut misses = 0u64;

        for key in keys {
            let key = Arc::new(key);
            if !requested.insert(Arc::clone(&key)) {
                continue;
            }
            let hash = hash_key(&key);
            match self.inner.stripe_for(hash).get(&key, hash) {
                Some(value) => {
                    hits += 1;
                    result.insert(key, value);
                },
                None => {
                    misses += 1;
                    to_load.push(key);
                },
            }
        }

        let outcome = if to_load.is_empty() {
            Ok(())
        } else {
            self.load_missing(&mut result, &mut to_load, &mut misses)
        };

        self.inner.settings.global_stats.record_hits(hits);
        self.inner.settings.global_stats.record_misses(misses);
        outcome.map(|()| result)
    }

    fn load_missing(
        &self,
        result: &mut HashMap<Arc<K>, Arc<V>>,
        to_load: &mut Vec<Arc<K>>,
        misses: &mut u64,
    ) -> Result<(), LoadError> {
        let started = self.inner.settings.ticker.read();
        match self.loader.load_all(to_load) {
            Some(Ok(pairs)) => {
                let elapsed = self.inner.settings.ticker.read().saturating_sub(started);
                self.inner.settings.global_stats.record_load_success(elapsed);

                let mut loaded: HashMap<Arc<K>, Arc<V>> = HashMap::new();
                for (key, value) in pairs {
                    let value = Arc::new(value);
                    self.inner.put_shared(Arc::clone(&key), Arc::clone(&value));
                    loaded.insert(key, value);
                }
                for key in to_load.drain(..) {
                    match loaded.get(&key) {
                        Some(value) => {
                            result.insert(key, Arc::clone(value));
                        },
                        None => {
                            return Err(LoadError::invalid(
                                "batch loader returned no value for a requested key",
                            ));
                        },
                    }
                }
                Ok(())
            },
            Some(Err(source)) => {
                let elapsed = self.inner.settings.ticker.read().saturating_sub(started);
                self.inner.settings.global_stats.record_load_failure(elapsed);
                Err(LoadError::failed(source))
            },
            None => {
                // Batch loading unsupported; each per-key load records its
                // own miss, so back the batch misses out.
                *misses = misses.saturating_sub(to_load.len() as u64);
                for key in to_load.drain(..) {
                    let value = self
                        .inner
                        .get_with_shared(Arc::clone(&key), self.loader.as_ref())?;
                    result.insert(key, value);
                }
                Ok(())
            },
        }
    }

    /// Triggers a background reload for `key`. Never raises; load failures
    /// are logged and the old value (if any) stays cached.
    pub fn refresh(&self, key: K) {
        let key = Arc::new(key);
        let hash = hash_key(&key);
        self.inner
            .stripe_for(hash)
            .refresh(&key, hash, self.loader.as_ref(), false);
    }
}

impl<K, V> Deref for LoadingCache<K, V> {
    type Target = Cache<K, V>;

    fn deref(&self) -> &Cache<K, V> {
        &self.inner
    }
}

impl<K: Eq + Hash, V> Cache<K, V> {
    /// `get_with` for callers that retain the key `Arc` (weak-key caches).
    pub fn get_with_shared(
        &self,
        key: Arc<K>,
        loader: &dyn CacheLoader<K, V>,
    ) -> Result<Arc<V>, LoadError> {
        let hash = hash_key(&key);
        self.stripe_for(hash).get_or_load(&key, hash, loader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spread_is_deterministic() {
        for h in [0u32, 1, 0xdead_beef, u32::MAX] {
            assert_eq!(spread(h), spread(h));
        }
    }

    #[test]
    fn spread_separates_sequential_inputs() {
        // Sequential raw hashes should not collapse into the same upper
        // bits, which pick the stripe.
        let picks: std::collections::HashSet<u32> =
            (0u32..64).map(|h| spread(h) >> 28).collect();
        assert!(picks.len() > 4);
    }

    #[test]
    fn hash_key_matches_equal_keys() {
        assert_eq!(hash_key(&"alpha"), hash_key(&"alpha"));
        assert_eq!(hash_key(&42u64), hash_key(&42u64));
    }
}
