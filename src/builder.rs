//! Cache builder: the configuration surface that produces a cache.
//!
//! Collects capacity, timing, strength, and collaborator settings, validates
//! them, and assembles the striped cache. Invalid combinations surface as
//! [`ConfigError`] rather than panicking.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use stripecache::builder::CacheBuilder;
//!
//! let cache = CacheBuilder::<u64, String>::new()
//!     .max_weight(10_000)
//!     .expire_after_write(Duration::from_secs(60))
//!     .build()
//!     .unwrap();
//!
//! cache.put(1, "hello".to_string());
//! assert_eq!(cache.get_if_present(&1).as_deref(), Some(&"hello".to_string()));
//! ```

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::entry::EntryShape;
use crate::cache::{Cache, LoadingCache, Settings};
use crate::error::ConfigError;
use crate::notify::{NotificationBus, RemovalListener};
use crate::stats::StatsCounter;
use crate::time::{NullTicker, SystemTicker, Ticker};
use crate::traits::{CacheLoader, Weigher};

/// Hard upper bound on the stripe count.
const MAX_STRIPES: usize = 1 << 16;

/// Hard upper bound on the total bucket capacity hint.
const MAX_CAPACITY: usize = 1 << 30;

/// When a weight cap is set, stop adding stripes once each would get fewer
/// than this many weight units; too many stripes relative to the cap makes
/// per-stripe eviction behave randomly.
const MIN_STRIPE_WEIGHT: u64 = 20;

const DEFAULT_INITIAL_CAPACITY: usize = 16;
const DEFAULT_CONCURRENCY_LEVEL: usize = 4;

/// Builder for [`Cache`] and [`LoadingCache`] instances.
pub struct CacheBuilder<K, V> {
    initial_capacity: usize,
    concurrency_level: usize,
    max_weight: Option<u64>,
    weigher: Option<Arc<Weigher<K, V>>>,
    expire_after_access: Option<Duration>,
    expire_after_write: Option<Duration>,
    refresh_after_write: Option<Duration>,
    weak_keys: bool,
    weak_values: bool,
    listener: Option<Box<dyn RemovalListener<K, V>>>,
    ticker: Option<Arc<dyn Ticker>>,
}

impl<K, V> Default for CacheBuilder<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> CacheBuilder<K, V> {
    pub fn new() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            max_weight: None,
            weigher: None,
            expire_after_access: None,
            expire_after_write: None,
            refresh_after_write: None,
            weak_keys: false,
            weak_values: false,
            listener: None,
            ticker: None,
        }
    }

    /// Hint for the initial total bucket capacity.
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Expected number of concurrently writing threads. The stripe count is
    /// the smallest power of two at or above this level.
    pub fn concurrency_level(mut self, level: usize) -> Self {
        self.concurrency_level = level;
        self
    }

    /// Caps the total weight; with the default weigher this is an entry
    /// count. Eviction is approximate per-stripe LRU.
    pub fn max_weight(mut self, max_weight: u64) -> Self {
        self.max_weight = Some(max_weight);
        self
    }

    /// Weighs each entry for the weight cap. Must be cheap and
    /// side-effect-free; it runs under the stripe lock.
    pub fn weigher(mut self, weigher: impl Fn(&K, &V) -> u64 + Send + Sync + 'static) -> Self {
        self.weigher = Some(Arc::new(weigher));
        self
    }

    /// Expires entries this long after their last read or write.
    /// `Duration::ZERO` disables the policy.
    pub fn expire_after_access(mut self, duration: Duration) -> Self {
        self.expire_after_access = Some(duration);
        self
    }

    /// Expires entries this long after they were written.
    /// `Duration::ZERO` disables the policy.
    pub fn expire_after_write(mut self, duration: Duration) -> Self {
        self.expire_after_write = Some(duration);
        self
    }

    /// Refreshes entries on read once they are older than this, serving the
    /// old value while the reload runs. Requires a loader at build time.
    pub fn refresh_after_write(mut self, duration: Duration) -> Self {
        self.refresh_after_write = Some(duration);
        self
    }

    /// Holds keys weakly: once the caller drops its `Arc<K>`, the entry is
    /// reclaimed cooperatively with cause `Collected`. Use
    /// [`Cache::put_shared`] so the caller retains the key.
    pub fn weak_keys(mut self) -> Self {
        self.weak_keys = true;
        self
    }

    /// Holds values weakly; see [`CacheBuilder::weak_keys`].
    pub fn weak_values(mut self) -> Self {
        self.weak_values = true;
        self
    }

    /// Receives one notification per removed entry, from arbitrary threads,
    /// with no stripe lock held.
    pub fn removal_listener(
        mut self,
        listener: impl RemovalListener<K, V> + 'static,
    ) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    /// Injects a time source; tests use
    /// [`ManualTicker`](crate::time::ManualTicker).
    pub fn ticker(mut self, ticker: Arc<dyn Ticker>) -> Self {
        self.ticker = Some(ticker);
        self
    }
}

impl<KB, VB> CacheBuilder<KB, VB> {
    fn validate(&self, has_loader: bool) -> Result<(), ConfigError> {
        if self.concurrency_level == 0 {
            return Err(ConfigError::new("concurrency level must be > 0"));
        }
        if self.weigher.is_some() && self.max_weight.is_none() {
            return Err(ConfigError::new("weigher requires max_weight"));
        }
        if self.refresh_nanos() > 0 && !has_loader {
            return Err(ConfigError::new(
                "refresh_after_write requires building with a loader",
            ));
        }
        Ok(())
    }

    fn access_nanos(&self) -> u64 {
        self.expire_after_access
            .map_or(0, |duration| duration.as_nanos() as u64)
    }

    fn write_nanos(&self) -> u64 {
        self.expire_after_write
            .map_or(0, |duration| duration.as_nanos() as u64)
    }

    fn refresh_nanos(&self) -> u64 {
        self.refresh_after_write
            .map_or(0, |duration| duration.as_nanos() as u64)
    }
}

impl<K: Eq + Hash, V> CacheBuilder<K, V> {
    /// Builds a manual cache. Fails on invalid configuration.
    pub fn build(self) -> Result<Cache<K, V>, ConfigError> {
        self.validate(false)?;
        Ok(self.assemble(None))
    }

    /// Builds a loading cache bound to `loader`.
    pub fn build_with_loader(
        self,
        loader: Arc<dyn CacheLoader<K, V>>,
    ) -> Result<LoadingCache<K, V>, ConfigError> {
        self.validate(true)?;
        let cache = self.assemble(Some(Arc::clone(&loader)));
        Ok(LoadingCache::new(cache, loader))
    }

    fn assemble(self, loader: Option<Arc<dyn CacheLoader<K, V>>>) -> Cache<K, V> {
        let access_nanos = self.access_nanos();
        let write_nanos = self.write_nanos();
        let refresh_nanos = self.refresh_nanos();
        let records_time = access_nanos > 0 || write_nanos > 0 || refresh_nanos > 0;

        let ticker = self.ticker.unwrap_or_else(|| {
            if records_time {
                Arc::new(SystemTicker::new())
            } else {
                Arc::new(NullTicker)
            }
        });
        let custom_weigher = self.weigher.is_some();
        let weigher = self.weigher.unwrap_or_else(|| Arc::new(|_: &K, _: &V| 1));

        let settings = Arc::new(Settings {
            ticker,
            weigher,
            expire_after_access: access_nanos,
            expire_after_write: write_nanos,
            refresh_interval: refresh_nanos,
            shape: EntryShape::select(
                self.weak_keys,
                self.max_weight.is_some() || access_nanos > 0,
                write_nanos > 0 || refresh_nanos > 0,
            ),
            weak_values: self.weak_values,
            max_weight: self.max_weight,
            bus: NotificationBus::new(self.listener),
            global_stats: StatsCounter::new(),
            loader,
        });

        // The lowest power-of-two stripe count at or above the concurrency
        // level, except that a weight cap pins each stripe at a useful
        // minimum share.
        let concurrency = self.concurrency_level.min(MAX_STRIPES);
        let mut shift = 0u32;
        let mut stripe_count = 1usize;
        while stripe_count < concurrency {
            if let Some(max) = self.max_weight {
                if stripe_count as u64 * MIN_STRIPE_WEIGHT > max {
                    break;
                }
            }
            shift += 1;
            stripe_count <<= 1;
        }
        let stripe_shift = 32 - shift;

        let mut initial_capacity = self.initial_capacity.min(MAX_CAPACITY);
        if let Some(max) = self.max_weight {
            if !custom_weigher {
                // With the default weigher the cap is an entry count; no
                // point reserving more buckets than that.
                initial_capacity = initial_capacity.min(max as usize);
            }
        }
        let per_stripe_capacity = (initial_capacity + stripe_count - 1) / stripe_count;
        let buckets_per_stripe = per_stripe_capacity.next_power_of_two().max(1);

        // Spread the weight cap across stripes so the per-stripe caps sum
        // exactly to the global cap.
        let stripe_weights: Vec<Option<u64>> = match self.max_weight {
            Some(max) => {
                let base = max / stripe_count as u64 + 1;
                let remainder = max % stripe_count as u64;
                (0..stripe_count as u64)
                    .map(|i| Some(if i < remainder { base } else { base - 1 }))
                    .collect()
            },
            None => vec![None; stripe_count],
        };

        Cache::assemble(settings, stripe_weights, buckets_per_stripe, stripe_shift)
    }
}
