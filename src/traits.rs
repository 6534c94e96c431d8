//! # Cache Collaborator Traits
//!
//! This module defines the interfaces the cache consumes: the upstream
//! [`CacheLoader`], the [`Reload`] result shape for refresh-ahead, and the
//! weigher used for size-based eviction.
//!
//! ## Loader contract
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────────────┐
//!   │  CacheLoader<K, V>                                               │
//!   │                                                                  │
//!   │  load(&K)          → Result<Option<V>, DynError>                 │
//!   │      Ok(Some(v))     value produced                              │
//!   │      Ok(None)        no value for this key  → LoadError::Invalid │
//!   │      Err(e)          load failed            → LoadError::Failed  │
//!   │                                                                  │
//!   │  reload(&K, Arc<V>) → Reload<V>          (default: load again)   │
//!   │      Ready(..)       computed on the calling thread              │
//!   │      Background(..)  handed to a worker; readers keep the old    │
//!   │                      value until the handle completes            │
//!   │                                                                  │
//!   │  load_all(&[Arc<K>]) → Option<Result<Vec<(Arc<K>, V)>, ..>>      │
//!   │      None            batch loading unsupported → per-key loads   │
//!   └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `Ok(None)` is a domain outcome ("this key has no value"), distinct from
//! `Err` ("the load failed"); the two surface as different [`LoadError`]
//! variants.
//!
//! ## Threading
//!
//! `load` and `reload` are invoked while the caller holds no stripe lock.
//! The weigher runs under the stripe lock and must be cheap and
//! side-effect-free.
//!
//! [`LoadError`]: crate::error::LoadError

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::DynError;

/// Weight function for size-based eviction.
///
/// Must return a stable non-negative weight for a given `(key, value)` pair
/// for the lifetime of the cached holder. The default weigher returns 1,
/// turning the weight cap into an entry-count cap.
pub type Weigher<K, V> = dyn Fn(&K, &V) -> u64 + Send + Sync;

/// Result of [`CacheLoader::reload`].
pub enum Reload<V> {
    /// The replacement value was computed synchronously.
    Ready(Result<Option<V>, DynError>),

    /// The replacement value is being computed elsewhere.
    ///
    /// The cache keeps serving the old value and completes the refresh from
    /// a later cache operation once the handle finishes; the reloading
    /// thread never blocks a reader.
    Background(JoinHandle<Result<Option<V>, DynError>>),
}

/// Computes values for keys missing from the cache.
///
/// One loader invocation can satisfy many concurrent callers: the cache
/// guarantees at most one in-flight load per key, and every waiter receives
/// the same outcome.
///
/// # Example
///
/// ```
/// use stripecache::traits::CacheLoader;
/// use stripecache::error::DynError;
///
/// struct SquareLoader;
///
/// impl CacheLoader<u64, u64> for SquareLoader {
///     fn load(&self, key: &u64) -> Result<Option<u64>, DynError> {
///         Ok(Some(key * key))
///     }
/// }
/// ```
pub trait CacheLoader<K, V>: Send + Sync {
    /// Computes the value for `key`, or `Ok(None)` if the key has none.
    fn load(&self, key: &K) -> Result<Option<V>, DynError>;

    /// Computes a replacement for an existing value during refresh-ahead.
    ///
    /// The default delegates to [`load`](Self::load) on the calling thread.
    /// Return [`Reload::Background`] to keep refreshes off the read path.
    fn reload(&self, key: &K, old_value: Arc<V>) -> Reload<V> {
        let _ = old_value;
        Reload::Ready(self.load(key))
    }

    /// Computes values for a batch of keys, or `None` when batch loading
    /// is unsupported (the cache falls back to per-key loads).
    ///
    /// A supported batch may return entries for keys beyond those
    /// requested; all returned pairs are stored.
    fn load_all(&self, keys: &[Arc<K>]) -> Option<Result<Vec<(Arc<K>, V)>, DynError>> {
        let _ = keys;
        None
    }
}

/// Adapts a closure into a [`CacheLoader`].
///
/// # Example
///
/// ```
/// use stripecache::traits::{CacheLoader, FnLoader};
///
/// let loader = FnLoader::new(|key: &u64| Ok(Some(key + 1)));
/// assert_eq!(loader.load(&41).unwrap(), Some(42));
/// ```
pub struct FnLoader<F>(F);

impl<F> FnLoader<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<K, V, F> CacheLoader<K, V> for FnLoader<F>
where
    F: Fn(&K) -> Result<Option<V>, DynError> + Send + Sync,
{
    fn load(&self, key: &K) -> Result<Option<V>, DynError> {
        (self.0)(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fn_loader_delegates() {
        let loader = FnLoader::new(|key: &u64| Ok(Some(key * 2)));
        assert_eq!(loader.load(&21).unwrap(), Some(42));
    }

    #[test]
    fn default_reload_delegates_to_load() {
        let loader = FnLoader::new(|key: &u64| Ok(Some(key + 1)));
        match CacheLoader::reload(&loader, &1, Arc::new(0)) {
            Reload::Ready(result) => assert_eq!(result.unwrap(), Some(2)),
            Reload::Background(_) => panic!("default reload must be synchronous"),
        }
    }

    #[test]
    fn default_load_all_is_unsupported() {
        let loader = FnLoader::new(|_: &u64| Ok(Some(0u64)));
        assert!(CacheLoader::load_all(&loader, &[Arc::new(1)]).is_none());
    }
}
