// ==============================================
// LOAD-COORDINATION TESTS (integration)
// ==============================================
//
// At-most-one-load semantics: concurrent misses share a single loader
// invocation, loader outcomes (absent, error, panic) fan out to every
// waiter, recursive loads fail fast, and batch loading falls back to
// per-key loads when unsupported.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use stripecache::builder::CacheBuilder;
use stripecache::cache::Cache;
use stripecache::error::{DynError, LoadError};
use stripecache::traits::{CacheLoader, FnLoader};

// ==============================================
// Shared loader for the coordination tests
// ==============================================

struct SlowLoader {
    calls: AtomicU64,
    delay: Duration,
}

impl SlowLoader {
    fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicU64::new(0),
            delay,
        }
    }
}

impl CacheLoader<String, u64> for SlowLoader {
    fn load(&self, _key: &String) -> Result<Option<u64>, DynError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        Ok(Some(42))
    }
}

// ==============================================
// One load, many waiters
// ==============================================

#[test]
fn concurrent_misses_share_one_load() {
    let loader = Arc::new(SlowLoader::new(Duration::from_millis(100)));
    let cache = Arc::new(
        CacheBuilder::<String, u64>::new()
            .build_with_loader(loader.clone())
            .unwrap(),
    );

    let threads = 10;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.get("k".to_string()).unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(*handle.join().unwrap(), 42);
    }

    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    let stats = cache.stats();
    assert_eq!(stats.misses, threads as u64);
    assert_eq!(stats.load_successes, 1);
    assert_eq!(stats.hits, 0);
}

#[test]
fn loaded_value_is_cached_for_later_hits() {
    let loader = Arc::new(SlowLoader::new(Duration::ZERO));
    let cache = CacheBuilder::<String, u64>::new()
        .build_with_loader(loader.clone())
        .unwrap();

    assert_eq!(*cache.get("k".to_string()).unwrap(), 42);
    assert_eq!(*cache.get("k".to_string()).unwrap(), 42);
    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

#[test]
fn distinct_keys_load_independently() {
    let loader = Arc::new(FnLoader::new(|key: &u64| Ok(Some(key * 2))));
    let cache = Arc::new(
        CacheBuilder::<u64, u64>::new()
            .build_with_loader(loader)
            .unwrap(),
    );

    let handles: Vec<_> = (0..8u64)
        .map(|key| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || *cache.get(key).unwrap())
        })
        .collect();
    for (key, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), key as u64 * 2);
    }
    assert_eq!(cache.size(), 8);
}

// ==============================================
// Loader outcomes
// ==============================================

#[test]
fn absent_load_raises_invalid_and_leaves_no_entry() {
    let cache = CacheBuilder::<u64, u64>::new()
        .build_with_loader(Arc::new(FnLoader::new(|_: &u64| Ok(None))))
        .unwrap();

    match cache.get(1) {
        Err(LoadError::Invalid(_)) => {},
        other => panic!("expected invalid load, got {other:?}"),
    }
    assert_eq!(cache.get_if_present(&1), None);
    assert_eq!(cache.stats().load_failures, 1);
}

#[test]
fn failed_load_is_retried_on_the_next_call() {
    let calls = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&calls);
    let cache = CacheBuilder::<u64, u64>::new()
        .build_with_loader(Arc::new(FnLoader::new(move |key: &u64| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("first attempt fails".into())
            } else {
                Ok(Some(*key))
            }
        })))
        .unwrap();

    match cache.get(5) {
        Err(LoadError::Failed(source)) => {
            assert!(source.to_string().contains("first attempt fails"));
        },
        other => panic!("expected failed load, got {other:?}"),
    }
    assert_eq!(*cache.get(5).unwrap(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn loader_panic_resumes_on_the_loading_caller() {
    let cache = CacheBuilder::<u64, u64>::new()
        .build_with_loader(Arc::new(FnLoader::new(|_: &u64| -> Result<Option<u64>, DynError> {
            panic!("loader bug")
        })))
        .unwrap();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cache.get(1)));
    assert!(result.is_err());

    // The placeholder was unwound; the cache stays usable.
    assert_eq!(cache.get_if_present(&1), None);
}

#[test]
fn waiters_observe_a_panicked_load() {
    struct PanickingLoader {
        entered: Arc<Barrier>,
    }
    impl CacheLoader<u64, u64> for PanickingLoader {
        fn load(&self, _key: &u64) -> Result<Option<u64>, DynError> {
            self.entered.wait();
            thread::sleep(Duration::from_millis(50));
            panic!("loader bug")
        }
    }

    let entered = Arc::new(Barrier::new(2));
    let cache = Arc::new(
        CacheBuilder::<u64, u64>::new()
            .build_with_loader(Arc::new(PanickingLoader {
                entered: Arc::clone(&entered),
            }))
            .unwrap(),
    );

    let loading = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cache.get(1)));
        })
    };
    // Enter the wait only after the loader is definitely running.
    entered.wait();
    match cache.get(1) {
        Err(LoadError::Panicked) => {},
        other => panic!("expected panicked load, got {other:?}"),
    }
    loading.join().unwrap();
}

// ==============================================
// Recursive loads
// ==============================================

#[test]
fn recursive_load_fails_fast() {
    struct ReentrantLoader {
        cache: Mutex<Option<Arc<Cache<u64, u64>>>>,
        observed: Mutex<Option<LoadError>>,
    }
    impl CacheLoader<u64, u64> for ReentrantLoader {
        fn load(&self, key: &u64) -> Result<Option<u64>, DynError> {
            let cache = self.cache.lock().unwrap().clone().unwrap();
            if let Err(error) = cache.get_with(*key, self) {
                *self.observed.lock().unwrap() = Some(error);
            }
            Ok(Some(0))
        }
    }

    let loader = Arc::new(ReentrantLoader {
        cache: Mutex::new(None),
        observed: Mutex::new(None),
    });
    let cache = Arc::new(CacheBuilder::<u64, u64>::new().build().unwrap());
    *loader.cache.lock().unwrap() = Some(Arc::clone(&cache));

    assert_eq!(*cache.get_with(7, loader.as_ref()).unwrap(), 0);
    let observed = loader.observed.lock().unwrap().take();
    match observed {
        Some(LoadError::Recursive(_)) => {},
        other => panic!("expected recursive load error, got {other:?}"),
    }
}

// ==============================================
// Batch loading
// ==============================================

struct BatchLoader {
    batch_calls: AtomicU64,
    single_calls: AtomicU64,
    drop_key: Option<u64>,
}

impl BatchLoader {
    fn new(drop_key: Option<u64>) -> Self {
        Self {
            batch_calls: AtomicU64::new(0),
            single_calls: AtomicU64::new(0),
            drop_key,
        }
    }
}

impl CacheLoader<u64, u64> for BatchLoader {
    fn load(&self, key: &u64) -> Result<Option<u64>, DynError> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(key * 10))
    }

    fn load_all(&self, keys: &[Arc<u64>]) -> Option<Result<Vec<(Arc<u64>, u64)>, DynError>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let pairs = keys
            .iter()
            .filter(|key| Some(***key) != self.drop_key)
            .map(|key| (Arc::clone(key), **key * 10))
            .collect();
        Some(Ok(pairs))
    }
}

#[test]
fn get_all_uses_the_batch_loader_for_misses() {
    let loader = Arc::new(BatchLoader::new(None));
    let cache = CacheBuilder::<u64, u64>::new()
        .build_with_loader(loader.clone())
        .unwrap();

    cache.put(1, 10);
    let result = cache.get_all(vec![1, 2, 3]).unwrap();

    assert_eq!(result.len(), 3);
    assert_eq!(result.get(&Arc::new(2)).map(|v| **v), Some(20));
    assert_eq!(loader.batch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(loader.single_calls.load(Ordering::SeqCst), 0);

    // Batch results were stored.
    assert_eq!(cache.get_if_present(&3).as_deref(), Some(&30));
}

#[test]
fn get_all_raises_invalid_when_the_batch_drops_a_key() {
    let loader = Arc::new(BatchLoader::new(Some(2)));
    let cache = CacheBuilder::<u64, u64>::new()
        .build_with_loader(loader)
        .unwrap();

    match cache.get_all(vec![1, 2, 3]) {
        Err(LoadError::Invalid(_)) => {},
        other => panic!("expected invalid load, got {:?}", other.map(|m| m.len())),
    }
    // The values the batch did return were still stored.
    assert_eq!(cache.get_if_present(&1).as_deref(), Some(&10));
}

#[test]
fn get_all_falls_back_to_per_key_loads() {
    let loader = Arc::new(FnLoader::new(|key: &u64| Ok(Some(key * 10))));
    let cache = CacheBuilder::<u64, u64>::new()
        .build_with_loader(loader)
        .unwrap();

    let result = cache.get_all(vec![4, 5]).unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result.get(&Arc::new(4)).map(|v| **v), Some(40));
    assert_eq!(cache.stats().load_successes, 2);
}

#[test]
fn get_all_failed_batch_surfaces_the_cause() {
    struct FailingBatch;
    impl CacheLoader<u64, u64> for FailingBatch {
        fn load(&self, _key: &u64) -> Result<Option<u64>, DynError> {
            Ok(Some(0))
        }
        fn load_all(&self, _keys: &[Arc<u64>]) -> Option<Result<Vec<(Arc<u64>, u64)>, DynError>> {
            Some(Err("batch backend down".into()))
        }
    }

    let cache = CacheBuilder::<u64, u64>::new()
        .build_with_loader(Arc::new(FailingBatch))
        .unwrap();

    match cache.get_all(vec![1]) {
        Err(LoadError::Failed(source)) => {
            assert!(source.to_string().contains("batch backend down"));
        },
        other => panic!("expected failed load, got {:?}", other.map(|m| m.len())),
    }
}
