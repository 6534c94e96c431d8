// ==============================================
// BASIC MAP-CONTRACT TESTS (integration)
// ==============================================
//
// End-to-end coverage of the plain (non-loading, non-expiring) cache
// surface: put/get/remove outcomes, conditional writes, bulk operations,
// aggregates, and the notifications each mutation emits.

use std::sync::{Arc, Mutex};

use stripecache::builder::CacheBuilder;
use stripecache::cache::Cache;
use stripecache::notify::{RemovalCause, RemovalNotification};

type Log = Arc<Mutex<Vec<(Option<u64>, Option<i64>, RemovalCause)>>>;

fn cache_with_log() -> (Cache<u64, i64>, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let cache = CacheBuilder::<u64, i64>::new()
        .removal_listener(move |n: RemovalNotification<u64, i64>| {
            sink.lock().unwrap().push((
                n.key.map(|k| *k),
                n.value.map(|v| *v),
                n.cause,
            ));
        })
        .build()
        .unwrap();
    (cache, log)
}

// ==============================================
// Scenario: put / get / replace / remove
// ==============================================

#[test]
fn put_get_remove_with_notifications_and_stats() {
    let (cache, log) = cache_with_log();

    assert_eq!(cache.put(1, 10), None);
    assert_eq!(cache.get_if_present(&1).as_deref(), Some(&10));

    // Overwrite returns the previous value and emits Replaced.
    assert_eq!(cache.put(1, 20).as_deref(), Some(&10));
    assert_eq!(cache.get_if_present(&1).as_deref(), Some(&20));

    // Removal returns the value and emits Explicit.
    assert_eq!(cache.invalidate(&1).as_deref(), Some(&20));
    assert_eq!(cache.get_if_present(&1), None);

    let stats = cache.stats();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.evictions, 0);

    let log = log.lock().unwrap();
    assert_eq!(
        *log,
        vec![
            (Some(1), Some(10), RemovalCause::Replaced),
            (Some(1), Some(20), RemovalCause::Explicit),
        ]
    );
}

#[test]
fn invalidate_missing_key_is_silent() {
    let (cache, log) = cache_with_log();
    assert_eq!(cache.invalidate(&42), None);
    assert!(log.lock().unwrap().is_empty());
}

// ==============================================
// Conditional writes
// ==============================================

#[test]
fn put_if_absent_only_writes_once() {
    let (cache, log) = cache_with_log();

    assert_eq!(cache.put_if_absent(1, 10), None);
    assert_eq!(cache.put_if_absent(1, 99).as_deref(), Some(&10));
    assert_eq!(cache.get_if_present(&1).as_deref(), Some(&10));
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn replace_requires_an_existing_value() {
    let (cache, _log) = cache_with_log();

    assert_eq!(cache.replace(&1, 10), None);
    assert!(!cache.contains_key(&1));

    cache.put(1, 10);
    assert_eq!(cache.replace(&1, 20).as_deref(), Some(&10));
    assert_eq!(cache.get_if_present(&1).as_deref(), Some(&20));
}

#[test]
fn conditional_replace_and_remove_use_value_equality() {
    let (cache, log) = cache_with_log();
    cache.put(1, 10);

    assert!(!cache.replace_expected(&1, &99, 20));
    assert_eq!(cache.get_if_present(&1).as_deref(), Some(&10));

    assert!(cache.replace_expected(&1, &10, 20));
    assert_eq!(cache.get_if_present(&1).as_deref(), Some(&20));

    assert!(!cache.invalidate_expected(&1, &10));
    assert!(cache.invalidate_expected(&1, &20));
    assert!(!cache.contains_key(&1));

    let causes: Vec<_> = log.lock().unwrap().iter().map(|n| n.2).collect();
    assert_eq!(causes, vec![RemovalCause::Replaced, RemovalCause::Explicit]);
}

// ==============================================
// Bulk operations and aggregates
// ==============================================

#[test]
fn put_all_and_get_all_present() {
    let (cache, _log) = cache_with_log();
    cache.put_all((0..10).map(|k| (k, k as i64 * 2)));

    let found = cache.get_all_present(vec![0, 5, 9, 99]);
    assert_eq!(found.len(), 3);
    assert_eq!(found.get(&Arc::new(5)).map(|v| **v), Some(10));
    assert!(!found.contains_key(&Arc::new(99)));

    let stats = cache.stats();
    assert_eq!(stats.hits, 3);
    assert_eq!(stats.misses, 1);
}

#[test]
fn size_is_empty_and_invalidate_all() {
    let (cache, log) = cache_with_log();
    assert!(cache.is_empty());
    assert_eq!(cache.size(), 0);

    cache.put_all((0..100).map(|k| (k, k as i64)));
    assert_eq!(cache.size(), 100);
    assert!(!cache.is_empty());

    cache.invalidate_all();
    assert_eq!(cache.size(), 0);
    assert!(cache.is_empty());

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 100);
    assert!(log.iter().all(|n| n.2 == RemovalCause::Explicit));
}

#[test]
fn invalidate_many_removes_each_key() {
    let (cache, _log) = cache_with_log();
    cache.put_all((0..10).map(|k| (k, k as i64)));
    cache.invalidate_many(&[1, 3, 5]);

    assert_eq!(cache.size(), 7);
    assert!(!cache.contains_key(&3));
    assert!(cache.contains_key(&4));
}

#[test]
fn contains_value_scans_live_entries() {
    let (cache, _log) = cache_with_log();
    cache.put(1, 10);
    cache.put(2, 20);

    assert!(cache.contains_value(&10));
    assert!(cache.contains_value(&20));
    assert!(!cache.contains_value(&30));

    cache.invalidate(&1);
    assert!(!cache.contains_value(&10));
}

// ==============================================
// Iteration
// ==============================================

#[test]
fn iter_yields_every_live_pair_exactly_once() {
    let (cache, _log) = cache_with_log();
    cache.put_all((0..50).map(|k| (k, k as i64 * 3)));

    let mut seen: Vec<(u64, i64)> = cache.iter().map(|(k, v)| (*k, *v)).collect();
    seen.sort_unstable();

    let expected: Vec<(u64, i64)> = (0..50).map(|k| (k, k as i64 * 3)).collect();
    assert_eq!(seen, expected);
}

#[test]
fn iter_on_empty_cache_is_empty() {
    let (cache, _log) = cache_with_log();
    assert_eq!(cache.iter().count(), 0);
}

#[test]
fn as_map_snapshots_live_mappings() {
    let (cache, _log) = cache_with_log();
    cache.put(1, 10);
    cache.put(2, 20);
    cache.invalidate(&1);

    let map = cache.as_map();
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(&Arc::new(2)).map(|v| **v), Some(20));
}

// ==============================================
// Value sharing
// ==============================================

#[test]
fn hits_share_one_allocation() {
    let (cache, _log) = cache_with_log();
    cache.put(1, 7);
    let a = cache.get_if_present(&1).unwrap();
    let b = cache.get_if_present(&1).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}
