// ==============================================
// WEAK-REFERENCE RECLAMATION TESTS (integration)
// ==============================================
//
// Weakly held keys and values are reclaimed cooperatively: once the caller
// drops its last Arc, a later chain walk observes the dead reference,
// stages the entry, and cleanup removes it with cause Collected.

use std::sync::{Arc, Mutex};

use stripecache::builder::CacheBuilder;
use stripecache::notify::{RemovalCause, RemovalNotification};

type Log = Arc<Mutex<Vec<RemovalCause>>>;

// ==============================================
// Weak values
// ==============================================

#[test]
fn dropped_value_reads_absent_and_collects() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let cache = CacheBuilder::<u64, String>::new()
        .weak_values()
        .removal_listener(move |n: RemovalNotification<u64, String>| {
            sink.lock().unwrap().push(n.cause);
        })
        .build()
        .unwrap();

    let value = Arc::new("payload".to_string());
    cache.put_shared(Arc::new(1), Arc::clone(&value));

    // Live while the caller holds the Arc.
    assert_eq!(cache.get_if_present(&1).as_deref(), Some(&"payload".to_string()));
    assert_eq!(cache.size(), 1);

    // Reclaimed once the last strong reference drops.
    drop(value);
    assert_eq!(cache.get_if_present(&1), None);

    cache.clean_up();
    assert_eq!(cache.size(), 0);
    assert_eq!(*log.lock().unwrap(), vec![RemovalCause::Collected]);
}

#[test]
fn cache_hit_keeps_a_weak_value_alive() {
    let cache = CacheBuilder::<u64, String>::new()
        .weak_values()
        .build()
        .unwrap();

    let value = Arc::new("payload".to_string());
    cache.put_shared(Arc::new(1), Arc::clone(&value));

    // A hit hands out a new strong reference; dropping the original no
    // longer kills the entry while the hit's Arc lives.
    let held = cache.get_if_present(&1).unwrap();
    drop(value);
    assert_eq!(cache.get_if_present(&1).as_deref(), Some(&"payload".to_string()));

    drop(held);
    assert_eq!(cache.get_if_present(&1), None);
}

#[test]
fn overwriting_a_collected_value_recovers_the_entry() {
    let cache = CacheBuilder::<u64, String>::new()
        .weak_values()
        .build()
        .unwrap();

    let value = Arc::new("old".to_string());
    cache.put_shared(Arc::new(1), Arc::clone(&value));
    drop(value);

    let replacement = Arc::new("new".to_string());
    // The overwrite recovers the entry in place; no previous value exists.
    assert_eq!(cache.put_shared(Arc::new(1), Arc::clone(&replacement)), None);
    assert_eq!(cache.get_if_present(&1).as_deref(), Some(&"new".to_string()));
    assert_eq!(cache.size(), 1);
}

// ==============================================
// Weak keys
// ==============================================

#[test]
fn dropped_key_reads_absent_and_collects() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let cache = CacheBuilder::<u64, String>::new()
        .weak_keys()
        .removal_listener(move |n: RemovalNotification<u64, String>| {
            sink.lock().unwrap().push(n.cause);
        })
        .build()
        .unwrap();

    let key = Arc::new(1u64);
    cache.put_shared(Arc::clone(&key), Arc::new("payload".to_string()));
    assert!(cache.contains_key(&1));

    drop(key);
    assert_eq!(cache.get_if_present(&1), None);

    cache.clean_up();
    assert_eq!(cache.size(), 0);
    assert_eq!(*log.lock().unwrap(), vec![RemovalCause::Collected]);
}

#[test]
fn strong_cache_never_collects() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let cache = CacheBuilder::<u64, String>::new()
        .removal_listener(move |n: RemovalNotification<u64, String>| {
            sink.lock().unwrap().push(n.cause);
        })
        .build()
        .unwrap();

    let value = Arc::new("payload".to_string());
    cache.put_shared(Arc::new(1), Arc::clone(&value));
    drop(value);

    cache.clean_up();
    assert_eq!(cache.get_if_present(&1).as_deref(), Some(&"payload".to_string()));
    assert!(log.lock().unwrap().is_empty());
}

// ==============================================
// Reclamation interactions
// ==============================================

#[test]
fn collected_removal_of_a_dead_value_returns_absent() {
    let cache = CacheBuilder::<u64, String>::new()
        .weak_values()
        .build()
        .unwrap();

    let value = Arc::new("x".to_string());
    cache.put_shared(Arc::new(1), Arc::clone(&value));
    drop(value);

    // Removing a collected entry yields no value.
    assert_eq!(cache.invalidate(&1), None);
    assert_eq!(cache.size(), 0);
}

#[test]
fn many_reclaimed_entries_drain_over_multiple_rounds() {
    // More dead entries than one bounded drain round handles; repeated
    // cleanup rounds get through all of them.
    let cache = CacheBuilder::<u64, String>::new()
        .concurrency_level(1)
        .weak_values()
        .build()
        .unwrap();

    let values: Vec<Arc<String>> = (0..40).map(|i| Arc::new(format!("v{i}"))).collect();
    for (i, value) in values.iter().enumerate() {
        cache.put_shared(Arc::new(i as u64), Arc::clone(value));
    }
    drop(values);

    // Stage every dead entry, then drain.
    for i in 0..40u64 {
        assert_eq!(cache.get_if_present(&i), None);
    }
    for _ in 0..10 {
        cache.clean_up();
    }
    assert_eq!(cache.size(), 0);
}
