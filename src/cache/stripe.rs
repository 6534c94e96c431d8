//! Stripe: one lock-partitioned segment of the cache.
//!
//! A stripe owns a power-of-two table of atomic bucket heads (each a
//! singly linked chain of slot-bank entries), the two intrusive ordering
//! queues, the lock-free staging queues, and a stats counter. One mutex
//! serializes all structural mutation; reads touch no lock at all — they
//! walk atomic chain indices, stamp atomic timestamps, and stage their
//! recency updates instead of touching the queues.
//!
//! ## Locking discipline
//!
//! ```text
//!   read path     no lock       pinned chain walk over atomic indices
//!   write path    stripe lock   pre-write cleanup → mutate → size eviction
//!   cleanup       try_lock      skipped when another thread holds the lock
//!   loader        no lock       runs strictly outside the stripe lock
//!   listener      no lock       bus drained after the lock is released
//! ```
//!
//! ## Reader quiescence
//!
//! Readers pin the stripe (an atomic counter) for the duration of one
//! chain walk. Writers never free reader-visible memory directly: retired
//! slots, displaced value holders, and superseded bucket tables are parked
//! in a limbo list and reaped during a later cleanup round that observes
//! zero pinned readers. A reader that pins after that observation orders
//! after the retirements (sequentially consistent fences on both sides),
//! so it can no longer reach the reaped memory. Unlinking is in place:
//! a retired slot's chain link keeps pointing at its old successor, so a
//! reader standing on it mid-walk still terminates correctly.
//!
//! ## Amortized cleanup
//!
//! Every 64th read on a stripe attempts a non-blocking cleanup round:
//! drain the reclamation channels (16 items each), expire past-due entries
//! (draining the recency buffer first), complete any finished background
//! reloads, and reap quiescent limbo. Writes run the same round
//! unconditionally before mutating. Removal notifications are always
//! delivered after the stripe lock is released.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{fence, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tracing::warn;

use crate::cache::entry::{Entry, KeyRef, LoadShared, ValueHolder};
use crate::cache::Settings;
use crate::ds::{
    AccessOrder, EntryId, IndexDeque, RecencyBuffer, ReclaimChannel, SlotBank, WriteOrder, NIL,
};
use crate::error::{DynError, LoadError};
use crate::notify::{RemovalCause, RemovalNotification};
use crate::stats::{CacheStats, StatsCounter};
use crate::traits::{CacheLoader, Reload};

/// Low-bit mask of the read counter; cleanup runs every 64 reads.
const READ_DRAIN_MASK: usize = 0x3F;

/// Buckets never grow beyond this.
const MAX_TABLE_BUCKETS: usize = 1 << 30;

/// Power-of-two array of bucket heads, replaced wholesale on growth.
struct Table {
    cells: Box<[AtomicU32]>,
}

impl Table {
    fn new(len: usize) -> Self {
        debug_assert!(len.is_power_of_two());
        Self {
            cells: (0..len).map(|_| AtomicU32::new(NIL)).collect(),
        }
    }

    fn len(&self) -> usize {
        self.cells.len()
    }

    fn mask(&self) -> u32 {
        (self.cells.len() - 1) as u32
    }

    fn cell(&self, hash: u32) -> &AtomicU32 {
        &self.cells[(hash & self.mask()) as usize]
    }

    fn at(&self, index: usize) -> &AtomicU32 {
        &self.cells[index]
    }
}

/// A superseded bucket table awaiting quiescent reclamation.
struct RetiredTable(*mut Table);

// SAFETY: the pointer is an exclusively owned `Box<Table>` whose only
// other observers are pinned readers, which quiescence waits out.
unsafe impl Send for RetiredTable {}

/// Writer-only bookkeeping guarded by the stripe lock.
struct StripeCore<V> {
    /// Reaped slot indices ready for reuse.
    free: Vec<u32>,
    /// High-water mark of slots ever allocated from the bank.
    allocated: u32,
    /// Entry count that triggers a table doubling.
    threshold: usize,
    access_queue: IndexDeque<AccessOrder>,
    write_queue: IndexDeque<WriteOrder>,
    /// Retired slots still visible to pinned readers.
    limbo_slots: Vec<u32>,
    /// Displaced holders still visible to pinned readers.
    limbo_holders: Vec<Arc<ValueHolder<V>>>,
    /// Superseded tables still visible to pinned readers.
    limbo_tables: Vec<RetiredTable>,
}

/// One lock-partitioned segment of the cache.
pub(crate) struct Stripe<K, V> {
    settings: Arc<Settings<K, V>>,
    /// This stripe's share of the global weight cap.
    max_weight: Option<u64>,
    /// Slot storage shared by lock-free readers and the lock holder.
    bank: SlotBank<Entry<K, V>>,
    /// Current bucket table; readers load it while pinned.
    table: AtomicPtr<Table>,
    core: Mutex<StripeCore<V>>,
    /// Pinned-reader count driving quiescent reclamation.
    readers: AtomicUsize,
    /// Live entry count; written only under the lock, read lock-free.
    count: AtomicUsize,
    /// Mutation counter for the facade's consistency checks.
    mod_count: AtomicU64,
    /// Sum of live holder weights; written only under the lock.
    total_weight: AtomicU64,
    read_count: AtomicUsize,
    recency: RecencyBuffer,
    key_reclaim: ReclaimChannel,
    value_reclaim: ReclaimChannel,
    /// Entries with a backgrounded reload awaiting completion.
    pending_refresh: SegQueue<EntryId>,
    stats: StatsCounter,
}

/// Guard for one lock-free chain walk.
struct ReadPin<'a> {
    readers: &'a AtomicUsize,
}

impl Drop for ReadPin<'_> {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Read-path classification computed while pinned.
enum ReadOutcome<K, V> {
    Miss,
    /// Value plus the stored key when a refresh should be scheduled.
    Hit(Arc<V>, Option<Arc<K>>),
    Expired,
    CollectedValue,
    /// A backgrounded reload finished; install it and retry.
    FinishRefresh,
}

/// Slow-path classification computed under the stripe lock.
enum LoadOutcome<V> {
    Hit(Arc<V>),
    Wait(EntryId, Arc<LoadShared<V>>),
    Installed(Arc<LoadShared<V>>),
}

impl<K: Eq, V> Stripe<K, V> {
    pub(crate) fn new(
        settings: Arc<Settings<K, V>>,
        max_weight: Option<u64>,
        initial_buckets: usize,
    ) -> Self {
        debug_assert!(initial_buckets.is_power_of_two());
        Self {
            settings,
            max_weight,
            bank: SlotBank::new(),
            table: AtomicPtr::new(Box::into_raw(Box::new(Table::new(initial_buckets)))),
            core: Mutex::new(StripeCore {
                free: Vec::new(),
                allocated: 0,
                threshold: initial_buckets * 3 / 4,
                access_queue: IndexDeque::new(),
                write_queue: IndexDeque::new(),
                limbo_slots: Vec::new(),
                limbo_holders: Vec::new(),
                limbo_tables: Vec::new(),
            }),
            readers: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            mod_count: AtomicU64::new(0),
            total_weight: AtomicU64::new(0),
            read_count: AtomicUsize::new(0),
            recency: RecencyBuffer::new(),
            key_reclaim: ReclaimChannel::new(),
            value_reclaim: ReclaimChannel::new(),
            pending_refresh: SegQueue::new(),
            stats: StatsCounter::new(),
        }
    }

    // -- observers ---------------------------------------------------------

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn mod_count(&self) -> u64 {
        self.mod_count.load(Ordering::Acquire)
    }

    pub(crate) fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    pub(crate) fn total_weight(&self) -> u64 {
        self.total_weight.load(Ordering::Acquire)
    }

    pub(crate) fn table_len(&self) -> usize {
        let _pin = self.pin();
        self.table_ref().len()
    }

    fn count_add(&self, n: usize) {
        let current = self.count.load(Ordering::Relaxed);
        self.count.store(current + n, Ordering::Release);
    }

    fn count_sub(&self, n: usize) {
        let current = self.count.load(Ordering::Relaxed);
        self.count.store(current.saturating_sub(n), Ordering::Release);
    }

    fn weight_add(&self, weight: u64) {
        let current = self.total_weight.load(Ordering::Relaxed);
        self.total_weight.store(current + weight, Ordering::Release);
    }

    fn weight_sub(&self, weight: u64) {
        let current = self.total_weight.load(Ordering::Relaxed);
        self.total_weight
            .store(current.saturating_sub(weight), Ordering::Release);
    }

    // -- shared access -----------------------------------------------------

    /// Pins the stripe for one lock-free chain walk. Never blocks.
    fn pin(&self) -> ReadPin<'_> {
        self.readers.fetch_add(1, Ordering::SeqCst);
        // Pairs with the fence in `try_reap_locked`: loads after this
        // fence observe every unlink that preceded a zero-observation.
        fence(Ordering::SeqCst);
        ReadPin {
            readers: &self.readers,
        }
    }

    /// Current bucket table.
    ///
    /// The caller must hold the stripe lock or a reader pin; either keeps
    /// a superseded table alive until it can no longer be referenced.
    fn table_ref(&self) -> &Table {
        let raw = self.table.load(Ordering::Acquire);
        // SAFETY: tables are freed only at quiescence or drop.
        unsafe { &*raw }
    }

    #[inline]
    fn slot(&self, index: u32) -> &Entry<K, V> {
        self.bank.get(index)
    }

    /// Handle for a slot known to be live under the stripe lock.
    fn live_id(&self, index: u32) -> EntryId {
        let entry = self.slot(index);
        debug_assert!(entry.is_live());
        EntryId::new(index, entry.gen())
    }

    /// Revalidates a staged handle against the slot's generation.
    fn entry_if_current(&self, id: EntryId) -> Option<&Entry<K, V>> {
        let entry = self.bank.try_get(id.index())?;
        (id.gen() & 1 == 1 && entry.gen() == id.gen()).then_some(entry)
    }

    /// Finds the chain position of `key`, staging entries whose weak key
    /// died for reclamation.
    ///
    /// The caller must hold the stripe lock or a reader pin.
    fn find_index(&self, key: &K, hash: u32) -> Option<u32> {
        let table = self.table_ref();
        let mut index = table.cell(hash).load(Ordering::Acquire);
        while index != NIL {
            let entry = self.bank.get(index);
            if entry.hash() == hash {
                if let Some(stored) = entry.key_ref() {
                    match stored.get() {
                        Some(stored_key) => {
                            if *stored_key == *key {
                                return Some(index);
                            }
                        },
                        None => {
                            if entry.is_live() {
                                self.key_reclaim.push(EntryId::new(index, entry.gen()));
                            }
                        },
                    }
                }
            }
            index = entry.next();
        }
        None
    }

    // -- read path ---------------------------------------------------------

    /// Lock-free lookup; counts nothing (the facade records hit/miss).
    pub(crate) fn get(&self, key: &K, hash: u32) -> Option<Arc<V>> {
        let result = self.get_live(key, hash, true);
        self.post_read_cleanup();
        result
    }

    pub(crate) fn contains_key(&self, key: &K, hash: u32) -> bool {
        let result = self.get_live(key, hash, false).is_some();
        self.post_read_cleanup();
        result
    }

    fn get_live(&self, key: &K, hash: u32, record: bool) -> Option<Arc<V>> {
        let mut finish_allowed = true;
        loop {
            if self.count() == 0 {
                return None;
            }
            let now = self.settings.ticker.read();
            let outcome = self.read_once(key, hash, now, record, finish_allowed);
            match outcome {
                ReadOutcome::Miss => return None,
                ReadOutcome::CollectedValue => {
                    self.try_locked_cleanup(now);
                    return None;
                },
                ReadOutcome::Expired => {
                    self.try_locked_cleanup(now);
                    return None;
                },
                ReadOutcome::Hit(value, None) => return Some(value),
                ReadOutcome::Hit(value, Some(stored_key)) => {
                    return Some(match self.settings.loader.clone() {
                        Some(loader) => self
                            .refresh(&stored_key, hash, loader.as_ref(), true)
                            .unwrap_or(value),
                        None => value,
                    });
                },
                ReadOutcome::FinishRefresh => {
                    self.complete_background(key, hash);
                    finish_allowed = false;
                },
            }
        }
    }

    /// One pass over the chain while pinned; takes no lock.
    fn read_once(
        &self,
        key: &K,
        hash: u32,
        now: u64,
        record: bool,
        finish_allowed: bool,
    ) -> ReadOutcome<K, V> {
        let _pin = self.pin();
        let Some(index) = self.find_index(key, hash) else {
            return ReadOutcome::Miss;
        };
        let entry = self.slot(index);
        let Some(holder) = entry.holder() else {
            return ReadOutcome::Miss;
        };

        if finish_allowed {
            if let Some(shared) = holder.loading_shared() {
                if shared.background_finished() {
                    return ReadOutcome::FinishRefresh;
                }
            }
        }

        let Some(value) = holder.value() else {
            if holder.is_active() && !holder.is_loading() {
                if entry.is_live() {
                    self.value_reclaim.push(EntryId::new(index, entry.gen()));
                }
                return ReadOutcome::CollectedValue;
            }
            return ReadOutcome::Miss;
        };

        if self.settings.is_expired(entry, now) {
            return ReadOutcome::Expired;
        }

        if record {
            if self.settings.records_access_time() {
                entry.set_access_time(now);
            }
            if self.settings.uses_access_queue() && entry.is_live() {
                self.recency.push(EntryId::new(index, entry.gen()));
            }
        }

        let refresh_key = (record
            && self.settings.refreshes()
            && !holder.is_loading()
            && now.saturating_sub(entry.write_time()) > self.settings.refresh_interval)
            .then(|| entry.key())
            .flatten();
        ReadOutcome::Hit(value, refresh_key)
    }

    /// Scans the whole stripe for a matching live value; takes no lock.
    pub(crate) fn scan_for_value(&self, value: &V, now: u64) -> bool
    where
        V: PartialEq,
    {
        if self.count() == 0 {
            return false;
        }
        let _pin = self.pin();
        let table = self.table_ref();
        for cell in 0..table.len() {
            let mut index = table.at(cell).load(Ordering::Acquire);
            while index != NIL {
                let entry = self.bank.get(index);
                if entry.key().is_some() && !self.settings.is_expired(entry, now) {
                    if let Some(candidate) = entry.holder().and_then(ValueHolder::value) {
                        if *candidate == *value {
                            return true;
                        }
                    }
                }
                index = entry.next();
            }
        }
        false
    }

    /// Live pairs of one bucket, copied out while pinned.
    pub(crate) fn bucket_snapshot(&self, bucket: usize, now: u64) -> Vec<(Arc<K>, Arc<V>)> {
        let _pin = self.pin();
        let table = self.table_ref();
        let mut pairs = Vec::new();
        if bucket >= table.len() {
            return pairs;
        }
        let mut index = table.at(bucket).load(Ordering::Acquire);
        while index != NIL {
            let entry = self.bank.get(index);
            if !self.settings.is_expired(entry, now) {
                if let (Some(key), Some(value)) =
                    (entry.key(), entry.holder().and_then(ValueHolder::value))
                {
                    pairs.push((key, value));
                }
            }
            index = entry.next();
        }
        pairs
    }

    // -- write path --------------------------------------------------------

    pub(crate) fn put(
        &self,
        key: Arc<K>,
        hash: u32,
        value: Arc<V>,
        only_if_absent: bool,
    ) -> Option<Arc<V>> {
        let result = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let now = self.settings.ticker.read();
            self.pre_write_cleanup_locked(core, now);

            if self.count.load(Ordering::Relaxed) + 1 > core.threshold {
                self.expand_locked(core);
            }

            match self.find_index(&key, hash) {
                Some(index) => {
                    let entry = self.slot(index);
                    let (current, active, weight, stored_key) = {
                        let holder = entry.holder().expect("live entry has a holder");
                        (
                            holder.value(),
                            holder.is_active(),
                            holder.weight(),
                            entry.key(),
                        )
                    };

                    match current {
                        None => {
                            self.mod_count.fetch_add(1, Ordering::Release);
                            if active {
                                self.emit_removal(stored_key, None, weight, RemovalCause::Collected);
                            } else {
                                self.count_add(1);
                            }
                            self.set_value_locked(core, index, &key, Arc::clone(&value), now);
                            self.evict_entries_locked(core, Some(index));
                            None
                        },
                        Some(previous) if only_if_absent => {
                            self.record_locked_read(core, index, now);
                            Some(previous)
                        },
                        Some(previous) => {
                            self.mod_count.fetch_add(1, Ordering::Release);
                            self.emit_removal(
                                stored_key,
                                Some(Arc::clone(&previous)),
                                weight,
                                RemovalCause::Replaced,
                            );
                            self.set_value_locked(core, index, &key, Arc::clone(&value), now);
                            self.evict_entries_locked(core, Some(index));
                            Some(previous)
                        },
                    }
                },
                None => {
                    self.mod_count.fetch_add(1, Ordering::Release);
                    let index = self.install_value_entry_locked(core, key, hash, value, now);
                    self.count_add(1);
                    self.evict_entries_locked(core, Some(index));
                    None
                },
            }
        };
        self.settings.bus.drain();
        result
    }

    pub(crate) fn replace(&self, key: &K, hash: u32, value: Arc<V>) -> Option<Arc<V>> {
        let result = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let now = self.settings.ticker.read();
            self.pre_write_cleanup_locked(core, now);

            match self.find_index(key, hash) {
                Some(index) => {
                    let entry = self.slot(index);
                    let (current, active, loading, weight, stored_key) = {
                        let holder = entry.holder().expect("live entry has a holder");
                        (
                            holder.value(),
                            holder.is_active(),
                            holder.is_loading(),
                            holder.weight(),
                            entry.key(),
                        )
                    };

                    match current {
                        None => {
                            // A live-less active entry is partially collected.
                            if active && !loading {
                                self.remove_entry_locked(core, index, RemovalCause::Collected);
                            }
                            None
                        },
                        Some(previous) => {
                            self.mod_count.fetch_add(1, Ordering::Release);
                            self.emit_removal(
                                stored_key,
                                Some(Arc::clone(&previous)),
                                weight,
                                RemovalCause::Replaced,
                            );
                            self.set_value_locked(core, index, key, value, now);
                            self.evict_entries_locked(core, Some(index));
                            Some(previous)
                        },
                    }
                },
                None => None,
            }
        };
        self.settings.bus.drain();
        result
    }

    pub(crate) fn replace_expected(&self, key: &K, hash: u32, expected: &V, value: Arc<V>) -> bool
    where
        V: PartialEq,
    {
        let result = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let now = self.settings.ticker.read();
            self.pre_write_cleanup_locked(core, now);

            match self.find_index(key, hash) {
                Some(index) => {
                    let entry = self.slot(index);
                    let (current, active, loading, weight, stored_key) = {
                        let holder = entry.holder().expect("live entry has a holder");
                        (
                            holder.value(),
                            holder.is_active(),
                            holder.is_loading(),
                            holder.weight(),
                            entry.key(),
                        )
                    };

                    match current {
                        None => {
                            if active && !loading {
                                self.remove_entry_locked(core, index, RemovalCause::Collected);
                            }
                            false
                        },
                        Some(previous) if *previous == *expected => {
                            self.mod_count.fetch_add(1, Ordering::Release);
                            self.emit_removal(
                                stored_key,
                                Some(previous),
                                weight,
                                RemovalCause::Replaced,
                            );
                            self.set_value_locked(core, index, key, value, now);
                            self.evict_entries_locked(core, Some(index));
                            true
                        },
                        Some(_) => {
                            self.record_locked_read(core, index, now);
                            false
                        },
                    }
                },
                None => false,
            }
        };
        self.settings.bus.drain();
        result
    }

    pub(crate) fn remove(&self, key: &K, hash: u32) -> Option<Arc<V>> {
        let result = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let now = self.settings.ticker.read();
            self.pre_write_cleanup_locked(core, now);

            match self.find_index(key, hash) {
                Some(index) => {
                    let entry = self.slot(index);
                    let (current, active) = {
                        let holder = entry.holder().expect("live entry has a holder");
                        (holder.value(), holder.is_active())
                    };

                    let cause = match (&current, active) {
                        (Some(_), _) => Some(RemovalCause::Explicit),
                        (None, true) => Some(RemovalCause::Collected),
                        // Currently loading with no prior value.
                        (None, false) => None,
                    };
                    match cause {
                        Some(cause) => {
                            self.remove_entry_locked(core, index, cause);
                            current
                        },
                        None => None,
                    }
                },
                None => None,
            }
        };
        self.settings.bus.drain();
        result
    }

    pub(crate) fn remove_expected(&self, key: &K, hash: u32, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let result = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let now = self.settings.ticker.read();
            self.pre_write_cleanup_locked(core, now);

            match self.find_index(key, hash) {
                Some(index) => {
                    let entry = self.slot(index);
                    let (current, active) = {
                        let holder = entry.holder().expect("live entry has a holder");
                        (holder.value(), holder.is_active())
                    };

                    let cause = match &current {
                        Some(value) if **value == *expected => Some(RemovalCause::Explicit),
                        None if active => Some(RemovalCause::Collected),
                        _ => None,
                    };
                    match cause {
                        Some(cause) => {
                            self.remove_entry_locked(core, index, cause);
                            cause == RemovalCause::Explicit
                        },
                        None => false,
                    }
                },
                None => false,
            }
        };
        self.settings.bus.drain();
        result
    }

    pub(crate) fn clear(&self) {
        if self.count() == 0 {
            return;
        }
        {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let table = self.table_ref();

            // Loading placeholders aren't really in the map yet; only
            // active entries produce notifications.
            for cell_index in 0..table.len() {
                let cell = table.at(cell_index);
                let mut index = cell.load(Ordering::Relaxed);
                while index != NIL {
                    let entry = self.slot(index);
                    let next = entry.next();
                    if let Some(holder) = entry.holder() {
                        if holder.is_active() {
                            self.emit_removal(
                                entry.key(),
                                holder.value(),
                                holder.weight(),
                                RemovalCause::Explicit,
                            );
                        }
                    }
                    self.retire_slot_locked(core, index);
                    index = next;
                }
                cell.store(NIL, Ordering::Release);
            }

            core.access_queue.clear();
            core.write_queue.clear();
            self.total_weight.store(0, Ordering::Release);
            self.recency.drain(|_| {});
            self.key_reclaim.discard_all();
            self.value_reclaim.discard_all();
            while self.pending_refresh.pop().is_some() {}
            self.read_count.store(0, Ordering::Relaxed);
            self.mod_count.fetch_add(1, Ordering::Release);
            self.count.store(0, Ordering::Release);
        }
        self.settings.bus.drain();
    }

    // -- loading -----------------------------------------------------------

    /// Returns the cached value or loads it, guaranteeing at most one
    /// in-flight load per key.
    pub(crate) fn get_or_load(
        &self,
        key: &Arc<K>,
        hash: u32,
        loader: &dyn CacheLoader<K, V>,
    ) -> Result<Arc<V>, LoadError> {
        let result = self.get_or_load_inner(key, hash, loader);
        self.post_read_cleanup();
        result
    }

    fn get_or_load_inner(
        &self,
        key: &Arc<K>,
        hash: u32,
        loader: &dyn CacheLoader<K, V>,
    ) -> Result<Arc<V>, LoadError> {
        if self.count() != 0 {
            let now = self.settings.ticker.read();
            enum Fast<V> {
                Hit(Arc<V>, bool),
                Wait(EntryId, Arc<LoadShared<V>>),
                FinishRefresh,
                Slow,
            }

            let fast = {
                let _pin = self.pin();
                match self.find_index(key, hash) {
                    Some(index) => {
                        let entry = self.slot(index);
                        match entry.holder() {
                            None => Fast::Slow,
                            Some(holder) => {
                                let live = holder
                                    .value()
                                    .filter(|_| !self.settings.is_expired(entry, now));
                                if let Some(value) = live {
                                    if self.settings.records_access_time() {
                                        entry.set_access_time(now);
                                    }
                                    if self.settings.uses_access_queue() && entry.is_live() {
                                        self.recency.push(EntryId::new(index, entry.gen()));
                                    }
                                    self.stats.record_hits(1);
                                    let refresh = self.settings.refreshes()
                                        && !holder.is_loading()
                                        && now.saturating_sub(entry.write_time())
                                            > self.settings.refresh_interval;
                                    Fast::Hit(value, refresh)
                                } else if let Some(shared) = holder.loading_shared() {
                                    if shared.background_finished() {
                                        Fast::FinishRefresh
                                    } else {
                                        Fast::Wait(
                                            EntryId::new(index, entry.gen()),
                                            Arc::clone(shared),
                                        )
                                    }
                                } else {
                                    Fast::Slow
                                }
                            },
                        }
                    },
                    None => Fast::Slow,
                }
            };

            match fast {
                Fast::Hit(value, false) => return Ok(value),
                Fast::Hit(value, true) => {
                    return Ok(self.refresh(key, hash, loader, true).unwrap_or(value));
                },
                Fast::Wait(id, shared) => return self.wait_for_loading(key, hash, id, shared),
                Fast::FinishRefresh => self.complete_background(key, hash),
                Fast::Slow => {},
            }
        }

        self.locked_get_or_load(key, hash, loader)
    }

    fn locked_get_or_load(
        &self,
        key: &Arc<K>,
        hash: u32,
        loader: &dyn CacheLoader<K, V>,
    ) -> Result<Arc<V>, LoadError> {
        let outcome = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let now = self.settings.ticker.read();
            self.pre_write_cleanup_locked(core, now);

            let mut reuse: Option<u32> = None;
            let mut resolved: Option<LoadOutcome<V>> = None;

            if let Some(index) = self.find_index(key, hash) {
                let entry = self.slot(index);
                let (value, weight, stored_key, loading) = {
                    let holder = entry.holder().expect("live entry has a holder");
                    (
                        holder.value(),
                        holder.weight(),
                        entry.key(),
                        holder.loading_shared().cloned(),
                    )
                };
                let expired = self.settings.is_expired(entry, now);

                if let Some(shared) = loading {
                    resolved = Some(LoadOutcome::Wait(self.live_id(index), shared));
                } else {
                    match value {
                        Some(value) if !expired => {
                            self.record_locked_read(core, index, now);
                            self.stats.record_hits(1);
                            resolved = Some(LoadOutcome::Hit(value));
                        },
                        other => {
                            // Collected or expired; reuse the slot for the
                            // fresh load.
                            let cause = if other.is_none() {
                                RemovalCause::Collected
                            } else {
                                RemovalCause::Expired
                            };
                            self.mod_count.fetch_add(1, Ordering::Release);
                            self.emit_removal(stored_key, other, weight, cause);
                            core.write_queue.unlink(&self.bank, index);
                            core.access_queue.unlink(&self.bank, index);
                            self.count_sub(1);
                            reuse = Some(index);
                        },
                    }
                }
            }

            match resolved {
                Some(outcome) => outcome,
                None => {
                    let shared = Arc::new(LoadShared::new(now));
                    let loading = Arc::new(ValueHolder::Loading {
                        old: Arc::new(ValueHolder::Unset),
                        shared: Arc::clone(&shared),
                    });
                    match reuse {
                        Some(index) => {
                            if let Some(previous) = self.slot(index).swap_holder(loading) {
                                core.limbo_holders.push(previous);
                            }
                        },
                        None => {
                            self.install_entry_locked(core, Arc::clone(key), hash, loading);
                        },
                    }
                    LoadOutcome::Installed(shared)
                },
            }
        };
        self.settings.bus.drain();

        match outcome {
            LoadOutcome::Hit(value) => Ok(value),
            LoadOutcome::Wait(id, shared) => self.wait_for_loading(key, hash, id, shared),
            LoadOutcome::Installed(shared) => self.run_load(key, hash, &shared, loader),
        }
    }

    /// Joins an adopted background reload and installs its outcome.
    fn adopt_background(
        &self,
        key: &Arc<K>,
        hash: u32,
        shared: &Arc<LoadShared<V>>,
        handle: JoinHandle<Result<Option<V>, DynError>>,
    ) {
        let outcome = match handle.join() {
            Ok(Ok(Some(value))) => Ok(Arc::new(value)),
            Ok(Ok(None)) => Err(LoadError::invalid("reload produced no value")),
            Ok(Err(source)) => Err(LoadError::failed(source)),
            Err(_) => Err(LoadError::Panicked),
        };
        let elapsed = self
            .settings
            .ticker
            .read()
            .saturating_sub(shared.started_at());

        match outcome {
            Ok(value) => {
                self.stats.record_load_success(elapsed);
                shared.publish(Ok(Arc::clone(&value)));
                self.store_loaded_value(key, hash, shared, value);
            },
            Err(error) => {
                self.stats.record_load_failure(elapsed);
                warn!("adopted refresh load failed; keeping old value: {error}");
                shared.publish(Err(error));
                self.remove_loading_value(key, hash, shared);
            },
        }
    }

    /// Runs the loader outside the lock and publishes the outcome to every
    /// waiter before installing it.
    fn run_load(
        &self,
        key: &Arc<K>,
        hash: u32,
        shared: &Arc<LoadShared<V>>,
        loader: &dyn CacheLoader<K, V>,
    ) -> Result<Arc<V>, LoadError> {
        let load_result = catch_unwind(AssertUnwindSafe(|| loader.load(key)));
        let elapsed = self
            .settings
            .ticker
            .read()
            .saturating_sub(shared.started_at());

        let (outcome, panic_payload) = match load_result {
            Ok(Ok(Some(value))) => (Ok(Arc::new(value)), None),
            Ok(Ok(None)) => (
                Err(LoadError::invalid("loader returned no value for key")),
                None,
            ),
            Ok(Err(source)) => (Err(LoadError::failed(source)), None),
            Err(payload) => (Err(LoadError::Panicked), Some(payload)),
        };

        let result = match outcome {
            Ok(value) => {
                self.stats.record_load_success(elapsed);
                shared.publish(Ok(Arc::clone(&value)));
                self.store_loaded_value(key, hash, shared, Arc::clone(&value));
                Ok(value)
            },
            Err(error) => {
                self.stats.record_load_failure(elapsed);
                shared.publish(Err(error.clone()));
                self.remove_loading_value(key, hash, shared);
                Err(error)
            },
        };
        self.stats.record_misses(1);

        if let Some(payload) = panic_payload {
            resume_unwind(payload);
        }
        result
    }

    /// Blocks on another caller's in-flight load.
    ///
    /// A backgrounded reload is adopted: this waiter joins the reload
    /// thread and installs its result, so completion never depends on
    /// further cache traffic.
    fn wait_for_loading(
        &self,
        key: &Arc<K>,
        hash: u32,
        id: EntryId,
        shared: Arc<LoadShared<V>>,
    ) -> Result<Arc<V>, LoadError> {
        if let Some(handle) = shared.take_background() {
            self.adopt_background(key, hash, &shared, handle);
        }
        let result = shared.wait();
        if result.is_ok() {
            // Re-read the clock now that loading has completed.
            let now = self.settings.ticker.read();
            let _pin = self.pin();
            if let Some(entry) = self.entry_if_current(id) {
                if self.settings.records_access_time() {
                    entry.set_access_time(now);
                }
                if self.settings.uses_access_queue() {
                    self.recency.push(id);
                }
            }
        }
        self.stats.record_misses(1);
        result
    }

    /// Installs a loaded value if our loading placeholder is still current.
    ///
    /// Returns `false` when a concurrent writer clobbered the placeholder;
    /// the loaded value is dropped and emitted as `Replaced`.
    pub(crate) fn store_loaded_value(
        &self,
        key: &Arc<K>,
        hash: u32,
        installed: &Arc<LoadShared<V>>,
        value: Arc<V>,
    ) -> bool {
        let stored = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let now = self.settings.ticker.read();
            self.pre_write_cleanup_locked(core, now);

            if self.count.load(Ordering::Relaxed) + 1 > core.threshold {
                self.expand_locked(core);
            }

            match self.find_index(key, hash) {
                Some(index) => {
                    let entry = self.slot(index);
                    let (identity, current_value, current_active, current_weight, unset) = {
                        let holder = entry.holder().expect("live entry has a holder");
                        (
                            holder
                                .loading_shared()
                                .is_some_and(|shared| Arc::ptr_eq(shared, installed)),
                            holder.value(),
                            holder.is_active(),
                            holder.weight(),
                            matches!(holder, ValueHolder::Unset),
                        )
                    };

                    if identity {
                        self.store_loaded_locked(core, index, key, value, now);
                        true
                    } else if current_value.is_none() && !unset {
                        // Our placeholder is gone but the slot holds no live
                        // value; take it over like a put-if-absent.
                        self.mod_count.fetch_add(1, Ordering::Release);
                        if current_active {
                            self.emit_removal(
                                entry.key(),
                                None,
                                current_weight,
                                RemovalCause::Collected,
                            );
                        } else {
                            self.count_add(1);
                        }
                        self.set_value_locked(core, index, key, value, now);
                        self.evict_entries_locked(core, Some(index));
                        true
                    } else {
                        // The loaded value was already clobbered.
                        self.emit_removal(
                            Some(Arc::clone(key)),
                            Some(value),
                            0,
                            RemovalCause::Replaced,
                        );
                        false
                    }
                },
                None => {
                    self.mod_count.fetch_add(1, Ordering::Release);
                    let index =
                        self.install_value_entry_locked(core, Arc::clone(key), hash, value, now);
                    self.count_add(1);
                    self.evict_entries_locked(core, Some(index));
                    true
                },
            }
        };
        self.settings.bus.drain();
        stored
    }

    /// Installs a loaded value into the entry whose holder is known (under
    /// the held lock) to be our loading placeholder.
    fn store_loaded_locked(
        &self,
        core: &mut StripeCore<V>,
        index: u32,
        key: &K,
        value: Arc<V>,
        now: u64,
    ) {
        if self.count.load(Ordering::Relaxed) + 1 > core.threshold {
            self.expand_locked(core);
        }
        self.mod_count.fetch_add(1, Ordering::Release);

        let entry = self.slot(index);
        let (old_active, old_value, old_weight, stored_key) = {
            let holder = entry.holder().expect("loading entry has a holder");
            match holder {
                ValueHolder::Loading { old, .. } => {
                    (old.is_active(), old.value(), old.weight(), entry.key())
                },
                _ => panic!("store_loaded_locked requires a loading holder"),
            }
        };

        if old_active {
            let cause = if old_value.is_none() {
                RemovalCause::Collected
            } else {
                RemovalCause::Replaced
            };
            self.emit_removal(stored_key, old_value, old_weight, cause);
        } else {
            self.count_add(1);
        }
        self.set_value_locked(core, index, key, value, now);
        self.evict_entries_locked(core, Some(index));
    }

    /// Unwinds a failed load: restore the prior value if there was one,
    /// otherwise drop the placeholder entry.
    fn remove_loading_value(&self, key: &K, hash: u32, installed: &Arc<LoadShared<V>>) {
        {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            if let Some(index) = self.find_index(key, hash) {
                let entry = self.slot(index);
                let ours = {
                    let holder = entry.holder().expect("live entry has a holder");
                    match holder {
                        ValueHolder::Loading { old, shared } if Arc::ptr_eq(shared, installed) => {
                            Some((old.is_active(), Arc::clone(old)))
                        },
                        _ => None,
                    }
                };
                if let Some((active, old)) = ours {
                    if active {
                        if let Some(previous) = entry.swap_holder(old) {
                            core.limbo_holders.push(previous);
                        }
                    } else {
                        self.unlink_from_chain(index);
                        self.retire_slot_locked(core, index);
                    }
                }
            }
        }
        self.settings.bus.drain();
    }

    // -- refresh-ahead -----------------------------------------------------

    /// Swaps in a loading placeholder that preserves the old value, then
    /// runs the loader's reload. Never raises; failures are logged and the
    /// old value stays visible.
    ///
    /// With `check_time` the refresh is a no-op unless the entry is still
    /// past its refresh deadline once the lock is held.
    pub(crate) fn refresh(
        &self,
        key: &Arc<K>,
        hash: u32,
        loader: &dyn CacheLoader<K, V>,
        check_time: bool,
    ) -> Option<Arc<V>> {
        let (id, shared, old_value) = self.insert_loading(key, hash, check_time)?;

        if let Some(old) = old_value {
            let reload = catch_unwind(AssertUnwindSafe(|| loader.reload(key, old)));
            match reload {
                Ok(Reload::Ready(result)) => self.finish_refresh(key, hash, &shared, Ok(result)),
                Ok(Reload::Background(handle)) => {
                    shared.set_background(handle);
                    self.pending_refresh.push(id);
                    None
                },
                Err(_) => self.finish_refresh(key, hash, &shared, Err(())),
            }
        } else {
            let loaded = catch_unwind(AssertUnwindSafe(|| loader.load(key)));
            self.finish_refresh(key, hash, &shared, loaded.map_err(|_| ()))
        }
    }

    /// Publishes a synchronously completed reload and installs it.
    fn finish_refresh(
        &self,
        key: &Arc<K>,
        hash: u32,
        shared: &Arc<LoadShared<V>>,
        result: Result<Result<Option<V>, DynError>, ()>,
    ) -> Option<Arc<V>> {
        let elapsed = self
            .settings
            .ticker
            .read()
            .saturating_sub(shared.started_at());
        let outcome = match result {
            Ok(Ok(Some(value))) => Ok(Arc::new(value)),
            Ok(Ok(None)) => Err(LoadError::invalid("reload produced no value")),
            Ok(Err(source)) => Err(LoadError::failed(source)),
            Err(()) => Err(LoadError::Panicked),
        };

        match outcome {
            Ok(value) => {
                self.stats.record_load_success(elapsed);
                shared.publish(Ok(Arc::clone(&value)));
                self.store_loaded_value(key, hash, shared, Arc::clone(&value));
                Some(value)
            },
            Err(error) => {
                self.stats.record_load_failure(elapsed);
                warn!("refresh load failed; keeping old value: {error}");
                shared.publish(Err(error));
                self.remove_loading_value(key, hash, shared);
                None
            },
        }
    }

    /// Atomically swaps a loading placeholder over the current holder,
    /// creating a fresh placeholder entry when the key is absent.
    ///
    /// Returns `None` when a load is already pending or (with `check_time`)
    /// the entry is no longer due for refresh.
    #[allow(clippy::type_complexity)]
    fn insert_loading(
        &self,
        key: &Arc<K>,
        hash: u32,
        check_time: bool,
    ) -> Option<(EntryId, Arc<LoadShared<V>>, Option<Arc<V>>)> {
        let result = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let now = self.settings.ticker.read();
            self.pre_write_cleanup_locked(core, now);

            match self.find_index(key, hash) {
                Some(index) => {
                    let entry = self.slot(index);
                    let loading = entry.holder().is_some_and(ValueHolder::is_loading);
                    if loading
                        || (check_time
                            && now.saturating_sub(entry.write_time())
                                < self.settings.refresh_interval)
                    {
                        None
                    } else {
                        self.mod_count.fetch_add(1, Ordering::Release);
                        let shared = Arc::new(LoadShared::new(now));
                        let old = entry.share_holder().expect("live entry has a holder");
                        let old_value = old.value();
                        let holder = Arc::new(ValueHolder::Loading {
                            old,
                            shared: Arc::clone(&shared),
                        });
                        if let Some(previous) = entry.swap_holder(holder) {
                            core.limbo_holders.push(previous);
                        }
                        Some((self.live_id(index), shared, old_value))
                    }
                },
                None => {
                    self.mod_count.fetch_add(1, Ordering::Release);
                    let shared = Arc::new(LoadShared::new(now));
                    let loading = Arc::new(ValueHolder::Loading {
                        old: Arc::new(ValueHolder::Unset),
                        shared: Arc::clone(&shared),
                    });
                    let index = self.install_entry_locked(core, Arc::clone(key), hash, loading);
                    Some((self.live_id(index), shared, None))
                },
            }
        };
        self.settings.bus.drain();
        result
    }

    // -- refresh completion ------------------------------------------------

    /// Completes a finished backgrounded reload discovered on the read path.
    fn complete_background(&self, key: &K, hash: u32) {
        {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            if let Some(index) = self.find_index(key, hash) {
                let shared = self
                    .slot(index)
                    .holder()
                    .and_then(|holder| holder.loading_shared().cloned());
                if let Some(shared) = shared {
                    if let Some(handle) = shared.take_finished_background() {
                        self.apply_background_outcome_locked(core, index, &shared, handle);
                    }
                }
            }
        }
        self.settings.bus.drain();
    }

    /// Joins a finished reload thread and installs or discards its result.
    fn apply_background_outcome_locked(
        &self,
        core: &mut StripeCore<V>,
        index: u32,
        shared: &Arc<LoadShared<V>>,
        handle: JoinHandle<Result<Option<V>, DynError>>,
    ) {
        let now = self.settings.ticker.read();
        let elapsed = now.saturating_sub(shared.started_at());
        let outcome = match handle.join() {
            Ok(Ok(Some(value))) => Ok(Arc::new(value)),
            Ok(Ok(None)) => Err(LoadError::invalid("reload produced no value")),
            Ok(Err(source)) => Err(LoadError::failed(source)),
            Err(_) => Err(LoadError::Panicked),
        };

        let key = self.slot(index).key();
        match (outcome, key) {
            (Ok(value), Some(key)) => {
                self.stats.record_load_success(elapsed);
                shared.publish(Ok(Arc::clone(&value)));
                self.store_loaded_locked(core, index, &key, value, now);
            },
            (Ok(_), None) => {
                // The weak key died while the reload ran.
                self.stats.record_load_failure(elapsed);
                shared.publish(Err(LoadError::invalid("key reclaimed during reload")));
                self.discard_loading_locked(core, index);
            },
            (Err(error), _) => {
                self.stats.record_load_failure(elapsed);
                warn!("background refresh failed; keeping old value: {error}");
                shared.publish(Err(error));
                self.discard_loading_locked(core, index);
            },
        }
    }

    /// Restores the prior value of a loading entry, or unchains it when
    /// there is none.
    fn discard_loading_locked(&self, core: &mut StripeCore<V>, index: u32) {
        let entry = self.slot(index);
        if !entry.is_live() {
            return;
        }
        let ours = {
            match entry.holder() {
                Some(ValueHolder::Loading { old, .. }) => Some((old.is_active(), Arc::clone(old))),
                _ => None,
            }
        };
        let Some((active, old)) = ours else {
            return;
        };
        if active {
            if let Some(previous) = entry.swap_holder(old) {
                core.limbo_holders.push(previous);
            }
        } else {
            self.unlink_from_chain(index);
            self.retire_slot_locked(core, index);
        }
    }

    // -- maintenance -------------------------------------------------------

    fn post_read_cleanup(&self) {
        if (self.read_count.fetch_add(1, Ordering::Relaxed) + 1) & READ_DRAIN_MASK == 0 {
            self.clean_up();
        }
    }

    /// One full cleanup round: locked maintenance (if the lock is free)
    /// plus notification delivery.
    pub(crate) fn clean_up(&self) {
        let now = self.settings.ticker.read();
        self.try_locked_cleanup(now);
        self.settings.bus.drain();
    }

    fn try_locked_cleanup(&self, now: u64) {
        if let Some(mut guard) = self.core.try_lock() {
            let core = &mut *guard;
            self.locked_cleanup(core, now);
        }
    }

    /// Unconditional cleanup under the already-held stripe lock.
    fn pre_write_cleanup_locked(&self, core: &mut StripeCore<V>, now: u64) {
        self.locked_cleanup(core, now);
    }

    fn locked_cleanup(&self, core: &mut StripeCore<V>, now: u64) {
        self.drain_reclaim_locked(core);
        self.expire_entries_locked(core, now);
        self.complete_pending_locked(core);
        self.try_reap_locked(core);
        self.read_count.store(0, Ordering::Relaxed);
    }

    fn drain_reclaim_locked(&self, core: &mut StripeCore<V>) {
        if self.settings.weak_keys() {
            self.key_reclaim.drain_bounded(|id| {
                let dead = self
                    .entry_if_current(id)
                    .is_some_and(|entry| entry.key().is_none());
                if dead {
                    self.remove_entry_locked(core, id.index(), RemovalCause::Collected);
                }
            });
        }
        if self.settings.weak_values {
            self.value_reclaim.drain_bounded(|id| {
                let dead = self.entry_if_current(id).is_some_and(|entry| {
                    entry.holder().is_some_and(|holder| {
                        holder.is_active() && !holder.is_loading() && holder.value().is_none()
                    })
                });
                if dead {
                    self.remove_entry_locked(core, id.index(), RemovalCause::Collected);
                }
            });
        }
    }

    fn expire_entries_locked(&self, core: &mut StripeCore<V>, now: u64) {
        self.drain_recency_locked(core);
        if !self.settings.expires() {
            return;
        }

        while let Some(index) = core.write_queue.front() {
            if !self.settings.is_expired(self.slot(index), now) {
                break;
            }
            if !self.remove_entry_locked(core, index, RemovalCause::Expired) {
                panic!("write queue head claims an entry that is not present");
            }
        }
        while let Some(index) = core.access_queue.front() {
            if !self.settings.is_expired(self.slot(index), now) {
                break;
            }
            if !self.remove_entry_locked(core, index, RemovalCause::Expired) {
                panic!("access queue head claims an entry that is not present");
            }
        }
    }

    /// Replays staged reads as access-queue move-to-tail operations. An
    /// entry evicted since it was staged is dropped.
    fn drain_recency_locked(&self, core: &mut StripeCore<V>) {
        self.recency.drain(|id| {
            let Some(entry) = self.entry_if_current(id) else {
                return;
            };
            let index = id.index();
            if core.access_queue.contains(entry, index) {
                core.access_queue.push_back(&self.bank, index);
            }
        });
    }

    fn complete_pending_locked(&self, core: &mut StripeCore<V>) {
        let mut requeue = Vec::new();
        while let Some(id) = self.pending_refresh.pop() {
            let shared = match self
                .entry_if_current(id)
                .and_then(|entry| entry.holder().and_then(|h| h.loading_shared().cloned()))
            {
                Some(shared) => shared,
                None => continue,
            };
            match shared.take_finished_background() {
                Some(handle) => {
                    self.apply_background_outcome_locked(core, id.index(), &shared, handle)
                },
                None => requeue.push(id),
            }
        }
        for id in requeue {
            self.pending_refresh.push(id);
        }
    }

    /// Reclaims limbo once no reader is pinned.
    ///
    /// The fence pairs with the one in `pin`: if the counter reads zero
    /// here, every reader that pins afterwards observes the unlinks that
    /// preceded this point (they happened under earlier lock sections),
    /// so nothing in limbo is reachable any more.
    fn try_reap_locked(&self, core: &mut StripeCore<V>) {
        if core.limbo_slots.is_empty()
            && core.limbo_holders.is_empty()
            && core.limbo_tables.is_empty()
        {
            return;
        }
        fence(Ordering::SeqCst);
        if self.readers.load(Ordering::SeqCst) != 0 {
            return;
        }

        for index in core.limbo_slots.drain(..) {
            self.bank.get(index).clear();
            core.free.push(index);
        }
        core.limbo_holders.clear();
        for table in core.limbo_tables.drain(..) {
            // SAFETY: no reader can reference a superseded table past
            // quiescence; this is the last owner.
            drop(unsafe { Box::from_raw(table.0) });
        }
    }

    // -- eviction ----------------------------------------------------------

    /// Weight-based approximation: if the newly written entry alone busts
    /// the cap, remove just it; otherwise evict from the LRU end of the
    /// access queue, skipping zero-weight holders.
    fn evict_entries_locked(&self, core: &mut StripeCore<V>, newest: Option<u32>) {
        let Some(max_weight) = self.max_weight else {
            return;
        };
        self.drain_recency_locked(core);

        if let Some(index) = newest {
            let entry = self.slot(index);
            let too_heavy =
                entry.is_live() && entry.holder().is_some_and(|holder| holder.weight() > max_weight);
            if too_heavy && !self.remove_entry_locked(core, index, RemovalCause::Size) {
                panic!("newly written entry missing during eviction");
            }
        }

        while self.total_weight.load(Ordering::Relaxed) > max_weight {
            match self.next_evictable(core) {
                Some(index) => {
                    if !self.remove_entry_locked(core, index, RemovalCause::Size) {
                        panic!("eviction queue head claims an entry that is not present");
                    }
                },
                None => panic!("weight over cap but no evictable entry found"),
            }
        }
    }

    fn next_evictable(&self, core: &StripeCore<V>) -> Option<u32> {
        core.access_queue
            .iter_indices(&self.bank)
            .find(|&index| self.slot(index).holder().is_some_and(|holder| holder.weight() > 0))
    }

    // -- entry plumbing ----------------------------------------------------

    fn alloc_slot_locked(&self, core: &mut StripeCore<V>) -> u32 {
        match core.free.pop() {
            Some(index) => index,
            None => {
                let index = core.allocated;
                core.allocated += 1;
                self.bank.ensure(index);
                index
            },
        }
    }

    /// Initializes a fresh entry with `holder` and publishes it at the
    /// head of its bucket chain.
    fn install_entry_locked(
        &self,
        core: &mut StripeCore<V>,
        key: Arc<K>,
        hash: u32,
        holder: Arc<ValueHolder<V>>,
    ) -> u32 {
        let index = self.alloc_slot_locked(core);
        let table = self.table_ref();
        let cell = table.cell(hash);
        let head = cell.load(Ordering::Relaxed);
        self.slot(index).init(
            index,
            KeyRef::new(key, self.settings.weak_keys()),
            hash,
            head,
            holder,
        );
        cell.store(index, Ordering::Release);
        index
    }

    /// Installs a fresh entry carrying a landed value.
    fn install_value_entry_locked(
        &self,
        core: &mut StripeCore<V>,
        key: Arc<K>,
        hash: u32,
        value: Arc<V>,
        now: u64,
    ) -> u32 {
        let weight = (self.settings.weigher)(&*key, &value);
        let holder = Arc::new(ValueHolder::for_value(
            value,
            weight,
            self.settings.weak_values,
        ));
        let index = self.install_entry_locked(core, key, hash, holder);
        self.record_write_locked(core, index, weight, now);
        index
    }

    /// Installs a landed value: weigh it, swap the holder (completing any
    /// clobbered load with the new value), and record the write.
    fn set_value_locked(
        &self,
        core: &mut StripeCore<V>,
        index: u32,
        key: &K,
        value: Arc<V>,
        now: u64,
    ) {
        let weight = (self.settings.weigher)(key, &value);
        let holder = Arc::new(ValueHolder::for_value(
            Arc::clone(&value),
            weight,
            self.settings.weak_values,
        ));

        if let Some(previous) = self.slot(index).swap_holder(holder) {
            if let ValueHolder::Loading { shared, .. } = &*previous {
                // The pending load was clobbered; unblock its waiters with
                // the new value.
                shared.publish(Ok(Arc::clone(&value)));
            }
            core.limbo_holders.push(previous);
        }

        self.record_write_locked(core, index, weight, now);
    }

    fn record_write_locked(&self, core: &mut StripeCore<V>, index: u32, weight: u64, now: u64) {
        self.drain_recency_locked(core);
        self.weight_add(weight);

        let entry = self.slot(index);
        if self.settings.records_access_time() {
            entry.set_access_time(now);
        }
        if self.settings.records_write_time() {
            entry.set_write_time(now);
        }
        if self.settings.uses_access_queue() {
            core.access_queue.push_back(&self.bank, index);
        }
        if self.settings.uses_write_queue() {
            core.write_queue.push_back(&self.bank, index);
        }
    }

    /// Access bookkeeping for hits observed while already holding the lock.
    fn record_locked_read(&self, core: &mut StripeCore<V>, index: u32, now: u64) {
        let entry = self.slot(index);
        if self.settings.records_access_time() {
            entry.set_access_time(now);
        }
        if self.settings.uses_access_queue() {
            core.access_queue.push_back(&self.bank, index);
        }
    }

    /// Accounts a removal and offers the notification; runs under the
    /// stripe lock.
    fn emit_removal(
        &self,
        key: Option<Arc<K>>,
        value: Option<Arc<V>>,
        weight: u64,
        cause: RemovalCause,
    ) {
        self.weight_sub(weight);
        if cause.was_evicted() {
            self.stats.record_eviction();
        }
        if self.settings.bus.is_listening() {
            self.settings.bus.offer(RemovalNotification { key, value, cause });
        }
    }

    /// Removes an entry with the given cause, emitting exactly one
    /// notification. A loading entry keeps its chain slot (the load is
    /// still coordinating waiters) but loses its old value and ordering.
    fn remove_entry_locked(
        &self,
        core: &mut StripeCore<V>,
        index: u32,
        cause: RemovalCause,
    ) -> bool {
        let entry = self.slot(index);
        if !entry.is_live() {
            return false;
        }
        let key = entry.key();
        let (value, weight, loading) = {
            let holder = entry.holder().expect("live entry has a holder");
            (
                holder.value(),
                holder.weight(),
                holder.loading_shared().cloned(),
            )
        };

        self.mod_count.fetch_add(1, Ordering::Release);
        self.emit_removal(key, value, weight, cause);
        core.write_queue.unlink(&self.bank, index);
        core.access_queue.unlink(&self.bank, index);

        match loading {
            Some(shared) => {
                // The load still coordinates waiters; keep the chain slot
                // but drop the stale old value.
                let husk = Arc::new(ValueHolder::Loading {
                    old: Arc::new(ValueHolder::Unset),
                    shared,
                });
                if let Some(previous) = entry.swap_holder(husk) {
                    core.limbo_holders.push(previous);
                }
            },
            None => {
                self.unlink_from_chain(index);
                self.retire_slot_locked(core, index);
            },
        }
        self.count_sub(1);
        true
    }

    fn retire_slot_locked(&self, core: &mut StripeCore<V>, index: u32) {
        self.slot(index).retire();
        core.limbo_slots.push(index);
    }

    /// Splices an entry out of its bucket chain in place. The retired
    /// entry's own link is left intact so pinned readers standing on it
    /// still reach the rest of the chain.
    fn unlink_from_chain(&self, index: u32) {
        let entry = self.slot(index);
        let (hash, next) = (entry.hash(), entry.next());
        let table = self.table_ref();
        let cell = table.cell(hash);

        if cell.load(Ordering::Relaxed) == index {
            cell.store(next, Ordering::Release);
            return;
        }
        let mut cursor = cell.load(Ordering::Relaxed);
        while cursor != NIL {
            let node = self.slot(cursor);
            if node.next() == index {
                node.set_next(next);
                return;
            }
            cursor = node.next();
        }
        panic!("bucket chain does not contain the entry being removed");
    }

    /// Doubles the bucket table.
    ///
    /// Chains are never rewired in place: the longest chain suffix whose
    /// entries all land in one new bucket is reused as-is, and the prefix
    /// entries are copied to fresh slots (inheriting holder, timestamps,
    /// and queue positions). Originals stay intact for readers still on
    /// the old table, which is retired to limbo.
    fn expand_locked(&self, core: &mut StripeCore<V>) {
        let old = self.table_ref();
        let old_len = old.len();
        if old_len >= MAX_TABLE_BUCKETS {
            return;
        }
        let new_len = old_len * 2;
        let new = Box::new(Table::new(new_len));
        let new_mask = (new_len - 1) as u32;

        for cell_index in 0..old_len {
            let head = old.at(cell_index).load(Ordering::Relaxed);
            if head == NIL {
                continue;
            }

            // Find the longest suffix that maps to a single new bucket.
            let mut suffix_head = head;
            let mut suffix_cell = self.slot(head).hash() & new_mask;
            let mut cursor = self.slot(head).next();
            while cursor != NIL {
                let target = self.slot(cursor).hash() & new_mask;
                if target != suffix_cell {
                    suffix_cell = target;
                    suffix_head = cursor;
                }
                cursor = self.slot(cursor).next();
            }
            new.at(suffix_cell as usize).store(suffix_head, Ordering::Relaxed);

            // Copy the entries ahead of the suffix into their new buckets.
            let mut cursor = head;
            while cursor != suffix_head {
                let next = self.slot(cursor).next();
                let target = (self.slot(cursor).hash() & new_mask) as usize;
                let copy = self.copy_entry_locked(core, cursor, new.at(target).load(Ordering::Relaxed));
                new.at(target).store(copy, Ordering::Relaxed);
                self.retire_slot_locked(core, cursor);
                cursor = next;
            }
        }

        core.threshold = new_len * 3 / 4;
        let previous = self.table.swap(Box::into_raw(new), Ordering::AcqRel);
        core.limbo_tables.push(RetiredTable(previous));
    }

    /// Copies a live entry to a fresh slot for table growth, sharing its
    /// holder and inheriting its queue positions.
    fn copy_entry_locked(&self, core: &mut StripeCore<V>, source: u32, next: u32) -> u32 {
        let index = self.alloc_slot_locked(core);
        let src = self.slot(source);
        let key = src.key_ref().expect("live entry has a key").clone();
        let holder = src.share_holder().expect("live entry has a holder");

        let dst = self.slot(index);
        dst.init(index, key, src.hash(), next, holder);
        dst.set_access_time(src.access_time());
        dst.set_write_time(src.write_time());

        if core.access_queue.contains(src, source) {
            core.access_queue.replace_index(&self.bank, source, index);
        }
        if core.write_queue.contains(src, source) {
            core.write_queue.replace_index(&self.bank, source, index);
        }
        // Keep a pending backgrounded reload completable under its new id.
        if dst.holder().is_some_and(ValueHolder::is_loading) {
            self.pending_refresh.push(self.live_id(index));
        }
        index
    }
}

impl<K, V> Drop for Stripe<K, V> {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        for table in core.limbo_tables.drain(..) {
            // SAFETY: during drop the stripe is the sole owner.
            drop(unsafe { Box::from_raw(table.0) });
        }
        let current = *self.table.get_mut();
        if !current.is_null() {
            // SAFETY: during drop the stripe is the sole owner.
            drop(unsafe { Box::from_raw(current) });
        }
    }
}
