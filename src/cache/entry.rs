//! Entry and value-holder model.
//!
//! One [`Entry`] is a slot in the stripe's bank representing one cached
//! mapping: the key (owned or weakly held), its precomputed 32-bit hash, a
//! singly linked hash-chain index, the value holder, atomic access/write
//! timestamps, and two intrusive link pairs for the access and write
//! ordering queues.
//!
//! Slots are shared with lock-free readers, so every field a reader
//! touches is either atomic or immutable for the slot's current
//! generation:
//!
//! ```text
//!   gen          AtomicU32   odd = live, even = vacant/retired
//!   hash, next   atomic      chain walk
//!   timestamps   atomic      expiration checks, read-path stamping
//!   queue links  atomic      writer-only, never read by readers
//!   key          plain       written only while the slot is unreachable
//!   holder       AtomicPtr   an owned Arc<ValueHolder>, swapped whole
//! ```
//!
//! The value holder is a sum type:
//!
//! ```text
//!   Unset                          fresh entry, no value yet
//!   Strong      { value, weight }  owned value
//!   Reclaimable { value, weight }  weakly held; the runtime may reclaim it
//!   Loading     { old, shared }    load in flight; `old` stays visible
//! ```
//!
//! Holders are immutable once published; every state change swaps in a
//! freshly built holder, and the displaced one stays alive (entry, copy,
//! or stripe limbo) until no reader can still hold a reference to it.
//! A holder is *active* once a real value has been populated: `Unset` and
//! a fresh `Loading` over `Unset` are inactive, while a `Loading` that
//! wraps a prior value (refresh-ahead) stays active and keeps serving it.
//!
//! [`LoadShared`] is the coordination point for at-most-one-load: the
//! installing thread runs the loader and publishes once; every other
//! caller waits on the condvar. The wait is naturally uninterruptible
//! (Rust threads have no interrupts) and fails fast when the waiting
//! thread is the one performing the load.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::ds::{AccessOrder, IndexLinks, WriteOrder, NIL};
use crate::error::{DynError, LoadError};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// A cached key, owned or held through a reclaimable reference.
#[derive(Debug)]
pub(crate) enum KeyRef<K> {
    Strong(Arc<K>),
    Weak(Weak<K>),
}

impl<K> KeyRef<K> {
    pub(crate) fn new(key: Arc<K>, weakly_held: bool) -> Self {
        if weakly_held {
            Self::Weak(Arc::downgrade(&key))
        } else {
            Self::Strong(key)
        }
    }

    /// Returns the key, or `None` when it was weakly held and reclaimed.
    pub(crate) fn get(&self) -> Option<Arc<K>> {
        match self {
            Self::Strong(key) => Some(Arc::clone(key)),
            Self::Weak(key) => key.upgrade(),
        }
    }
}

impl<K> Clone for KeyRef<K> {
    fn clone(&self) -> Self {
        match self {
            Self::Strong(key) => Self::Strong(Arc::clone(key)),
            Self::Weak(key) => Self::Weak(Weak::clone(key)),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading coordination
// ---------------------------------------------------------------------------

/// Single-shot publication point shared by one load and all its waiters.
pub(crate) struct LoadShared<V> {
    slot: Mutex<Option<Result<Arc<V>, LoadError>>>,
    done: Condvar,
    loader_thread: ThreadId,
    started_at: u64,
    background: Mutex<Option<JoinHandle<Result<Option<V>, DynError>>>>,
    /// Set once a reload was handed to a background thread; the recursion
    /// check only applies to foreground loads.
    backgrounded: AtomicBool,
}

impl<V> LoadShared<V> {
    /// Creates the shared state, recording the installing thread so a
    /// recursive load on that thread can fail fast instead of deadlocking.
    pub(crate) fn new(started_at: u64) -> Self {
        Self {
            slot: Mutex::new(None),
            done: Condvar::new(),
            loader_thread: thread::current().id(),
            started_at,
            background: Mutex::new(None),
            backgrounded: AtomicBool::new(false),
        }
    }

    /// Ticker reading taken when the load was installed.
    pub(crate) fn started_at(&self) -> u64 {
        self.started_at
    }

    /// Publishes the outcome; only the first publication wins.
    pub(crate) fn publish(&self, outcome: Result<Arc<V>, LoadError>) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.done.notify_all();
        true
    }

    /// Returns the outcome without blocking, if already published.
    pub(crate) fn try_get(&self) -> Option<Result<Arc<V>, LoadError>> {
        self.slot.lock().clone()
    }

    /// Blocks until the outcome is published.
    ///
    /// Fails with [`LoadError::Recursive`] when called from the thread that
    /// is performing this load.
    pub(crate) fn wait(&self) -> Result<Arc<V>, LoadError> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            if thread::current().id() == self.loader_thread
                && !self.backgrounded.load(Ordering::Relaxed)
            {
                return Err(LoadError::recursive(
                    "this thread is already loading the requested key",
                ));
            }
            self.done.wait(&mut slot);
        }
    }

    /// Attaches the handle of a backgrounded reload.
    pub(crate) fn set_background(&self, handle: JoinHandle<Result<Option<V>, DynError>>) {
        self.backgrounded.store(true, Ordering::Relaxed);
        *self.background.lock() = Some(handle);
    }

    /// `true` when a backgrounded reload has run to completion and its
    /// result is ready to be installed.
    pub(crate) fn background_finished(&self) -> bool {
        self.background
            .lock()
            .as_ref()
            .is_some_and(|handle| handle.is_finished())
    }

    /// Takes the background handle if its thread has finished; the caller
    /// joins (non-blocking at that point) and installs the result.
    pub(crate) fn take_finished_background(
        &self,
    ) -> Option<JoinHandle<Result<Option<V>, DynError>>> {
        let mut background = self.background.lock();
        if background.as_ref().is_some_and(|handle| handle.is_finished()) {
            background.take()
        } else {
            None
        }
    }

    /// Takes the background handle regardless of progress. A waiter that
    /// needs the result now adopts the reload, joins it, and installs the
    /// outcome itself.
    pub(crate) fn take_background(&self) -> Option<JoinHandle<Result<Option<V>, DynError>>> {
        self.background.lock().take()
    }
}

// ---------------------------------------------------------------------------
// Value holders
// ---------------------------------------------------------------------------

/// Carrier of a cached value. Immutable once published; state changes
/// swap in a new holder.
pub(crate) enum ValueHolder<V> {
    /// Placeholder for a freshly allocated entry before its first value.
    Unset,
    /// Owned value with its weigher-computed weight.
    Strong { value: Arc<V>, weight: u64 },
    /// Weakly held value; the runtime may reclaim it at any time.
    Reclaimable { value: Weak<V>, weight: u64 },
    /// A load in flight; `old` remains visible until the load lands.
    Loading {
        old: Arc<ValueHolder<V>>,
        shared: Arc<LoadShared<V>>,
    },
}

impl<V> ValueHolder<V> {
    /// Builds the holder for a landed value according to value strength.
    pub(crate) fn for_value(value: Arc<V>, weight: u64, weakly_held: bool) -> Self {
        if weakly_held {
            Self::Reclaimable {
                value: Arc::downgrade(&value),
                weight,
            }
        } else {
            Self::Strong { value, weight }
        }
    }

    /// Current value, or `None` when absent, reclaimed, or never set.
    ///
    /// A `Loading` holder exposes the prior value it wraps, which is how
    /// readers keep observing the old value during refresh-ahead.
    pub(crate) fn value(&self) -> Option<Arc<V>> {
        match self {
            Self::Unset => None,
            Self::Strong { value, .. } => Some(Arc::clone(value)),
            Self::Reclaimable { value, .. } => value.upgrade(),
            Self::Loading { old, .. } => old.value(),
        }
    }

    /// Reported weight; a `Loading` holder reports its prior value's weight.
    pub(crate) fn weight(&self) -> u64 {
        match self {
            Self::Unset => 0,
            Self::Strong { weight, .. } | Self::Reclaimable { weight, .. } => *weight,
            Self::Loading { old, .. } => old.weight(),
        }
    }

    pub(crate) fn is_loading(&self) -> bool {
        matches!(self, Self::Loading { .. })
    }

    /// `true` once a real value has been populated. A reclaimed weak value
    /// is still active — that is how a `Collected` removal is recognized.
    pub(crate) fn is_active(&self) -> bool {
        match self {
            Self::Unset => false,
            Self::Strong { .. } | Self::Reclaimable { .. } => true,
            Self::Loading { old, .. } => old.is_active(),
        }
    }

    pub(crate) fn loading_shared(&self) -> Option<&Arc<LoadShared<V>>> {
        match self {
            Self::Loading { shared, .. } => Some(shared),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Shape flags fixed at cache construction; all entries share one shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryShape {
    pub weak_keys: bool,
    pub access_tracked: bool,
    pub write_tracked: bool,
}

impl EntryShape {
    pub(crate) fn select(weak_keys: bool, access_tracked: bool, write_tracked: bool) -> Self {
        Self {
            weak_keys,
            access_tracked,
            write_tracked,
        }
    }

    /// 3-bit encoding {key-reclaimable, access-tracked, write-tracked}.
    pub(crate) fn bits(self) -> u8 {
        (self.weak_keys as u8) | (self.access_tracked as u8) << 1 | (self.write_tracked as u8) << 2
    }
}

/// One slot of the stripe's bank; holds one cached mapping while live.
///
/// # Lifecycle and reader safety
///
/// A slot's generation is odd while live and even while vacant or
/// retired. `init` runs only on unreachable slots (fresh, or reaped at a
/// quiescent point) and the index is published afterwards with release
/// ordering, so readers that reach the slot observe initialized fields.
/// `clear` runs only at quiescence. The `key` cell is written exclusively
/// in those two places, which is what makes the lock-free `key_ref` reads
/// sound; everything else a reader touches is atomic.
pub(crate) struct Entry<K, V> {
    /// Odd while the slot holds a live entry; bumped on publish and retire.
    gen: AtomicU32,
    hash: AtomicU32,
    /// Next entry in the bucket chain; `NIL` terminates.
    next: AtomicU32,
    access_time: AtomicU64,
    write_time: AtomicU64,
    access_prev: AtomicU32,
    access_next: AtomicU32,
    write_prev: AtomicU32,
    write_next: AtomicU32,
    /// Written only while the slot is unreachable; see the type docs.
    key: UnsafeCell<Option<KeyRef<K>>>,
    /// An owned `Arc<ValueHolder<V>>`, stored raw for lock-free loads.
    holder: AtomicPtr<ValueHolder<V>>,
}

// SAFETY: `key` is only written while the slot is unreachable (enforced by
// the stripe's quiescence protocol) and `holder` is an owned Arc swapped
// atomically; all other fields are atomics. With K and V shareable, a
// shared `&Entry` is safe to use from any thread.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for Entry<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Entry<K, V> {}

impl<K, V> Default for Entry<K, V> {
    fn default() -> Self {
        Self {
            gen: AtomicU32::new(0),
            hash: AtomicU32::new(0),
            next: AtomicU32::new(NIL),
            access_time: AtomicU64::new(0),
            write_time: AtomicU64::new(0),
            access_prev: AtomicU32::new(NIL),
            access_next: AtomicU32::new(NIL),
            write_prev: AtomicU32::new(NIL),
            write_next: AtomicU32::new(NIL),
            key: UnsafeCell::new(None),
            holder: AtomicPtr::new(std::ptr::null_mut()),
        }
    }
}

impl<K, V> Entry<K, V> {
    pub(crate) fn gen(&self) -> u32 {
        self.gen.load(Ordering::Acquire)
    }

    /// `true` while the slot holds a (possibly loading) entry.
    pub(crate) fn is_live(&self) -> bool {
        self.gen() & 1 == 1
    }

    pub(crate) fn hash(&self) -> u32 {
        self.hash.load(Ordering::Relaxed)
    }

    pub(crate) fn next(&self) -> u32 {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn set_next(&self, index: u32) {
        self.next.store(index, Ordering::Release);
    }

    pub(crate) fn access_time(&self) -> u64 {
        self.access_time.load(Ordering::Relaxed)
    }

    pub(crate) fn set_access_time(&self, now: u64) {
        self.access_time.store(now, Ordering::Relaxed);
    }

    pub(crate) fn write_time(&self) -> u64 {
        self.write_time.load(Ordering::Relaxed)
    }

    pub(crate) fn set_write_time(&self, now: u64) {
        self.write_time.store(now, Ordering::Relaxed);
    }

    /// Initializes a vacant slot and marks it live.
    ///
    /// The caller holds the stripe lock and guarantees the slot is
    /// unreachable (freshly allocated, or reaped at a quiescent point);
    /// the index must be published with release ordering afterwards.
    pub(crate) fn init(
        &self,
        index: u32,
        key: KeyRef<K>,
        hash: u32,
        next: u32,
        holder: Arc<ValueHolder<V>>,
    ) {
        debug_assert!(!self.is_live());
        // SAFETY: the slot is unreachable, so no reader aliases `key`.
        unsafe {
            *self.key.get() = Some(key);
        }
        self.hash.store(hash, Ordering::Relaxed);
        self.next.store(next, Ordering::Relaxed);
        self.access_time.store(0, Ordering::Relaxed);
        self.write_time.store(0, Ordering::Relaxed);
        self.access_prev.store(index, Ordering::Relaxed);
        self.access_next.store(index, Ordering::Relaxed);
        self.write_prev.store(index, Ordering::Relaxed);
        self.write_next.store(index, Ordering::Relaxed);
        let raw = Arc::into_raw(holder) as *mut ValueHolder<V>;
        let previous = self.holder.swap(raw, Ordering::AcqRel);
        debug_assert!(previous.is_null());
        self.gen.fetch_add(1, Ordering::Release);
    }

    /// Marks a live slot retired; its payload stays readable until reaped.
    pub(crate) fn retire(&self) {
        debug_assert!(self.is_live());
        self.gen.fetch_add(1, Ordering::Release);
    }

    /// Drops a retired slot's payload so the index can be reused.
    ///
    /// The caller holds the stripe lock at a quiescent point, so no
    /// reader can still hold references into the slot.
    pub(crate) fn clear(&self) {
        debug_assert!(!self.is_live());
        // SAFETY: quiescence guarantees no reader aliases `key`.
        unsafe {
            *self.key.get() = None;
        }
        let raw = self.holder.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !raw.is_null() {
            // SAFETY: the pointer came from `Arc::into_raw` in `init` or
            // `swap_holder` and this is the entry's owned reference.
            drop(unsafe { Arc::from_raw(raw) });
        }
    }

    /// The stored key reference, if the slot carries one.
    ///
    /// The caller must hold the stripe lock or a reader pin, which is what
    /// keeps the referenced cell stable.
    pub(crate) fn key_ref(&self) -> Option<&KeyRef<K>> {
        // SAFETY: `key` is only written while the slot is unreachable;
        // pinned readers and lock holders can never observe those writes.
        unsafe { (*self.key.get()).as_ref() }
    }

    /// Upgraded key, or `None` when weakly held and reclaimed.
    pub(crate) fn key(&self) -> Option<Arc<K>> {
        self.key_ref().and_then(KeyRef::get)
    }

    /// Shared view of the current holder.
    ///
    /// The caller must hold the stripe lock or a reader pin; the stripe's
    /// limbo keeps a displaced holder alive until no pin can reference it.
    pub(crate) fn holder(&self) -> Option<&ValueHolder<V>> {
        let raw = self.holder.load(Ordering::Acquire);
        if raw.is_null() {
            None
        } else {
            // SAFETY: the holder Arc is owned by this entry or parked in
            // the stripe's limbo until quiescence.
            Some(unsafe { &*raw })
        }
    }

    /// An extra owned handle to the current holder, for sharing with an
    /// entry copy. Caller holds the stripe lock.
    pub(crate) fn share_holder(&self) -> Option<Arc<ValueHolder<V>>> {
        let raw = self.holder.load(Ordering::Acquire);
        if raw.is_null() {
            None
        } else {
            // SAFETY: under the stripe lock the holder cannot be swapped
            // out concurrently, so the refcount is at least one.
            unsafe {
                Arc::increment_strong_count(raw);
                Some(Arc::from_raw(raw))
            }
        }
    }

    /// Swaps in a new holder, returning the previous one.
    ///
    /// Caller holds the stripe lock and must park the returned holder in
    /// the stripe's limbo (or keep it referenced) rather than dropping it,
    /// so pinned readers of the old holder stay valid.
    pub(crate) fn swap_holder(&self, holder: Arc<ValueHolder<V>>) -> Option<Arc<ValueHolder<V>>> {
        let raw = Arc::into_raw(holder) as *mut ValueHolder<V>;
        let previous = self.holder.swap(raw, Ordering::AcqRel);
        if previous.is_null() {
            None
        } else {
            // SAFETY: the pointer came from `Arc::into_raw` and this is
            // the entry's owned reference.
            Some(unsafe { Arc::from_raw(previous) })
        }
    }
}

impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        let raw = *self.holder.get_mut();
        if !raw.is_null() {
            // SAFETY: dropping the entry's owned holder reference.
            drop(unsafe { Arc::from_raw(raw) });
        }
    }
}

impl<K, V> IndexLinks<AccessOrder> for Entry<K, V> {
    fn prev(&self) -> u32 {
        self.access_prev.load(Ordering::Relaxed)
    }
    fn set_prev(&self, index: u32) {
        self.access_prev.store(index, Ordering::Relaxed);
    }
    fn next(&self) -> u32 {
        self.access_next.load(Ordering::Relaxed)
    }
    fn set_next(&self, index: u32) {
        self.access_next.store(index, Ordering::Relaxed);
    }
}

impl<K, V> IndexLinks<WriteOrder> for Entry<K, V> {
    fn prev(&self) -> u32 {
        self.write_prev.load(Ordering::Relaxed)
    }
    fn set_prev(&self, index: u32) {
        self.write_prev.store(index, Ordering::Relaxed);
    }
    fn next(&self) -> u32 {
        self.write_next.load(Ordering::Relaxed)
    }
    fn set_next(&self, index: u32) {
        self.write_next.store(index, Ordering::Relaxed);
    }
}
