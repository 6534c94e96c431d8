//! Removal notifications and the listener delivery bus.
//!
//! Every destroyed entry produces exactly one [`RemovalNotification`]
//! (loading placeholders that were superseded produce none). Notifications
//! are enqueued under the stripe lock onto a lock-free bus and delivered to
//! the listener only after the lock is released, so a slow or panicking
//! listener can never stall a stripe.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use tracing::warn;

/// Why an entry was removed from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalCause {
    /// The caller removed the entry (`invalidate`, `invalidate_all`).
    Explicit,
    /// The entry's value was overwritten by a write or a completed load.
    Replaced,
    /// The weakly held key or value was reclaimed by the runtime.
    Collected,
    /// The entry passed its access or write expiration deadline.
    Expired,
    /// The entry was evicted to bring the stripe back under its weight cap.
    Size,
}

impl RemovalCause {
    /// `true` when the removal was automatic rather than caller-requested.
    pub fn was_evicted(self) -> bool {
        matches!(self, Self::Collected | Self::Expired | Self::Size)
    }
}

/// A single removal event delivered to the listener.
///
/// The key or value is absent when it was weakly held and already
/// reclaimed by the time the notification was assembled.
#[derive(Debug, Clone)]
pub struct RemovalNotification<K, V> {
    pub key: Option<Arc<K>>,
    pub value: Option<Arc<V>>,
    pub cause: RemovalCause,
}

/// User sink for removal events.
///
/// Invoked from arbitrary caller threads with no stripe lock held, at most
/// once per removed entry. Panics are caught and logged, never propagated.
pub trait RemovalListener<K, V>: Send + Sync {
    fn on_removal(&self, notification: RemovalNotification<K, V>);
}

impl<K, V, F> RemovalListener<K, V> for F
where
    F: Fn(RemovalNotification<K, V>) + Send + Sync,
{
    fn on_removal(&self, notification: RemovalNotification<K, V>) {
        self(notification)
    }
}

/// Lock-free queue of pending notifications plus the listener draining it.
///
/// When no listener is configured the bus discards offers without
/// allocating, mirroring the disabled case of the notification subsystem.
pub(crate) struct NotificationBus<K, V> {
    queue: SegQueue<RemovalNotification<K, V>>,
    listener: Option<Box<dyn RemovalListener<K, V>>>,
}

impl<K, V> NotificationBus<K, V> {
    pub(crate) fn new(listener: Option<Box<dyn RemovalListener<K, V>>>) -> Self {
        Self {
            queue: SegQueue::new(),
            listener,
        }
    }

    /// `true` when a listener is configured and offers are worth making.
    pub(crate) fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// Enqueues a notification; called under the stripe lock.
    pub(crate) fn offer(&self, notification: RemovalNotification<K, V>) {
        if self.is_listening() {
            self.queue.push(notification);
        }
    }

    /// Delivers all pending notifications; called with no lock held.
    pub(crate) fn drain(&self) {
        let Some(listener) = self.listener.as_deref() else {
            return;
        };
        while let Some(notification) = self.queue.pop() {
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_removal(notification)));
            if result.is_err() {
                warn!("removal listener panicked; notification dropped");
            }
        }
    }
}
