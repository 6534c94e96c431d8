//! Lock-free staging queues drained under the stripe lock.
//!
//! Two structures keep mutation off the read path:
//!
//! - [`RecencyBuffer`]: readers append the ids of entries they touched;
//!   writers drain the buffer and replay the appends as access-queue
//!   move-to-tail operations. Reads never contend on the queue links.
//! - [`ReclaimChannel`]: a chain walk that observes a dead weak reference
//!   stages the entry id here; cleanup drains a bounded batch per round so
//!   one drain can never cause a long pause.
//!
//! Both tolerate stale ids: the drain side revalidates every id against the
//! arena's generation before acting.

use crossbeam_queue::SegQueue;

use crate::ds::arena::EntryId;

/// Upper bound on reclamation channel items consumed per drain round.
pub const RECLAIM_DRAIN_MAX: usize = 16;

/// Lock-free staging of recently read entry ids.
#[derive(Debug, Default)]
pub struct RecencyBuffer {
    queue: SegQueue<EntryId>,
}

impl RecencyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a read; called from the lock-free read path.
    #[inline]
    pub fn push(&self, id: EntryId) {
        self.queue.push(id);
    }

    /// Drains every staged id into `apply`; called under the stripe lock.
    pub fn drain(&self, mut apply: impl FnMut(EntryId)) {
        while let Some(id) = self.queue.pop() {
            apply(id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Lock-free staging of entries whose weak key or value was observed dead.
#[derive(Debug, Default)]
pub struct ReclaimChannel {
    queue: SegQueue<EntryId>,
}

impl ReclaimChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages an entry for reclamation; called from chain walks.
    #[inline]
    pub fn push(&self, id: EntryId) {
        self.queue.push(id);
    }

    /// Drains up to [`RECLAIM_DRAIN_MAX`] staged ids into `apply`; called
    /// under the stripe lock. Returns the number of ids consumed.
    pub fn drain_bounded(&self, mut apply: impl FnMut(EntryId)) -> usize {
        let mut drained = 0;
        while drained < RECLAIM_DRAIN_MAX {
            match self.queue.pop() {
                Some(id) => {
                    apply(id);
                    drained += 1;
                },
                None => break,
            }
        }
        drained
    }

    /// Discards everything staged, without acting on it.
    pub fn discard_all(&self) {
        while self.queue.pop().is_some() {}
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
