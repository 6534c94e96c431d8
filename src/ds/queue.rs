//! Intrusive doubly linked index deques for entry ordering.
//!
//! Cache entries live in one [`SlotBank`] but participate in up to two
//! orderings at once: access order (LRU for size eviction and access
//! expiration) and write order (FIFO for write expiration). Rather than
//! allocating list nodes, each ordering threads `u32` prev/next links
//! through the entries themselves; a tag type selects which link pair a
//! deque manipulates.
//!
//! Links are stored atomically because the slots are shared with lock-free
//! readers, but only the stripe lock holder ever reads or writes them —
//! the deque itself is writer-only state.
//!
//! ## Architecture
//!
//! ```text
//!   bank slots                      IndexDeque<AccessOrder>
//!   ┌─────┬──────────────────┐      head ─► 2 ◄──► 0 ◄──► 5 ◄─ tail
//!   │ idx │ a_prev  a_next   │
//!   ├─────┼──────────────────┤      detached sentinel:
//!   │  0  │   2       5      │        prev == next == own index
//!   │  2  │  NIL      0      │
//!   │  5  │   0      NIL     │      boundary link: NIL (no neighbor)
//!   └─────┴──────────────────┘
//! ```
//!
//! A node is in the deque if and only if its links are not the
//! self-referential detached sentinel, so membership checks are O(1)
//! without auxiliary storage.
//!
//! ## Operations
//! - `push_back(id)`: append, or move to the tail if already present
//! - `unlink(id)`: O(1) removal
//! - `pop_front()`: remove the eldest
//! - `replace_index(old, new)`: hand a queue position to a copied entry
//!
//! `debug_validate_invariants()` is available in debug/test builds.

use std::marker::PhantomData;

use crate::ds::arena::SlotBank;

/// Reserved index meaning "no neighbor" at a deque boundary.
pub const NIL: u32 = u32::MAX;

/// Tag selecting the access-order link pair.
#[derive(Debug)]
pub struct AccessOrder;

/// Tag selecting the write-order link pair.
#[derive(Debug)]
pub struct WriteOrder;

/// Access to one tagged pair of intrusive links inside a node.
///
/// Setters take `&self` because the links are atomics inside shared
/// slots; implementors must initialize both links to the node's own
/// index (the detached sentinel) before first use.
pub trait IndexLinks<Order> {
    fn prev(&self) -> u32;
    fn set_prev(&self, index: u32);
    fn next(&self) -> u32;
    fn set_next(&self, index: u32);
}

/// Doubly linked deque threading tagged links through bank slots.
#[derive(Debug)]
pub struct IndexDeque<Order> {
    head: u32,
    tail: u32,
    len: usize,
    _order: PhantomData<Order>,
}

impl<Order> IndexDeque<Order> {
    /// Creates an empty deque.
    pub fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
            _order: PhantomData,
        }
    }

    /// Returns the number of linked nodes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no nodes are linked.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the eldest node's index, if any.
    pub fn front(&self) -> Option<u32> {
        (self.head != NIL).then_some(self.head)
    }

    /// Returns `true` if the node at `index` is currently linked.
    pub fn contains<T: IndexLinks<Order>>(&self, node: &T, index: u32) -> bool {
        !(node.prev() == index && node.next() == index)
    }

    /// Appends the node at `index` to the tail, unlinking it first if it
    /// is already present (move-to-tail).
    pub fn push_back<T: IndexLinks<Order>>(&mut self, bank: &SlotBank<T>, index: u32) {
        if self.tail == index {
            return;
        }
        self.unlink(bank, index);

        let node = bank.get(index);
        node.set_prev(self.tail);
        node.set_next(NIL);

        if self.tail != NIL {
            bank.get(self.tail).set_next(index);
        } else {
            self.head = index;
        }
        self.tail = index;
        self.len += 1;
    }

    /// Unlinks the node at `index`, restoring its detached sentinel.
    ///
    /// Returns `false` if the node was not linked.
    pub fn unlink<T: IndexLinks<Order>>(&mut self, bank: &SlotBank<T>, index: u32) -> bool {
        let node = bank.get(index);
        if !self.contains(node, index) {
            return false;
        }
        let (prev, next) = (node.prev(), node.next());

        if prev != NIL {
            bank.get(prev).set_next(next);
        } else {
            self.head = next;
        }
        if next != NIL {
            bank.get(next).set_prev(prev);
        } else {
            self.tail = prev;
        }

        node.set_prev(index);
        node.set_next(index);
        self.len -= 1;
        true
    }

    /// Removes and returns the eldest node's index.
    pub fn pop_front<T: IndexLinks<Order>>(&mut self, bank: &SlotBank<T>) -> Option<u32> {
        let head = self.front()?;
        self.unlink(bank, head);
        Some(head)
    }

    /// Hands the queue position of `old` to `new`, detaching `old`.
    ///
    /// Used when an entry is copied to a fresh slot (table growth) and the
    /// copy must inherit the original's ordering. The caller guarantees
    /// `old` is linked and `new` is not.
    pub fn replace_index<T: IndexLinks<Order>>(
        &mut self,
        bank: &SlotBank<T>,
        old: u32,
        new: u32,
    ) {
        let node = bank.get(old);
        debug_assert!(self.contains(node, old));
        let (prev, next) = (node.prev(), node.next());

        let replacement = bank.get(new);
        replacement.set_prev(prev);
        replacement.set_next(next);

        if prev != NIL {
            bank.get(prev).set_next(new);
        } else {
            self.head = new;
        }
        if next != NIL {
            bank.get(next).set_prev(new);
        } else {
            self.tail = new;
        }

        node.set_prev(old);
        node.set_next(old);
    }

    /// Iterates node indices from eldest to youngest.
    pub fn iter_indices<'a, T: IndexLinks<Order>>(
        &self,
        bank: &'a SlotBank<T>,
    ) -> IndexDequeIter<'a, T, Order> {
        IndexDequeIter {
            bank,
            current: self.head,
            _order: PhantomData,
        }
    }

    /// Resets the deque without touching node links.
    ///
    /// Only valid when the backing entries are being retired wholesale.
    pub fn clear(&mut self) {
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
    }

    #[cfg(any(test, debug_assertions))]
    pub fn debug_validate_invariants<T: IndexLinks<Order>>(&self, bank: &SlotBank<T>) {
        if self.head == NIL || self.tail == NIL {
            assert_eq!(self.head, NIL);
            assert_eq!(self.tail, NIL);
            assert_eq!(self.len, 0);
            return;
        }

        let mut count = 0usize;
        let mut prev = NIL;
        let mut current = self.head;
        while current != NIL {
            let node = bank.get(current);
            assert!(self.contains(node, current));
            assert_eq!(node.prev(), prev);
            prev = current;
            current = node.next();
            count += 1;
            assert!(count <= self.len);
        }
        assert_eq!(prev, self.tail);
        assert_eq!(count, self.len);
    }
}

impl<Order> Default for IndexDeque<Order> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct IndexDequeIter<'a, T, Order> {
    bank: &'a SlotBank<T>,
    current: u32,
    _order: PhantomData<Order>,
}

impl<T: IndexLinks<Order>, Order> Iterator for IndexDequeIter<'_, T, Order> {
    type Item = u32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == NIL {
            return None;
        }
        let index = self.current;
        self.current = self.bank.get(index).next();
        Some(index)
    }
}


#[cfg(test)]
mod tests {
    use super::tests_support::*;
    use super::*;

    #[test]
    fn push_back_builds_fifo_order() {
        let (bank, idx) = setup_nodes(3);
        let mut deque: IndexDeque<AccessOrder> = IndexDeque::new();

        for &i in &idx {
            deque.push_back(&bank, i);
        }
        let order: Vec<_> = deque.iter_indices(&bank).collect();
        assert_eq!(order, idx);
        deque.debug_validate_invariants(&bank);
    }

    #[test]
    fn push_back_moves_existing_to_tail() {
        let (bank, idx) = setup_nodes(3);
        let mut deque: IndexDeque<AccessOrder> = IndexDeque::new();
        for &i in &idx {
            deque.push_back(&bank, i);
        }

        deque.push_back(&bank, idx[0]);
        let order: Vec<_> = deque.iter_indices(&bank).collect();
        assert_eq!(order, vec![idx[1], idx[2], idx[0]]);
        assert_eq!(deque.len(), 3);
        deque.debug_validate_invariants(&bank);
    }

    #[test]
    fn unlink_restores_detached_sentinel() {
        let (bank, idx) = setup_nodes(3);
        let mut deque: IndexDeque<AccessOrder> = IndexDeque::new();
        for &i in &idx {
            deque.push_back(&bank, i);
        }

        assert!(deque.unlink(&bank, idx[1]));
        let node = bank.get(idx[1]);
        assert!(!deque.contains(node, idx[1]));
        assert_eq!(IndexLinks::<AccessOrder>::prev(node), idx[1]);
        assert_eq!(IndexLinks::<AccessOrder>::next(node), idx[1]);

        assert!(!deque.unlink(&bank, idx[1]));
        assert_eq!(deque.len(), 2);
        deque.debug_validate_invariants(&bank);
    }

    #[test]
    fn pop_front_drains_in_order() {
        let (bank, idx) = setup_nodes(3);
        let mut deque: IndexDeque<AccessOrder> = IndexDeque::new();
        for &i in &idx {
            deque.push_back(&bank, i);
        }

        assert_eq!(deque.pop_front(&bank), Some(idx[0]));
        assert_eq!(deque.pop_front(&bank), Some(idx[1]));
        assert_eq!(deque.pop_front(&bank), Some(idx[2]));
        assert_eq!(deque.pop_front(&bank), None);
        assert!(deque.is_empty());
    }

    #[test]
    fn single_node_edges() {
        let (bank, idx) = setup_nodes(1);
        let mut deque: IndexDeque<AccessOrder> = IndexDeque::new();

        deque.push_back(&bank, idx[0]);
        assert_eq!(deque.front(), Some(idx[0]));
        // pushing the tail again is a no-op
        deque.push_back(&bank, idx[0]);
        assert_eq!(deque.len(), 1);

        assert!(deque.unlink(&bank, idx[0]));
        assert_eq!(deque.front(), None);
        deque.debug_validate_invariants(&bank);
    }

    #[test]
    fn replace_index_transfers_position() {
        let (bank, idx) = setup_nodes(4);
        let mut deque: IndexDeque<AccessOrder> = IndexDeque::new();
        for &i in &idx[..3] {
            deque.push_back(&bank, i);
        }

        // Hand the middle position to the fourth node.
        deque.replace_index(&bank, idx[1], idx[3]);
        let order: Vec<_> = deque.iter_indices(&bank).collect();
        assert_eq!(order, vec![idx[0], idx[3], idx[2]]);
        assert!(!deque.contains(bank.get(idx[1]), idx[1]));
        deque.debug_validate_invariants(&bank);

        // Boundary positions transfer head/tail too.
        deque.replace_index(&bank, idx[0], idx[1]);
        assert_eq!(deque.front(), Some(idx[1]));
        deque.debug_validate_invariants(&bank);
    }
}
