//! The bounded marking stack.
//!
//! A fixed-capacity LIFO of cell addresses, used by the tracer to defer
//! visits of references that point behind the finger. The stack itself never
//! grows: when a push would exceed capacity the marker flushes it and
//! arranges for the flushed references to be revisited by an overflow scan,
//! after which the retried push is guaranteed to succeed.

use crate::util::Address;

pub struct MarkingStack {
    entries: Vec<Address>,
    capacity: usize,
}

impl MarkingStack {
    /// Create a stack of the given capacity, which must be a power of two.
    pub fn new(capacity: usize) -> MarkingStack {
        assert!(capacity.is_power_of_two());
        MarkingStack {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() == self.capacity
    }

    /// Push a cell. The caller must have made room (see
    /// [`Self::is_full`]); pushing a full stack is a bug.
    pub fn push(&mut self, cell: Address) {
        debug_assert!(!self.is_full());
        self.entries.push(cell);
    }

    pub fn pop(&mut self) -> Option<Address> {
        self.entries.pop()
    }

    /// Empty the stack, yielding the flushed cells.
    pub fn drain(&mut self) -> std::vec::Drain<'_, Address> {
        self.entries.drain(..)
    }
}
