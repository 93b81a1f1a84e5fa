use std::ptr;
use std::thread;

use crate::allocators::Allocator;
use crate::transaction::WriteTxn;

//-------------------------------------

/// Proof that a call into the allocator is being made on behalf of a
/// `Reservation`.  Only this module can build one, so the gated
/// `Allocator` methods can't be reached any other way.
pub struct Key {
    _private: (),
}

impl Key {
    fn new() -> Self {
        Key { _private: () }
    }
}

//-------------------------------------

/// The right to allocate up to `remaining()` more elements.  Whatever is
/// left when this is dropped goes back to the allocator.
pub struct Reservation<'a> {
    allocator: &'a Allocator,
    remaining: u64,
}

impl<'a> Drop for Reservation<'a> {
    fn drop(&mut self) {
        // The allocator lock may be poisoned while unwinding, and a second
        // panic would abort.
        if self.remaining > 0 && !thread::panicking() {
            self.allocator.unreserve(&Key::new(), self.remaining);
            self.remaining = 0;
        }
    }
}

impl<'a> Reservation<'a> {
    pub(super) fn new(allocator: &'a Allocator, count: u64) -> Self {
        Self {
            allocator,
            remaining: count,
        }
    }

    pub fn allocator(&self) -> &'a Allocator {
        self.allocator
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    fn consume(&mut self) {
        assert!(
            self.remaining > 0,
            "allocation requested beyond what was reserved"
        );
        self.remaining -= 1;
    }

    pub fn allocate(&mut self, txn: &mut dyn WriteTxn) -> u64 {
        self.consume();
        self.allocator.allocate(&Key::new(), txn)
    }

    /// Stages a copy-on-write replacement for `index`.  See
    /// `Allocator::swap()`.
    pub fn swap(&mut self, index: u64) -> u64 {
        self.consume();
        self.allocator.swap(&Key::new(), index)
    }

    /// Moves `count` of our elements over to `other`.
    pub fn give(&mut self, other: &mut Reservation<'a>, count: u64) {
        assert!(
            ptr::eq(self.allocator, other.allocator),
            "reservations belong to different allocators"
        );
        assert!(
            count <= self.remaining,
            "giving away {} elements, only {} remain",
            count,
            self.remaining
        );
        self.remaining -= count;
        other.remaining += count;
    }
}

//-------------------------------------
