use roaring::RoaringTreemap;
use std::io;
use std::result;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::bitmap::Bitmap;
use crate::storage::BitmapStorage;
use crate::transaction::{Write, WriteTxn};

mod regions;
mod reservation;


pub use crate::allocators::regions::Regions;
pub use crate::allocators::reservation::{Key, Reservation};

//-------------------------------------

#[derive(Error, Debug)]
pub enum AllocError {
    #[error("unable to grow the bitmap, out of memory")]
    NoMemory,

    #[error("not enough free elements")]
    NoSpace,

    #[error("storage error: {0}")]
    Io(#[from] io::Error),

    #[error("bitmap corrupt: {0}")]
    Corrupt(String),
}

pub type Result<T> = result::Result<T, AllocError>;

//-------------------------------------

struct Allocator_ {
    bitmap: Bitmap,

    // Elements promised to live reservations.
    reserved: u64,

    // There are no free elements below this.
    first_free_hint: u64,

    // Staged by swap(), applied by swap_commit().
    swap_in: RoaringTreemap,
    swap_out: RoaringTreemap,
}

impl Allocator_ {
    fn available(&self) -> u64 {
        self.bitmap.count_zeroes() - self.swap_in.len() - self.reserved
    }

    fn check_invariants(&self) {
        debug_assert!(self.reserved <= self.bitmap.count_zeroes() - self.swap_in.len());
        debug_assert!(self.swap_in.is_disjoint(&self.swap_out));
    }

    /// Extends the bitmap by at least `shortfall` elements.  Nothing is
    /// changed if the storage can't accommodate the whole amount.
    fn grow(
        &mut self,
        storage: &dyn BitmapStorage,
        txn: &mut dyn WriteTxn,
        shortfall: u64,
    ) -> Result<()> {
        let capacity = self.bitmap.len();
        let max = storage.max_elements();
        let wanted = capacity
            .checked_add(shortfall)
            .filter(|w| *w <= max)
            .ok_or(AllocError::NoSpace)?;

        let increment = storage.grow_increment().max(1);
        let target = wanted
            .checked_next_multiple_of(increment)
            .unwrap_or(max)
            .min(max);

        self.bitmap.grow(target)?;
        txn.enqueue(Write::Grow {
            nr_elements: target,
        });
        debug!(old = capacity, new = target, "grew bitmap");
        Ok(())
    }

    fn reserve(
        &mut self,
        storage: &dyn BitmapStorage,
        txn: &mut dyn WriteTxn,
        count: u64,
    ) -> Result<()> {
        let available = self.available();
        if available < count {
            if let Err(e) = self.grow(storage, txn, count - available) {
                warn!(count, available, "reservation failed: {}", e);
                return Err(e);
            }
        }

        self.reserved += count;
        self.check_invariants();
        Ok(())
    }

    fn unreserve(&mut self, count: u64) {
        assert!(
            self.reserved >= count,
            "unreserving {} elements but only {} are reserved",
            count,
            self.reserved
        );
        self.reserved -= count;
    }

    /// Lowest element that is neither allocated nor staged for swap in.
    fn find_free(&self) -> u64 {
        let mut begin = self.first_free_hint;
        loop {
            match self.bitmap.find_first_zero(begin) {
                Some(index) if self.swap_in.contains(index) => begin = index + 1,
                Some(index) => return index,
                None => panic!(
                    "no free element found, but {} are reserved",
                    self.reserved
                ),
            }
        }
    }

    // Consumes one reserved element, the caller decides what to do with it.
    fn take_free(&mut self) -> u64 {
        assert!(self.reserved > 0, "allocating without a reservation");
        let index = self.find_free();
        self.reserved -= 1;
        self.first_free_hint = index + 1;
        index
    }

    fn allocate(&mut self, txn: &mut dyn WriteTxn) -> u64 {
        let index = self.take_free();
        self.bitmap.set_range(index, index + 1);
        txn.enqueue(Write::Set {
            begin: index,
            end: index + 1,
        });
        self.check_invariants();
        index
    }

    fn free(&mut self, txn: &mut dyn WriteTxn, index: u64) {
        assert!(
            self.bitmap.get(index),
            "freeing element {} which isn't allocated",
            index
        );
        assert!(
            !self.swap_out.contains(index),
            "freeing element {} which is staged for swap out",
            index
        );

        self.bitmap.clear_range(index, index + 1);
        txn.enqueue(Write::Clear {
            begin: index,
            end: index + 1,
        });
        self.first_free_hint = self.first_free_hint.min(index);
        self.check_invariants();
    }

    fn swap(&mut self, old: u64) -> u64 {
        assert!(
            self.bitmap.get(old),
            "swapping element {} which isn't allocated",
            old
        );
        assert!(
            !self.swap_out.contains(old),
            "element {} is already staged for swap out",
            old
        );

        let new = self.take_free();
        self.swap_in.insert(new);
        self.swap_out.insert(old);
        self.check_invariants();
        new
    }

    fn swap_commit(&mut self, txn: &mut dyn WriteTxn) {
        for index in self.swap_in.iter() {
            self.bitmap.set_range(index, index + 1);
            txn.enqueue(Write::Set {
                begin: index,
                end: index + 1,
            });
        }

        for index in self.swap_out.iter() {
            self.bitmap.clear_range(index, index + 1);
            self.first_free_hint = self.first_free_hint.min(index);
            txn.enqueue(Write::Clear {
                begin: index,
                end: index + 1,
            });
        }

        self.swap_in.clear();
        self.swap_out.clear();
        self.check_invariants();
    }
}

//-------------------------------------

/// Hands out elements (blocks or inodes) tracked by a bitmap.
///
/// Callers first `reserve()` the number of elements an operation needs,
/// then allocate through the returned `Reservation`.  Every change to the
/// bitmap is queued on the caller's transaction; nothing here touches
/// durable storage except when the allocator is created.
pub struct Allocator {
    storage: Arc<dyn BitmapStorage>,
    inner: Mutex<Allocator_>,
}

impl Allocator {
    pub fn create(storage: Arc<dyn BitmapStorage>) -> Result<Self> {
        let nr_elements = storage.nr_elements();
        let bytes = storage.read_bitmap()?;
        let bitmap = Bitmap::from_bytes(nr_elements, &bytes)?;

        debug!(
            nr_elements,
            allocated = bitmap.count_ones(),
            "created allocator"
        );

        Ok(Self {
            storage,
            inner: Mutex::new(Allocator_ {
                bitmap,
                reserved: 0,
                first_free_hint: 0,
                swap_in: RoaringTreemap::new(),
                swap_out: RoaringTreemap::new(),
            }),
        })
    }

    pub fn storage(&self) -> &dyn BitmapStorage {
        self.storage.as_ref()
    }

    /// Elements that are neither allocated, staged nor reserved.
    pub fn available(&self) -> u64 {
        self.inner.lock().unwrap().available()
    }

    pub fn capacity(&self) -> u64 {
        self.inner.lock().unwrap().bitmap.len()
    }

    pub fn reserved(&self) -> u64 {
        self.inner.lock().unwrap().reserved
    }

    pub fn allocated(&self) -> u64 {
        self.inner.lock().unwrap().bitmap.count_ones()
    }

    pub fn nr_pending_swaps(&self) -> u64 {
        self.inner.lock().unwrap().swap_out.len()
    }

    /// Promises `count` elements to the caller, growing the bitmap if
    /// needed.  The growth is queued on `txn`.
    pub fn reserve(&self, txn: &mut dyn WriteTxn, count: u64) -> Result<Reservation<'_>> {
        let mut inner = self.inner.lock().unwrap();
        inner.reserve(self.storage.as_ref(), txn, count)?;
        debug!(count, reserved = inner.reserved, "reserved");
        drop(inner);

        Ok(Reservation::new(self, count))
    }

    pub fn unreserve(&self, _key: &Key, count: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.unreserve(count);
        trace!(count, reserved = inner.reserved, "unreserved");
    }

    pub fn allocate(&self, _key: &Key, txn: &mut dyn WriteTxn) -> u64 {
        let index = self.inner.lock().unwrap().allocate(txn);
        trace!(index, "allocated");
        index
    }

    pub fn free(&self, txn: &mut dyn WriteTxn, index: u64) {
        self.inner.lock().unwrap().free(txn, index);
        trace!(index, "freed");
    }

    pub fn check_allocated(&self, index: u64) -> bool {
        self.inner.lock().unwrap().bitmap.get(index)
    }

    /// Stages the replacement of `index` by a newly allocated element.
    /// Neither change is visible in the bitmap until `swap_commit()`.
    pub fn swap(&self, _key: &Key, index: u64) -> u64 {
        let new = self.inner.lock().unwrap().swap(index);
        trace!(old = index, new, "staged swap");
        new
    }

    /// Applies all staged swaps.  Callers serialise this per owner.
    pub fn swap_commit(&self, txn: &mut dyn WriteTxn) {
        let mut inner = self.inner.lock().unwrap();
        let nr_swaps = inner.swap_out.len();
        inner.swap_commit(txn);
        debug!(nr_swaps, "committed swaps");
    }

    /// Snapshot of the allocated runs as (offset, length) pairs.
    pub fn allocated_regions(&self) -> Regions {
        let bitmap = self.inner.lock().unwrap().bitmap.clone();
        Regions::new(bitmap)
    }
}

//-------------------------------------
