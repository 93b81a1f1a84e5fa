use tracing::debug;

use crate::allocators::Result;
use crate::storage::BitmapStorage;

//-------------------------------------------------------------------------

/// A deferred change to the on-disk bitmap.  Each one describes what
/// happened rather than the resulting bytes, so batches built concurrently
/// may be committed in any order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Write {
    /// Elements [begin, end) became allocated.
    Set { begin: u64, end: u64 },

    /// Elements [begin, end) became free.
    Clear { begin: u64, end: u64 },

    /// The extent holds at least `nr_elements` elements.
    Grow { nr_elements: u64 },
}

impl Write {
    /// Smallest extent size this write needs to land.
    pub fn min_elements(&self) -> u64 {
        match self {
            Write::Set { end, .. } | Write::Clear { end, .. } => *end,
            Write::Grow { nr_elements } => *nr_elements,
        }
    }
}

/// Something that queues writes for later, atomic, persistence.
pub trait WriteTxn {
    fn enqueue(&mut self, write: Write);
}

impl WriteTxn for Vec<Write> {
    fn enqueue(&mut self, write: Write) {
        self.push(write);
    }
}

//-------------------------------------------------------------------------

/// Batches writes until the caller commits them.  A set or clear that
/// directly follows one of the same kind is merged into it.
#[derive(Default, Debug)]
pub struct Transaction {
    writes: Vec<Write>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    /// Hands every queued write to `storage` as a single atomic batch.
    pub fn commit(self, storage: &dyn BitmapStorage) -> Result<()> {
        if self.writes.is_empty() {
            return Ok(());
        }

        debug!(nr_writes = self.writes.len(), "committing transaction");
        storage.apply(&self.writes)
    }

    /// Throws away the queued writes.  Durable storage is unchanged.
    pub fn abort(self) {
        debug!(nr_writes = self.writes.len(), "aborting transaction");
    }
}

impl WriteTxn for Transaction {
    fn enqueue(&mut self, write: Write) {
        use Write::*;

        if let Some(last) = self.writes.last_mut() {
            match (last, &write) {
                (Set { end, .. }, Set { begin, end: e }) if *end == *begin => {
                    *end = *e;
                    return;
                }
                (Clear { end, .. }, Clear { begin, end: e }) if *end == *begin => {
                    *end = *e;
                    return;
                }
                (Grow { nr_elements }, Grow { nr_elements: n }) => {
                    *nr_elements = (*nr_elements).max(*n);
                    return;
                }
                _ => {}
            }
        }
        self.writes.push(write);
    }
}

//-------------------------------------------------------------------------


//-------------------------------------------------------------------------
