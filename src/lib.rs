pub mod allocators;
pub mod bitmap;
pub mod storage;
pub mod transaction;

pub use crate::allocators::{AllocError, Allocator, Key, Regions, Reservation, Result};
pub use crate::storage::{BitmapStorage, FileStorage, FileStorageBuilder, MemStorage};
pub use crate::transaction::{Transaction, Write, WriteTxn};
