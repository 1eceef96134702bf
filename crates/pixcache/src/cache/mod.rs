//! # Two-tier cache
//!
//! A bounded memory tier in front of a content-addressed disk tier with a
//! persisted metadata index and age/size based eviction.

mod index;
mod key;
mod memory;
mod store;

pub use index::{CacheEntry, CacheIndex, INDEX_FILE_NAME};
pub use key::CacheKey;
pub use memory::{CostFn, EvictFn, MemoryTier};
pub use store::{DiskMemCacheStore, PendingWrite, StoreOptions, SweepReport};
