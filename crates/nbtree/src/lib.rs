//! Alopex NBTree - append-only time series storage on a block store.
//!
//! This crate stores each series as an append-only tree of fixed-size
//! blocks, written bottom-up as leaves fill, on top of a block store that
//! recycles the oldest storage once its volumes are exhausted.
//!
//! # Components
//!
//! - [`BlockStore`]: append/read of 4 KiB blocks by opaque [`LogicAddr`]
//! - [`FixedSizeFileStorage`]: ring of fixed-capacity volume files plus a metavolume
//! - [`NBTree`]: per-series append-only tree with cascading flushes
//! - [`NBTreeRootsCollection`]: durable root list of one series
//! - [`NBTreeIterator`] / [`NBTreeCursor`]: range scans in either direction
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_nbtree::{BlockStoreBuilder, NBTreeCursor, NBTreeRootsCollection};
//!
//! let bstore = BlockStoreBuilder::create_memstore();
//! let mut collection = NBTreeRootsCollection::new(42, Vec::new(), bstore)?;
//!
//! for i in 0..11u64 {
//!     collection.append(i, i as f64 * 0.1)?;
//! }
//!
//! // Scan [0, 11) forward, one page at a time.
//! let mut cursor = NBTreeCursor::new(collection.tree(), 0, 11)?;
//! while !cursor.is_eof() {
//!     for ix in 0..cursor.size() {
//!         let (ts, value) = cursor.at(ix)?;
//!         println!("{} {}", ts, value);
//!     }
//!     cursor.proceed()?;
//! }
//!
//! // Persist the open buffers and remember the roots.
//! let roots = collection.commit()?.to_vec();
//! ```

#![deny(missing_docs)]

pub mod blockstore;
pub mod error;
pub mod nbtree;

pub use blockstore::{
    AllocationPolicy, Block, BlockStore, BlockStoreBuilder, BlockStoreStats, FixedSizeFileStorage,
    LogicAddr, MemStore, StoreConfig, SyncMode, BLOCK_SIZE,
};
pub use error::{Result, StorageError};
pub use nbtree::{
    Aggregate, AppendResult, Direction, NBTree, NBTreeCursor, NBTreeIterator, NBTreeRootsCollection,
    SeriesId, Timestamp, TreeConfig,
};
