//! Block-addressed append-only storage.
//!
//! A [`BlockStore`] hands out opaque [`LogicAddr`] handles for fixed-size
//! [`Block`]s. Two implementations share the contract:
//!
//! - [`FixedSizeFileStorage`]: a ring of fixed-capacity [`Volume`] files
//!   described by a [`MetaVolume`]
//! - [`MemStore`]: an in-memory store for tests and embedding
//!
//! ## Address layout
//!
//! ```text
//! ┌──────────────────────────┬──────────────────────────┐
//! │  generation (u32, high)  │  block offset (u32, low) │
//! └──────────────────────────┴──────────────────────────┘
//! ```
//!
//! The file store bumps a volume's generation every time the ring reclaims
//! it, which is how reads of overwritten blocks are detected as `Stale`.

mod file;
mod memory;
mod meta;
mod volume;

pub use file::FixedSizeFileStorage;
pub use memory::MemStore;
pub use meta::{MetaVolume, VolumeDesc, META_MAGIC, META_VERSION};
pub use volume::Volume;

use crate::error::{Result, StorageError};
use crate::nbtree::SeriesId;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Size of a single block in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Opaque, totally ordered handle to one block inside a [`BlockStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicAddr(u64);

impl LogicAddr {
    /// Placeholder for "no block", used for empty tree levels.
    pub const EMPTY: LogicAddr = LogicAddr(u64::MAX);

    /// Rebuilds an address from its raw persisted form.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value, e.g. for storing roots in a catalog.
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Returns true for [`LogicAddr::EMPTY`].
    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }

    pub(crate) fn from_parts(generation: u32, offset: u32) -> Self {
        Self(((generation as u64) << 32) | offset as u64)
    }

    pub(crate) fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub(crate) fn offset(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for LogicAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "EMPTY")
        } else {
            write!(f, "{:#018x}", self.0)
        }
    }
}

/// A fixed-size byte buffer, the unit of storage and of I/O.
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    data: Box<[u8]>,
}

impl Block {
    /// Creates a zero-filled block.
    pub fn zeroed() -> Self {
        Self {
            data: vec![0u8; BLOCK_SIZE].into_boxed_slice(),
        }
    }

    /// Wraps a buffer that must be exactly [`BLOCK_SIZE`] bytes long.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::BadArgument` on a size mismatch.
    pub fn from_vec(data: Vec<u8>) -> Result<Self> {
        if data.len() != BLOCK_SIZE {
            return Err(StorageError::BadArgument(format!(
                "block size mismatch: expected {}, got {}",
                BLOCK_SIZE,
                data.len()
            )));
        }
        Ok(Self {
            data: data.into_boxed_slice(),
        })
    }

    /// Returns the block contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns the block contents for writing.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block").field("len", &self.data.len()).finish()
    }
}

/// Sync mode for block store durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync volumes on flush (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

/// What happens when every volume is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationPolicy {
    /// Reclaim the oldest volume and keep writing (retention window).
    #[default]
    Ring,
    /// Refuse further appends with `StorageError::StorageFull`.
    Fixed,
}

/// Configuration for block store behavior.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Sync mode applied by `flush`.
    pub sync_mode: SyncMode,
    /// Allocation policy once all capacity is used.
    pub policy: AllocationPolicy,
}

impl StoreConfig {
    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Sets the allocation policy.
    pub fn with_policy(mut self, policy: AllocationPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Usage of a single volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeStats {
    /// Capacity in blocks.
    pub capacity: u32,
    /// Blocks written in the current generation.
    pub nblocks: u32,
    /// Current generation of the volume.
    pub generation: u32,
    /// Remaining space in bytes.
    pub free_space: u64,
}

/// Usage of a whole block store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockStoreStats {
    /// Total capacity in blocks, `None` for an unbounded store.
    pub capacity: Option<u64>,
    /// Blocks currently readable.
    pub used_blocks: u64,
    /// Per-volume usage (empty for in-memory stores).
    pub volumes: Vec<VolumeStats>,
}

/// Tracks which series currently have a live writer on a store.
#[derive(Debug, Default)]
pub struct WriterRegistry {
    active: Mutex<HashSet<SeriesId>>,
}

impl WriterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the writer slot for `series_id`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::WriterConflict` if the slot is already taken.
    pub fn claim(&self, series_id: SeriesId) -> Result<()> {
        let mut active = self.active.lock().unwrap_or_else(|err| err.into_inner());
        if !active.insert(series_id) {
            return Err(StorageError::WriterConflict(series_id));
        }
        Ok(())
    }

    /// Releases the writer slot for `series_id`.
    pub fn release(&self, series_id: SeriesId) {
        let mut active = self.active.lock().unwrap_or_else(|err| err.into_inner());
        active.remove(&series_id);
    }

    /// Returns true if `series_id` has a live writer.
    pub fn is_active(&self, series_id: SeriesId) -> bool {
        let active = self.active.lock().unwrap_or_else(|err| err.into_inner());
        active.contains(&series_id)
    }
}

/// Append/read capability shared by every block store.
///
/// Implementations serialize block allocation internally, so one store may
/// be shared by writers of different series across threads.
pub trait BlockStore: Send + Sync {
    /// Writes one block and returns its address.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::StorageFull` if the allocation policy leaves
    /// no room.
    fn append(&self, block: &Block) -> Result<LogicAddr>;

    /// Reads the block stored at `addr`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` for addresses never issued and
    /// `StorageError::Stale` for addresses whose block was reclaimed.
    fn read(&self, addr: LogicAddr) -> Result<Block>;

    /// Makes every appended block and the allocation state durable.
    fn flush(&self) -> Result<()>;

    /// Returns true if `addr` can currently be read.
    fn exists(&self, addr: LogicAddr) -> bool;

    /// Returns usage statistics.
    fn stats(&self) -> BlockStoreStats;

    /// Returns the single-writer registry of this store.
    fn writers(&self) -> &WriterRegistry;
}

/// Factory for block stores.
pub struct BlockStoreBuilder;

impl BlockStoreBuilder {
    /// Creates an unbounded in-memory store.
    pub fn create_memstore() -> Arc<dyn BlockStore> {
        Arc::new(MemStore::new())
    }

    /// Creates an in-memory store that holds at most `capacity` blocks.
    pub fn create_bounded_memstore(
        capacity: usize,
        policy: AllocationPolicy,
    ) -> Arc<dyn BlockStore> {
        Arc::new(MemStore::with_capacity(capacity, policy))
    }

    /// Opens a durable store from a metavolume and its volume files.
    pub fn open_file_storage<P: AsRef<std::path::Path>>(
        metapath: impl AsRef<std::path::Path>,
        volpaths: &[P],
        config: StoreConfig,
    ) -> Result<Arc<dyn BlockStore>> {
        let store = FixedSizeFileStorage::open_with_config(metapath, volpaths, config)?;
        Ok(Arc::new(store))
    }
}
