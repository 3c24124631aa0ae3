//! Disk-backed block store over a ring of fixed-size volumes.

use super::{
    AllocationPolicy, Block, BlockStore, BlockStoreStats, LogicAddr, MetaVolume, StoreConfig,
    Volume, VolumeStats, WriterRegistry, BLOCK_SIZE,
};
use crate::error::{Result, StorageError};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct FileStoreState {
    meta: MetaVolume,
    volumes: Vec<Volume>,
    /// Index of the volume receiving appends.
    current: usize,
}

impl FileStoreState {
    /// Moves the write position to the next volume in ring order.
    fn advance(&mut self, policy: AllocationPolicy) -> Result<()> {
        let count = self.volumes.len();
        let next = (self.current + 1) % count;
        let desc = self.meta.volumes()[next];

        if desc.nblocks > 0 {
            if policy == AllocationPolicy::Fixed {
                return Err(StorageError::StorageFull);
            }
            // A wrapped generation would no longer map back to this volume.
            let generation = desc
                .generation
                .checked_add(count as u32)
                .ok_or(StorageError::StorageFull)?;
            let reclaimed = self.meta.volume_mut(next);
            reclaimed.generation = generation;
            reclaimed.nblocks = 0;
            info!(
                "Reclaiming volume {} (generation {} -> {})",
                next, desc.generation, generation
            );
        } else {
            info!("Switching to volume {}", next);
        }

        self.current = next;
        // Boundary crossing: the new write position must survive a crash.
        self.meta.persist()
    }

    fn locate(&self, addr: LogicAddr) -> Result<(usize, u32)> {
        if addr.is_empty() {
            return Err(StorageError::NotFound(addr));
        }
        let generation = addr.generation();
        let index = generation as usize % self.volumes.len();
        let desc = self.meta.volumes()[index];

        if generation < desc.generation {
            return Err(StorageError::Stale(addr));
        }
        if generation > desc.generation || addr.offset() >= desc.nblocks {
            return Err(StorageError::NotFound(addr));
        }
        Ok((index, addr.offset()))
    }
}

/// Block store persisting blocks into fixed-capacity volume files.
///
/// Appends fill the current volume sequentially, then move on to the next
/// one in round-robin order. With [`AllocationPolicy::Ring`] a full store
/// reclaims the oldest volume, bounding disk usage to the sum of volume
/// capacities; addresses into the reclaimed volume turn `Stale`.
///
/// The write pointers are persisted on every volume switch and on
/// [`BlockStore::flush`]. Blocks appended after the last flush may be
/// rewritten after a crash, so callers must flush before publishing
/// addresses durably.
#[derive(Debug)]
pub struct FixedSizeFileStorage {
    state: Mutex<FileStoreState>,
    config: StoreConfig,
    writers: WriterRegistry,
}

impl FixedSizeFileStorage {
    /// Creates the volume files and the metavolume for a new store.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::BadArgument` if `volpaths` and `capacities`
    /// differ in length.
    pub fn create<P: AsRef<Path>>(
        metapath: impl AsRef<Path>,
        volpaths: &[P],
        capacities: &[u32],
    ) -> Result<()> {
        if volpaths.len() != capacities.len() {
            return Err(StorageError::BadArgument(format!(
                "{} volume paths for {} capacities",
                volpaths.len(),
                capacities.len()
            )));
        }
        for (path, &capacity) in volpaths.iter().zip(capacities) {
            Volume::create_new(path, capacity)?;
        }
        MetaVolume::create_new(metapath, capacities.len() as u32, capacities)
    }

    /// Opens a store with the default configuration.
    pub fn open<P: AsRef<Path>>(metapath: impl AsRef<Path>, volpaths: &[P]) -> Result<Self> {
        Self::open_with_config(metapath, volpaths, StoreConfig::default())
    }

    /// Opens a store, validating volumes against the metavolume.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Corrupt` if the number of volumes or any
    /// volume's size disagrees with the metavolume.
    pub fn open_with_config<P: AsRef<Path>>(
        metapath: impl AsRef<Path>,
        volpaths: &[P],
        config: StoreConfig,
    ) -> Result<Self> {
        let meta = MetaVolume::open(metapath)?;
        if volpaths.len() != meta.len() {
            return Err(StorageError::Corrupt(format!(
                "metavolume describes {} volumes, {} given",
                meta.len(),
                volpaths.len()
            )));
        }

        let mut volumes = Vec::with_capacity(volpaths.len());
        for (i, path) in volpaths.iter().enumerate() {
            let volume = Volume::open(path)?;
            let expected = meta.volumes()[i].capacity;
            if volume.capacity() != expected {
                return Err(StorageError::Corrupt(format!(
                    "volume {} has {} blocks, metavolume records {}",
                    volume.path().display(),
                    volume.capacity(),
                    expected
                )));
            }
            volumes.push(volume);
        }

        // Resume in the most recently written volume.
        let current = meta
            .volumes()
            .iter()
            .enumerate()
            .filter(|(_, desc)| desc.nblocks > 0)
            .max_by_key(|(_, desc)| desc.generation)
            .map(|(i, _)| i)
            .unwrap_or(0);

        debug!(
            "Opened block store {} with {} volumes, current volume {}",
            meta.path().display(),
            volumes.len(),
            current
        );

        Ok(Self {
            state: Mutex::new(FileStoreState {
                meta,
                volumes,
                current,
            }),
            config,
            writers: WriterRegistry::new(),
        })
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

impl BlockStore for FixedSizeFileStorage {
    fn append(&self, block: &Block) -> Result<LogicAddr> {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        if state.meta.volumes()[state.current].is_full() {
            state.advance(self.config.policy)?;
        }

        let current = state.current;
        let desc = state.meta.volumes()[current];
        state.volumes[current].write_block(desc.nblocks, block)?;
        state.meta.volume_mut(current).nblocks += 1;

        Ok(LogicAddr::from_parts(desc.generation, desc.nblocks))
    }

    fn read(&self, addr: LogicAddr) -> Result<Block> {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        let (index, offset) = state.locate(addr)?;
        state.volumes[index].read_block(offset)
    }

    fn flush(&self) -> Result<()> {
        let state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        for volume in &state.volumes {
            volume.sync(self.config.sync_mode)?;
        }
        state.meta.persist()
    }

    fn exists(&self, addr: LogicAddr) -> bool {
        let state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        state.locate(addr).is_ok()
    }

    fn stats(&self) -> BlockStoreStats {
        let state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        let volumes: Vec<VolumeStats> = state
            .meta
            .volumes()
            .iter()
            .map(|desc| VolumeStats {
                capacity: desc.capacity,
                nblocks: desc.nblocks,
                generation: desc.generation,
                free_space: (desc.capacity - desc.nblocks) as u64 * BLOCK_SIZE as u64,
            })
            .collect();
        BlockStoreStats {
            capacity: Some(volumes.iter().map(|v| v.capacity as u64).sum()),
            used_blocks: volumes.iter().map(|v| v.nblocks as u64).sum(),
            volumes,
        }
    }

    fn writers(&self) -> &WriterRegistry {
        &self.writers
    }
}

impl Drop for FixedSizeFileStorage {
    fn drop(&mut self) {
        // Best effort to persist the write pointers
        if let Err(e) = BlockStore::flush(self) {
            warn!("Failed to flush block store on drop: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::SyncMode;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn create_test_store(temp_dir: &TempDir, capacities: &[u32]) -> (PathBuf, Vec<PathBuf>) {
        let metapath = temp_dir.path().join("metavolume");
        let volpaths: Vec<PathBuf> = (0..capacities.len())
            .map(|i| temp_dir.path().join(format!("volume{}", i)))
            .collect();
        FixedSizeFileStorage::create(&metapath, &volpaths, capacities).unwrap();
        (metapath, volpaths)
    }

    fn test_config() -> StoreConfig {
        StoreConfig::default().with_sync_mode(SyncMode::None)
    }

    fn block_with(byte: u8) -> Block {
        let mut block = Block::zeroed();
        block.as_bytes_mut().fill(byte);
        block
    }

    #[test]
    fn test_append_fills_volumes_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let (metapath, volpaths) = create_test_store(&temp_dir, &[2, 2]);
        let store =
            FixedSizeFileStorage::open_with_config(&metapath, &volpaths, test_config()).unwrap();

        let addrs: Vec<LogicAddr> = (0..4u8)
            .map(|i| store.append(&block_with(i)).unwrap())
            .collect();

        assert_eq!(addrs[0], LogicAddr::from_parts(0, 0));
        assert_eq!(addrs[1], LogicAddr::from_parts(0, 1));
        assert_eq!(addrs[2], LogicAddr::from_parts(1, 0));
        assert_eq!(addrs[3], LogicAddr::from_parts(1, 1));
        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(store.read(*addr).unwrap(), block_with(i as u8));
        }

        let stats = store.stats();
        assert_eq!(stats.capacity, Some(4));
        assert_eq!(stats.used_blocks, 4);
        assert_eq!(stats.volumes[0].free_space, 0);
    }

    #[test]
    fn test_ring_wraparound_makes_old_blocks_stale() {
        let temp_dir = TempDir::new().unwrap();
        let (metapath, volpaths) = create_test_store(&temp_dir, &[2, 2]);
        let store =
            FixedSizeFileStorage::open_with_config(&metapath, &volpaths, test_config()).unwrap();

        let addrs: Vec<LogicAddr> = (0..5u8)
            .map(|i| store.append(&block_with(i)).unwrap())
            .collect();

        // Fifth block reclaimed volume 0.
        assert_eq!(addrs[4], LogicAddr::from_parts(2, 0));
        assert!(matches!(store.read(addrs[0]), Err(StorageError::Stale(_))));
        assert!(matches!(store.read(addrs[1]), Err(StorageError::Stale(_))));
        assert_eq!(store.read(addrs[2]).unwrap(), block_with(2));
        assert_eq!(store.read(addrs[4]).unwrap(), block_with(4));
        assert!(!store.exists(addrs[0]));
        assert_eq!(store.stats().volumes[0].generation, 2);
    }

    #[test]
    fn test_fixed_policy_reports_full() {
        let temp_dir = TempDir::new().unwrap();
        let (metapath, volpaths) = create_test_store(&temp_dir, &[1, 1]);
        let config = test_config().with_policy(AllocationPolicy::Fixed);
        let store = FixedSizeFileStorage::open_with_config(&metapath, &volpaths, config).unwrap();

        assert_eq!(store.config().policy, AllocationPolicy::Fixed);

        store.append(&block_with(1)).unwrap();
        store.append(&block_with(2)).unwrap();
        assert!(matches!(
            store.append(&block_with(3)),
            Err(StorageError::StorageFull)
        ));
    }

    #[test]
    fn test_generation_exhaustion_reports_full() {
        let temp_dir = TempDir::new().unwrap();
        let (metapath, volpaths) = create_test_store(&temp_dir, &[1, 1, 1]);
        {
            // u32::MAX is a valid generation for volume 0 of 3.
            let mut meta = MetaVolume::open(&metapath).unwrap();
            meta.volume_mut(0).generation = u32::MAX;
            for i in 0..3 {
                meta.volume_mut(i).nblocks = 1;
            }
            meta.persist().unwrap();
        }
        let store =
            FixedSizeFileStorage::open_with_config(&metapath, &volpaths, test_config()).unwrap();

        // Volumes 1 and 2 still have generations to spare.
        let first = store.append(&block_with(1)).unwrap();
        let second = store.append(&block_with(2)).unwrap();
        assert_eq!(first, LogicAddr::from_parts(4, 0));
        assert_eq!(second, LogicAddr::from_parts(5, 0));

        for _ in 0..2 {
            assert!(matches!(
                store.append(&block_with(3)),
                Err(StorageError::StorageFull)
            ));
        }
        assert_eq!(store.stats().volumes[0].generation, u32::MAX);
        assert!(store.exists(LogicAddr::from_parts(u32::MAX, 0)));
        assert_eq!(store.read(first).unwrap(), block_with(1));
        assert_eq!(store.read(second).unwrap(), block_with(2));
    }

    #[test]
    fn test_unissued_address_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let (metapath, volpaths) = create_test_store(&temp_dir, &[4]);
        let store =
            FixedSizeFileStorage::open_with_config(&metapath, &volpaths, test_config()).unwrap();
        store.append(&block_with(1)).unwrap();

        assert!(matches!(
            store.read(LogicAddr::from_parts(0, 1)),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.read(LogicAddr::from_parts(1, 0)),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.read(LogicAddr::EMPTY),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_reopen_resumes_write_pointer() {
        let temp_dir = TempDir::new().unwrap();
        let (metapath, volpaths) = create_test_store(&temp_dir, &[2, 2]);

        let first = {
            let store = FixedSizeFileStorage::open_with_config(&metapath, &volpaths, test_config())
                .unwrap();
            let addrs: Vec<LogicAddr> = (0..3u8)
                .map(|i| store.append(&block_with(i)).unwrap())
                .collect();
            store.flush().unwrap();
            addrs
        };

        let store =
            FixedSizeFileStorage::open_with_config(&metapath, &volpaths, test_config()).unwrap();
        let next = store.append(&block_with(9)).unwrap();
        assert_eq!(next, LogicAddr::from_parts(1, 1));
        for (i, addr) in first.iter().enumerate() {
            assert_eq!(store.read(*addr).unwrap(), block_with(i as u8));
        }
    }

    #[test]
    fn test_open_rejects_capacity_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let (metapath, volpaths) = create_test_store(&temp_dir, &[2, 2]);
        Volume::create_new(&volpaths[1], 3).unwrap();

        assert!(matches!(
            FixedSizeFileStorage::open(&metapath, &volpaths),
            Err(StorageError::Corrupt(_))
        ));
    }

    #[test]
    fn test_open_rejects_volume_count_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let (metapath, volpaths) = create_test_store(&temp_dir, &[2, 2]);

        assert!(matches!(
            FixedSizeFileStorage::open(&metapath, &volpaths[..1]),
            Err(StorageError::Corrupt(_))
        ));
    }
}
