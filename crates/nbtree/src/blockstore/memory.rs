//! In-memory block store.

use super::{AllocationPolicy, Block, BlockStore, BlockStoreStats, LogicAddr, WriterRegistry};
use crate::error::{Result, StorageError};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct MemStoreState {
    /// Retained blocks, oldest first.
    blocks: VecDeque<Block>,
    /// Address of `blocks[0]`.
    first: u64,
}

/// Block store backed by memory.
///
/// Addresses are sequential block numbers. Unbounded by default; a bounded
/// store either drops its oldest block (`Ring`) or refuses appends
/// (`Fixed`) once `capacity` blocks are held.
#[derive(Debug)]
pub struct MemStore {
    state: Mutex<MemStoreState>,
    capacity: Option<usize>,
    policy: AllocationPolicy,
    writers: WriterRegistry,
}

impl MemStore {
    /// Creates an unbounded store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemStoreState::default()),
            capacity: None,
            policy: AllocationPolicy::Ring,
            writers: WriterRegistry::new(),
        }
    }

    /// Creates a store holding at most `capacity` blocks.
    pub fn with_capacity(capacity: usize, policy: AllocationPolicy) -> Self {
        Self {
            state: Mutex::new(MemStoreState::default()),
            capacity: Some(capacity),
            policy,
            writers: WriterRegistry::new(),
        }
    }

    fn check(state: &MemStoreState, addr: LogicAddr) -> Result<usize> {
        let raw = addr.to_raw();
        if addr.is_empty() || raw >= state.first + state.blocks.len() as u64 {
            return Err(StorageError::NotFound(addr));
        }
        if raw < state.first {
            return Err(StorageError::Stale(addr));
        }
        Ok((raw - state.first) as usize)
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemStore {
    fn append(&self, block: &Block) -> Result<LogicAddr> {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(capacity) = self.capacity {
            if state.blocks.len() >= capacity {
                match self.policy {
                    AllocationPolicy::Fixed => return Err(StorageError::StorageFull),
                    AllocationPolicy::Ring => {
                        if state.blocks.pop_front().is_none() {
                            return Err(StorageError::StorageFull);
                        }
                        state.first += 1;
                    }
                }
            }
        }
        let addr = LogicAddr::from_raw(state.first + state.blocks.len() as u64);
        state.blocks.push_back(block.clone());
        Ok(addr)
    }

    fn read(&self, addr: LogicAddr) -> Result<Block> {
        let state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        let index = Self::check(&state, addr)?;
        Ok(state.blocks[index].clone())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn exists(&self, addr: LogicAddr) -> bool {
        let state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        Self::check(&state, addr).is_ok()
    }

    fn stats(&self) -> BlockStoreStats {
        let state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        BlockStoreStats {
            capacity: self.capacity.map(|c| c as u64),
            used_blocks: state.blocks.len() as u64,
            volumes: Vec::new(),
        }
    }

    fn writers(&self) -> &WriterRegistry {
        &self.writers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_with(byte: u8) -> Block {
        let mut block = Block::zeroed();
        block.as_bytes_mut().fill(byte);
        block
    }

    #[test]
    fn test_memstore_append_read() {
        let store = MemStore::new();
        let a = store.append(&block_with(1)).unwrap();
        let b = store.append(&block_with(2)).unwrap();
        assert!(a < b);
        assert_eq!(store.read(a).unwrap(), block_with(1));
        assert_eq!(store.read(b).unwrap(), block_with(2));
        assert_eq!(store.stats().used_blocks, 2);
        assert_eq!(store.stats().capacity, None);
    }

    #[test]
    fn test_memstore_not_found() {
        let store = MemStore::new();
        store.append(&block_with(1)).unwrap();
        let missing = LogicAddr::from_raw(10);
        assert!(matches!(
            store.read(missing),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.read(LogicAddr::EMPTY),
            Err(StorageError::NotFound(_))
        ));
        assert!(!store.exists(missing));
    }

    #[test]
    fn test_memstore_ring_reclaims_oldest() {
        let store = MemStore::with_capacity(2, AllocationPolicy::Ring);
        let a = store.append(&block_with(1)).unwrap();
        let b = store.append(&block_with(2)).unwrap();
        let c = store.append(&block_with(3)).unwrap();

        assert!(matches!(store.read(a), Err(StorageError::Stale(_))));
        assert_eq!(store.read(b).unwrap(), block_with(2));
        assert_eq!(store.read(c).unwrap(), block_with(3));
        assert_eq!(store.stats().used_blocks, 2);
    }

    #[test]
    fn test_memstore_fixed_reports_full() {
        let store = MemStore::with_capacity(1, AllocationPolicy::Fixed);
        store.append(&block_with(1)).unwrap();
        assert!(matches!(
            store.append(&block_with(2)),
            Err(StorageError::StorageFull)
        ));
    }

    #[test]
    fn test_memstore_zero_capacity_ring_is_full() {
        let store = MemStore::with_capacity(0, AllocationPolicy::Ring);
        assert!(matches!(
            store.append(&block_with(1)),
            Err(StorageError::StorageFull)
        ));
    }
}
