//! Fixed-capacity volume file.
//!
//! A volume is a plain file of `capacity * BLOCK_SIZE` bytes. It carries no
//! header; its write pointer lives in the [`MetaVolume`](super::MetaVolume).

use super::{Block, SyncMode, BLOCK_SIZE};
use crate::error::{Result, StorageError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A single fixed-capacity container of uniformly sized blocks.
#[derive(Debug)]
pub struct Volume {
    file: File,
    path: PathBuf,
    capacity: u32,
}

impl Volume {
    /// Creates a zero-filled volume file holding `capacity` blocks.
    ///
    /// An existing file at `path` is truncated.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::BadArgument` for a zero capacity, or an I/O
    /// error if the file cannot be created.
    pub fn create_new(path: impl AsRef<Path>, capacity: u32) -> Result<()> {
        if capacity == 0 {
            return Err(StorageError::BadArgument(
                "volume capacity must be positive".to_string(),
            ));
        }
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(capacity as u64 * BLOCK_SIZE as u64)?;
        file.sync_all()?;

        debug!("Created volume {} with {} blocks", path.display(), capacity);
        Ok(())
    }

    /// Opens an existing volume file.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Corrupt` if the file size is not a positive
    /// multiple of `BLOCK_SIZE`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();

        if size == 0 || size % BLOCK_SIZE as u64 != 0 {
            return Err(StorageError::Corrupt(format!(
                "volume {} has invalid size {}",
                path.display(),
                size
            )));
        }
        let blocks = size / BLOCK_SIZE as u64;
        let capacity = u32::try_from(blocks).map_err(|_| {
            StorageError::Corrupt(format!(
                "volume {} is too large ({} blocks)",
                path.display(),
                blocks
            ))
        })?;

        Ok(Self {
            file,
            path,
            capacity,
        })
    }

    /// Returns the capacity in blocks.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn seek_to(&mut self, offset: u32) -> Result<()> {
        if offset >= self.capacity {
            return Err(StorageError::BadArgument(format!(
                "block offset {} out of range for volume of {} blocks",
                offset, self.capacity
            )));
        }
        self.file
            .seek(SeekFrom::Start(offset as u64 * BLOCK_SIZE as u64))?;
        Ok(())
    }

    /// Writes `block` at block `offset`.
    pub fn write_block(&mut self, offset: u32, block: &Block) -> Result<()> {
        self.seek_to(offset)?;
        self.file.write_all(block.as_bytes())?;
        Ok(())
    }

    /// Reads the block at block `offset`.
    pub fn read_block(&mut self, offset: u32) -> Result<Block> {
        self.seek_to(offset)?;
        let mut block = Block::zeroed();
        self.file.read_exact(block.as_bytes_mut())?;
        Ok(block)
    }

    /// Makes written blocks durable according to `mode`.
    pub fn sync(&self, mode: SyncMode) -> Result<()> {
        match mode {
            SyncMode::Fsync => self.file.sync_all()?,
            SyncMode::Fdatasync => self.file.sync_data()?,
            SyncMode::None => {}
        }
        Ok(())
    }
}
