//! MetaVolume: durable description of the volume set.
//!
//! ## File Structure
//!
//! ```text
//! Offset  Size    Field
//! ------  ----    -----
//! 0x00    4       magic "AMVL"
//! 0x04    2       version (u16 LE)
//! 0x06    4       volume_count (u32 LE)
//! 0x0A    12*N    per volume: capacity, nblocks, generation (u32 LE each)
//! 0x0A+12N 4      crc32 of all preceding bytes (u32 LE)
//! ```
//!
//! The file is replaced atomically: the new image is written to a sibling
//! `.tmp` file, synced, then renamed over the old one.

use crate::error::{Result, StorageError};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// MetaVolume magic bytes.
pub const META_MAGIC: [u8; 4] = *b"AMVL";

/// MetaVolume format version.
pub const META_VERSION: u16 = 1;

const HEADER_SIZE: usize = 10; // 4 + 2 + 4
const DESC_SIZE: usize = 12;
const CRC_SIZE: usize = 4;

/// Persisted state of one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeDesc {
    /// Capacity in blocks.
    pub capacity: u32,
    /// Write pointer: blocks written in the current generation.
    pub nblocks: u32,
    /// Generation of the blocks currently held by the volume.
    pub generation: u32,
}

impl VolumeDesc {
    /// Returns true if no more blocks fit in the current generation.
    pub fn is_full(&self) -> bool {
        self.nblocks >= self.capacity
    }
}

/// Durable metadata for the set of volumes behind a block store.
#[derive(Debug)]
pub struct MetaVolume {
    path: PathBuf,
    volumes: Vec<VolumeDesc>,
}

impl MetaVolume {
    /// Creates a fresh metavolume file for `volume_count` empty volumes.
    ///
    /// Volume `i` starts at generation `i` with its write pointer at zero.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::BadArgument` if `volume_count` is zero, does not
    /// match `capacities.len()`, or any capacity is zero.
    pub fn create_new(path: impl AsRef<Path>, volume_count: u32, capacities: &[u32]) -> Result<()> {
        if volume_count == 0 || volume_count as usize != capacities.len() {
            return Err(StorageError::BadArgument(format!(
                "volume count {} does not match {} capacities",
                volume_count,
                capacities.len()
            )));
        }
        if capacities.iter().any(|&c| c == 0) {
            return Err(StorageError::BadArgument(
                "volume capacity must be positive".to_string(),
            ));
        }

        let volumes = capacities
            .iter()
            .enumerate()
            .map(|(i, &capacity)| VolumeDesc {
                capacity,
                nblocks: 0,
                generation: i as u32,
            })
            .collect();
        let meta = Self {
            path: path.as_ref().to_path_buf(),
            volumes,
        };
        meta.persist()
    }

    /// Opens and validates an existing metavolume file.
    ///
    /// # Errors
    ///
    /// Returns a corruption error on bad magic, version, size or checksum,
    /// and `StorageError::Corrupt` if a write pointer exceeds its capacity.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = fs::read(&path)?;
        let volumes = Self::decode(&bytes)?;
        Ok(Self { path, volumes })
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + DESC_SIZE * self.volumes.len() + CRC_SIZE);
        buf.extend_from_slice(&META_MAGIC);
        buf.extend_from_slice(&META_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.volumes.len() as u32).to_le_bytes());
        for desc in &self.volumes {
            buf.extend_from_slice(&desc.capacity.to_le_bytes());
            buf.extend_from_slice(&desc.nblocks.to_le_bytes());
            buf.extend_from_slice(&desc.generation.to_le_bytes());
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Vec<VolumeDesc>> {
        if bytes.len() < HEADER_SIZE + CRC_SIZE {
            return Err(StorageError::Corrupt(format!(
                "metavolume too short: {} bytes",
                bytes.len()
            )));
        }

        let magic: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if magic != META_MAGIC {
            return Err(StorageError::InvalidMagic(magic));
        }

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != META_VERSION {
            return Err(StorageError::UnsupportedVersion(version));
        }

        let count = read_u32(bytes, 6) as usize;
        let expected_len = HEADER_SIZE + DESC_SIZE * count + CRC_SIZE;
        if count == 0 || bytes.len() != expected_len {
            return Err(StorageError::Corrupt(format!(
                "metavolume declares {} volumes but has {} bytes",
                count,
                bytes.len()
            )));
        }

        let body_len = expected_len - CRC_SIZE;
        let expected = read_u32(bytes, body_len);
        let actual = crc32fast::hash(&bytes[..body_len]);
        if expected != actual {
            return Err(StorageError::ChecksumMismatch { expected, actual });
        }

        let mut volumes = Vec::with_capacity(count);
        for i in 0..count {
            let base = HEADER_SIZE + i * DESC_SIZE;
            let desc = VolumeDesc {
                capacity: read_u32(bytes, base),
                nblocks: read_u32(bytes, base + 4),
                generation: read_u32(bytes, base + 8),
            };
            if desc.capacity == 0 || desc.nblocks > desc.capacity {
                return Err(StorageError::Corrupt(format!(
                    "volume {} write pointer {} exceeds capacity {}",
                    i, desc.nblocks, desc.capacity
                )));
            }
            if desc.generation as usize % count != i {
                return Err(StorageError::Corrupt(format!(
                    "volume {} has foreign generation {}",
                    i, desc.generation
                )));
            }
            volumes.push(desc);
        }
        Ok(volumes)
    }

    /// Atomically replaces the metavolume file with the current state.
    pub fn persist(&self) -> Result<()> {
        let data = self.encode();
        let tmp_path = self.tmp_path();
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        // fsync directory (rename persistence)
        {
            let dir = File::open(parent_dir(&self.path))?;
            dir.sync_all()?;
        }

        debug!("Persisted metavolume {}", self.path.display());
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Returns the metavolume path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of volumes.
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    /// Returns true if no volumes are described.
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// Returns the descriptors of all volumes.
    pub fn volumes(&self) -> &[VolumeDesc] {
        &self.volumes
    }

    /// Returns the descriptor of volume `index`.
    pub fn volume(&self, index: usize) -> Option<&VolumeDesc> {
        self.volumes.get(index)
    }

    pub(crate) fn volume_mut(&mut self, index: usize) -> &mut VolumeDesc {
        &mut self.volumes[index]
    }
}

/// Directory holding `path`. A bare file name lives in the working directory.
fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_meta_create_and_open() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metavolume");

        MetaVolume::create_new(&path, 2, &[8, 16]).unwrap();
        let meta = MetaVolume::open(&path).unwrap();

        assert_eq!(meta.len(), 2);
        assert_eq!(
            meta.volumes(),
            &[
                VolumeDesc {
                    capacity: 8,
                    nblocks: 0,
                    generation: 0,
                },
                VolumeDesc {
                    capacity: 16,
                    nblocks: 0,
                    generation: 1,
                },
            ]
        );
        assert!(!path.with_file_name("metavolume.tmp").exists());
    }

    #[test]
    fn test_meta_persist_write_pointer() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metavolume");
        MetaVolume::create_new(&path, 2, &[8, 8]).unwrap();

        {
            let mut meta = MetaVolume::open(&path).unwrap();
            meta.volume_mut(0).nblocks = 8;
            meta.volume_mut(1).nblocks = 3;
            meta.persist().unwrap();
        }

        let meta = MetaVolume::open(&path).unwrap();
        assert!(meta.volume(0).unwrap().is_full());
        assert_eq!(meta.volume(1).unwrap().nblocks, 3);
    }

    #[test]
    fn test_meta_count_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metavolume");
        assert!(matches!(
            MetaVolume::create_new(&path, 3, &[8, 8]),
            Err(StorageError::BadArgument(_))
        ));
        assert!(matches!(
            MetaVolume::create_new(&path, 0, &[]),
            Err(StorageError::BadArgument(_))
        ));
    }

    #[test]
    fn test_meta_checksum_detects_damage() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metavolume");
        MetaVolume::create_new(&path, 1, &[8]).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_SIZE] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = MetaVolume::open(&path).unwrap_err();
        assert!(matches!(err, StorageError::ChecksumMismatch { .. }));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_meta_invalid_magic() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metavolume");
        MetaVolume::create_new(&path, 1, &[8]).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[0..4].copy_from_slice(b"XXXX");
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            MetaVolume::open(&path),
            Err(StorageError::InvalidMagic(_))
        ));
    }

    /// Overwrites bytes at `at` and reseals the file with a valid checksum.
    fn reseal(path: &Path, at: usize, patch: &[u8]) {
        let mut bytes = fs::read(path).unwrap();
        bytes[at..at + patch.len()].copy_from_slice(patch);
        let body_len = bytes.len() - CRC_SIZE;
        let crc = crc32fast::hash(&bytes[..body_len]);
        bytes[body_len..].copy_from_slice(&crc.to_le_bytes());
        fs::write(path, &bytes).unwrap();
    }

    #[test]
    fn test_meta_unsupported_version() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metavolume");
        MetaVolume::create_new(&path, 1, &[8]).unwrap();

        reseal(&path, 4, &2u16.to_le_bytes());

        let err = MetaVolume::open(&path).unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedVersion(2)));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_meta_write_pointer_past_capacity() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metavolume");
        MetaVolume::create_new(&path, 1, &[8]).unwrap();

        // Write pointer of volume 0.
        reseal(&path, HEADER_SIZE + 4, &9u32.to_le_bytes());

        assert!(matches!(
            MetaVolume::open(&path),
            Err(StorageError::Corrupt(_))
        ));
    }

    #[test]
    fn test_meta_foreign_generation() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metavolume");
        MetaVolume::create_new(&path, 2, &[8, 8]).unwrap();

        // Generation 1 belongs to volume 1, not volume 0.
        reseal(&path, HEADER_SIZE + 8, &1u32.to_le_bytes());

        let err = MetaVolume::open(&path).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
        assert!(err.to_string().contains("foreign generation 1"));
    }

    #[test]
    fn test_meta_parent_dir() {
        assert_eq!(parent_dir(Path::new("metavolume")), Path::new("."));
        assert_eq!(parent_dir(Path::new("data/metavolume")), Path::new("data"));
        assert_eq!(parent_dir(Path::new("/metavolume")), Path::new("/"));
    }

    #[test]
    fn test_meta_truncated_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metavolume");
        MetaVolume::create_new(&path, 2, &[8, 8]).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 6]).unwrap();

        assert!(matches!(
            MetaVolume::open(&path),
            Err(StorageError::Corrupt(_))
        ));
    }
}
