//! Error and Result types for NBTree storage operations.

use crate::blockstore::LogicAddr;
use crate::nbtree::{SeriesId, Timestamp};
use std::io;
use thiserror::Error;

/// A convenience `Result` type for NBTree storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// The error type for block store and tree operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Malformed argument, e.g. degenerate query bounds or a bad block size.
    #[error("Bad argument: {0}")]
    BadArgument(String),

    /// No block can be allocated under the configured allocation policy.
    #[error("Block store is full")]
    StorageFull,

    /// Append timestamp is below the series' ordering or retention floor.
    #[error("Late write: timestamp {timestamp} is below floor {floor}")]
    LateWrite {
        /// Rejected timestamp.
        timestamp: Timestamp,
        /// Lowest timestamp the series currently accepts.
        floor: Timestamp,
    },

    /// The address was issued once but its block has been reclaimed.
    #[error("Stale address: {0}")]
    Stale(LogicAddr),

    /// The address was never issued by this block store.
    #[error("Address not found: {0}")]
    NotFound(LogicAddr),

    /// On-disk layout is inconsistent with the declared configuration.
    #[error("Corrupt storage: {0}")]
    Corrupt(String),

    /// Invalid magic bytes in a metavolume file.
    #[error("Invalid magic bytes: got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported on-disk format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Stored checksum does not match the computed one.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// Another live writer already owns this series on the same store.
    #[error("Series {0} already has an active writer")]
    WriterConflict(SeriesId),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl StorageError {
    /// Returns true for every flavour of on-disk inconsistency.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corrupt(_)
                | Self::InvalidMagic(_)
                | Self::UnsupportedVersion(_)
                | Self::ChecksumMismatch { .. }
        )
    }

    /// Returns true if a scan may drop the affected subtree and carry on.
    ///
    /// Only reclaimed blocks qualify; everything else means the answer
    /// would be silently wrong.
    pub fn is_recoverable_in_scan(&self) -> bool {
        matches!(self, Self::Stale(_))
    }
}
