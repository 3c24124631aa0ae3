//! Numeric B+tree (NBTree) of one series.
//!
//! Samples accumulate in an open leaf. A full leaf is written to the block
//! store and a reference to it is pushed into the open superblock one level
//! up; a full superblock is written the same way, and the tree grows by one
//! level whenever the topmost superblock flushes. Nodes are never modified
//! after they are written.
//!
//! ```text
//! level 2      [ sb ]                       (open)
//!              /    \
//! level 1   [sb]   [sb]  ...  [ sb ]        (open)
//!           / \     / \        |
//! level 0  L   L   L   L  ...  L  [ leaf ]  (open)
//! ```
//!
//! The open node of every level is only in memory until
//! [`NBTree::commit`] writes it out; the resulting root list (lowest level
//! first) is what a caller persists to resume the tree later.

mod iter;
mod node;
mod roots;
mod tree;

pub use iter::{Direction, NBTreeCursor, NBTreeIterator, ScanRange, CURSOR_PAGE_SIZE};
pub use node::{
    Aggregate, Leaf, Node, SubtreeRef, Superblock, FANOUT, LEAF_CAPACITY, NODE_HEADER_SIZE,
    NODE_VERSION, SUBTREE_REF_SIZE,
};
pub use roots::NBTreeRootsCollection;
pub use tree::NBTree;

use crate::error::{Result, StorageError};

/// Timestamp of a sample. Ordering is all that matters; the unit is up to
/// the caller.
pub type Timestamp = u64;

/// Identifier of a series.
pub type SeriesId = u64;

/// Outcome of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AppendResult {
    /// The sample is buffered in the open leaf.
    Buffered,
    /// At least one node was written to the block store.
    Flushed,
    /// A flush created a new topmost level; the root list grew.
    NewLevel,
}

/// Configuration for an [`NBTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    /// Samples per leaf before it is flushed (1..=`LEAF_CAPACITY`).
    pub leaf_capacity: usize,
    /// Children per superblock before it is flushed (2..=`FANOUT`).
    pub fanout: usize,
    /// Appends below this timestamp are rejected as late writes.
    pub retention_floor: Timestamp,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            leaf_capacity: LEAF_CAPACITY,
            fanout: FANOUT,
            retention_floor: 0,
        }
    }
}

impl TreeConfig {
    /// Sets the number of samples per leaf.
    pub fn with_leaf_capacity(mut self, leaf_capacity: usize) -> Self {
        self.leaf_capacity = leaf_capacity;
        self
    }

    /// Sets the number of children per superblock.
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    /// Sets the late-write floor.
    pub fn with_retention_floor(mut self, retention_floor: Timestamp) -> Self {
        self.retention_floor = retention_floor;
        self
    }

    /// Checks that the node sizes fit in a block.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::BadArgument` if a size is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.leaf_capacity == 0 || self.leaf_capacity > LEAF_CAPACITY {
            return Err(StorageError::BadArgument(format!(
                "leaf capacity {} not in 1..={}",
                self.leaf_capacity, LEAF_CAPACITY
            )));
        }
        // A fanout of one would flush every new level immediately.
        if self.fanout < 2 || self.fanout > FANOUT {
            return Err(StorageError::BadArgument(format!(
                "fanout {} not in 2..={}",
                self.fanout, FANOUT
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TreeConfig::default();
        assert_eq!(config.leaf_capacity, LEAF_CAPACITY);
        assert_eq!(config.fanout, FANOUT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_bounds() {
        let base = TreeConfig::default();
        assert!(base.with_leaf_capacity(0).validate().is_err());
        let too_large = base.with_leaf_capacity(LEAF_CAPACITY + 1);
        assert!(too_large.validate().is_err());
        assert!(base.with_fanout(1).validate().is_err());
        assert!(base.with_fanout(FANOUT + 1).validate().is_err());

        let smallest = base.with_leaf_capacity(1).with_fanout(2);
        assert!(smallest.validate().is_ok());
    }

    #[test]
    fn test_append_result_ordering() {
        assert!(AppendResult::Buffered < AppendResult::Flushed);
        assert!(AppendResult::Flushed < AppendResult::NewLevel);
    }
}
