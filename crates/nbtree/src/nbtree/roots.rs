//! Durable root list of one series.

use super::iter::NBTreeIterator;
use super::tree::NBTree;
use super::{AppendResult, SeriesId, Timestamp, TreeConfig};
use crate::blockstore::{BlockStore, LogicAddr};
use crate::error::{Result, StorageError};
use std::sync::Arc;
use tracing::info;

/// An [`NBTree`] together with the root list a caller persists for it.
///
/// The roots are rewritten by [`commit`](Self::commit) and automatically
/// whenever the tree grows a level. Dropping the collection does not
/// commit; buffered samples since the last commit are lost unless the
/// caller commits first.
#[derive(Debug)]
pub struct NBTreeRootsCollection {
    tree: NBTree,
    roots: Vec<LogicAddr>,
    dirty: bool,
}

impl NBTreeRootsCollection {
    /// Opens the series `id` from `roots` (lowest level first, may be empty)
    /// with the default tree configuration.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::WriterConflict` if the series already has a
    /// live writer, or the error of an unreadable or mismatched root.
    pub fn new(id: SeriesId, roots: Vec<LogicAddr>, bstore: Arc<dyn BlockStore>) -> Result<Self> {
        Self::with_config(id, roots, bstore, TreeConfig::default())
    }

    /// Opens the series `id` from `roots` with `config`.
    pub fn with_config(
        id: SeriesId,
        roots: Vec<LogicAddr>,
        bstore: Arc<dyn BlockStore>,
        config: TreeConfig,
    ) -> Result<Self> {
        let tree = NBTree::open(id, &roots, bstore, config)?;
        Ok(Self {
            tree,
            roots,
            dirty: false,
        })
    }

    /// Returns the series id.
    pub fn series_id(&self) -> SeriesId {
        self.tree.id()
    }

    /// Returns the live tree.
    pub fn tree(&self) -> &NBTree {
        &self.tree
    }

    /// Returns the roots as of the last commit.
    pub fn roots(&self) -> &[LogicAddr] {
        &self.roots
    }

    /// Appends one sample, committing if the tree grew a level.
    pub fn append(&mut self, timestamp: Timestamp, value: f64) -> Result<AppendResult> {
        let result = match self.tree.append(timestamp, value) {
            Ok(result) => result,
            // Rejected before touching the tree.
            Err(err @ StorageError::LateWrite { .. }) => return Err(err),
            // A failed flush may still have buffered the sample.
            Err(err) => {
                self.dirty = true;
                return Err(err);
            }
        };
        self.dirty = true;
        if result == AppendResult::NewLevel {
            self.commit()?;
            info!(
                "Series {} committed {} roots after growing",
                self.tree.id(),
                self.roots.len()
            );
        }
        Ok(result)
    }

    /// Starts a scan over the live tree; see [`NBTree::search`].
    pub fn search(&self, begin: Timestamp, end: Timestamp) -> Result<NBTreeIterator> {
        self.tree.search(begin, end)
    }

    /// Writes the open nodes and returns the new root list.
    ///
    /// Does nothing if no sample was appended since the last commit.
    pub fn commit(&mut self) -> Result<&[LogicAddr]> {
        if self.dirty || self.roots.is_empty() {
            self.roots = self.tree.commit()?;
            self.dirty = false;
        }
        Ok(&self.roots)
    }
}
