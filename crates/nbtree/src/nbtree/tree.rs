//! Append path of an NBTree.

use super::iter::{NBTreeIterator, Pending, ScanRange};
use super::node::{Aggregate, Leaf, Node, SubtreeRef, Superblock};
use super::{AppendResult, SeriesId, Timestamp, TreeConfig};
use crate::blockstore::{BlockStore, LogicAddr};
use crate::error::{Result, StorageError};
use std::sync::Arc;
use tracing::{debug, info};

/// Writer slot of one series, released on drop.
struct WriterClaim {
    bstore: Arc<dyn BlockStore>,
    series_id: SeriesId,
}

impl WriterClaim {
    fn acquire(bstore: &Arc<dyn BlockStore>, series_id: SeriesId) -> Result<Self> {
        bstore.writers().claim(series_id)?;
        Ok(Self {
            bstore: Arc::clone(bstore),
            series_id,
        })
    }
}

impl Drop for WriterClaim {
    fn drop(&mut self) {
        self.bstore.writers().release(self.series_id);
    }
}

/// Append-only tree of one series.
///
/// Only the open node of each level lives in memory. Samples must arrive
/// in non-decreasing timestamp order; a store admits one live `NBTree` per
/// series.
pub struct NBTree {
    id: SeriesId,
    bstore: Arc<dyn BlockStore>,
    config: TreeConfig,
    /// Open leaf (level 0).
    leaf: Leaf,
    /// Open superblocks; `levels[0]` is level 1.
    levels: Vec<Superblock>,
    last_timestamp: Option<Timestamp>,
    _claim: WriterClaim,
}

impl std::fmt::Debug for NBTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NBTree")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("height", &self.height())
            .field("buffered", &self.leaf.len())
            .field("last_timestamp", &self.last_timestamp)
            .finish()
    }
}

impl NBTree {
    /// Creates an empty tree with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::WriterConflict` if the series already has a
    /// live writer on `bstore`.
    pub fn new(id: SeriesId, bstore: Arc<dyn BlockStore>) -> Result<Self> {
        Self::with_config(id, bstore, TreeConfig::default())
    }

    /// Creates an empty tree.
    pub fn with_config(
        id: SeriesId,
        bstore: Arc<dyn BlockStore>,
        config: TreeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let claim = WriterClaim::acquire(&bstore, id)?;
        Ok(Self {
            id,
            bstore,
            config,
            leaf: Leaf::new(id),
            levels: Vec::new(),
            last_timestamp: None,
            _claim: claim,
        })
    }

    /// Resumes a tree from the roots returned by an earlier
    /// [`commit`](Self::commit).
    ///
    /// Each root becomes the open node of its level again, so appends
    /// continue filling the partial nodes written by the commit.
    ///
    /// # Errors
    ///
    /// Returns the read error of any unreadable root, and
    /// `StorageError::Corrupt` if a root belongs to another series or sits
    /// on the wrong level.
    pub fn open(
        id: SeriesId,
        roots: &[LogicAddr],
        bstore: Arc<dyn BlockStore>,
        config: TreeConfig,
    ) -> Result<Self> {
        let mut tree = Self::with_config(id, bstore, config)?;

        for (level, &addr) in roots.iter().enumerate() {
            if addr.is_empty() {
                if level > 0 {
                    tree.levels.push(Superblock::new(id, level as u16));
                }
                continue;
            }

            let node = Node::decode(&tree.bstore.read(addr)?)?;
            if node.series_id() != id {
                return Err(StorageError::Corrupt(format!(
                    "root {} belongs to series {}, expected {}",
                    addr,
                    node.series_id(),
                    id
                )));
            }
            if node.level() as usize != level {
                return Err(StorageError::Corrupt(format!(
                    "root {} is on level {}, expected {}",
                    addr,
                    node.level(),
                    level
                )));
            }

            let agg = node.aggregate();
            if !agg.is_empty() {
                let last = tree.last_timestamp.map_or(agg.end, |ts| ts.max(agg.end));
                tree.last_timestamp = Some(last);
            }
            match node {
                Node::Leaf(leaf) => tree.leaf = leaf,
                Node::Superblock(sb) => tree.levels.push(sb),
            }
        }

        debug!(
            "Opened series {} with {} levels, last timestamp {:?}",
            id,
            tree.height(),
            tree.last_timestamp
        );
        Ok(tree)
    }

    /// Returns the series id.
    pub fn id(&self) -> SeriesId {
        self.id
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Returns the block store the tree writes to.
    pub fn bstore(&self) -> &Arc<dyn BlockStore> {
        &self.bstore
    }

    /// Returns the number of levels, counting the leaf level.
    pub fn height(&self) -> usize {
        self.levels.len() + 1
    }

    /// Returns the newest appended timestamp.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.last_timestamp
    }

    /// Raises the late-write floor. Lowering it is ignored.
    pub fn set_retention_floor(&mut self, floor: Timestamp) {
        self.config.retention_floor = self.config.retention_floor.max(floor);
    }

    fn check_timestamp(&self, timestamp: Timestamp) -> Result<()> {
        let floor = match self.last_timestamp {
            Some(last) => last.max(self.config.retention_floor),
            None => self.config.retention_floor,
        };
        if timestamp < floor {
            return Err(StorageError::LateWrite { timestamp, floor });
        }
        Ok(())
    }

    /// Appends one sample.
    ///
    /// If writing a full node fails, the sample stays buffered and the
    /// write is retried by the next append or commit.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::LateWrite` if `timestamp` is older than the
    /// newest sample or the retention floor, and block store errors such as
    /// `StorageError::StorageFull` from a flush.
    pub fn append(&mut self, timestamp: Timestamp, value: f64) -> Result<AppendResult> {
        self.check_timestamp(timestamp)?;

        // A node left full by an earlier failed flush must go first.
        let pending = self.cascade()?;

        self.leaf.push(timestamp, value);
        self.last_timestamp = Some(timestamp);

        Ok(pending.max(self.cascade()?))
    }

    /// Writes every full open node and pushes its reference one level up.
    fn cascade(&mut self) -> Result<AppendResult> {
        let mut result = AppendResult::Buffered;

        if self.leaf.len() >= self.config.leaf_capacity {
            let addr = self.bstore.append(&self.leaf.encode()?)?;
            let agg = self.leaf.aggregate();
            debug!(
                "Flushed leaf of series {} ({} samples) to {}",
                self.id,
                self.leaf.len(),
                addr
            );
            self.leaf = Leaf::new(self.id);
            result = result.max(self.push_ref(0, SubtreeRef { addr, agg }));
        }

        // Pushing into level i + 1 is handled on the next iteration.
        let mut i = 0;
        while i < self.levels.len() {
            if self.levels[i].len() >= self.config.fanout {
                let node = &self.levels[i];
                let addr = self.bstore.append(&node.encode()?)?;
                let agg = node.aggregate();
                let level = node.level();
                debug!(
                    "Flushed level {} superblock of series {} to {}",
                    level, self.id, addr
                );
                self.levels[i] = Superblock::new(self.id, level);
                result = result.max(self.push_ref(i + 1, SubtreeRef { addr, agg }));
            }
            i += 1;
        }

        Ok(result)
    }

    /// Pushes a child reference into `levels[index]`, creating that level if
    /// needed.
    fn push_ref(&mut self, index: usize, child: SubtreeRef) -> AppendResult {
        let mut result = AppendResult::Flushed;
        if index == self.levels.len() {
            let level = (index + 1) as u16;
            info!("Series {} grew to {} levels", self.id, level as usize + 1);
            self.levels.push(Superblock::new(self.id, level));
            result = AppendResult::NewLevel;
        }
        self.levels[index].push(child);
        result
    }

    /// Writes the open nodes and returns the root list, lowest level first.
    ///
    /// Empty levels are reported as `LogicAddr::EMPTY`. The open nodes stay
    /// in memory, so appends continue where they left off; the block store
    /// is flushed before returning.
    pub fn commit(&mut self) -> Result<Vec<LogicAddr>> {
        self.cascade()?;

        let mut roots = Vec::with_capacity(self.height());
        roots.push(if self.leaf.is_empty() {
            LogicAddr::EMPTY
        } else {
            self.bstore.append(&self.leaf.encode()?)?
        });
        for sb in &self.levels {
            roots.push(if sb.is_empty() {
                LogicAddr::EMPTY
            } else {
                self.bstore.append(&sb.encode()?)?
            });
        }
        self.bstore.flush()?;

        debug!("Committed series {} with roots {:?}", self.id, roots);
        Ok(roots)
    }

    /// Starts a scan over the live tree.
    ///
    /// `begin < end` scans `[begin, end)` in ascending order; `begin > end`
    /// scans `(end, begin]` in descending order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::BadArgument` if `begin == end`.
    pub fn search(&self, begin: Timestamp, end: Timestamp) -> Result<NBTreeIterator> {
        let range = ScanRange::new(begin, end)?;

        // The highest open level holds the oldest samples.
        let mut roots: Vec<Pending> = self
            .levels
            .iter()
            .rev()
            .filter(|sb| !sb.is_empty())
            .map(|sb| Pending::Loaded(Node::Superblock(sb.clone())))
            .collect();
        if !self.leaf.is_empty() {
            roots.push(Pending::Loaded(Node::Leaf(self.leaf.clone())));
        }
        if range.is_backward() {
            roots.reverse();
        }

        Ok(NBTreeIterator::new(Arc::clone(&self.bstore), range, roots))
    }

    /// Returns the aggregate of every sample in the tree.
    pub fn aggregate(&self) -> Aggregate {
        let mut agg = Aggregate::new();
        for sb in self.levels.iter().rev() {
            agg.combine(&sb.aggregate());
        }
        agg.combine(&self.leaf.aggregate());
        agg
    }
}
