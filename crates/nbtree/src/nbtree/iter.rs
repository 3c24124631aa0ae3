//! Range scans over an NBTree.
//!
//! A scan walks the roots in time order and descends depth-first, skipping
//! every child whose aggregate does not intersect the range. Leaves are
//! decoded one at a time into a page buffer that `read` drains.

use super::node::{Aggregate, Node};
use super::tree::NBTree;
use super::Timestamp;
use crate::blockstore::{BlockStore, LogicAddr};
use crate::error::{Result, StorageError};
use std::sync::Arc;
use tracing::warn;

/// Number of samples an [`NBTreeCursor`] loads per page.
pub const CURSOR_PAGE_SIZE: usize = 1024;

/// Scan direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending timestamps.
    Forward,
    /// Descending timestamps.
    Backward,
}

/// Half-open timestamp range with a direction.
///
/// `ScanRange::new(begin, end)` with `begin < end` covers `[begin, end)`
/// ascending; with `begin > end` it covers `(end, begin]` descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRange {
    begin: Timestamp,
    end: Timestamp,
    direction: Direction,
}

impl ScanRange {
    /// Creates a range.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::BadArgument` if `begin == end`.
    pub fn new(begin: Timestamp, end: Timestamp) -> Result<Self> {
        let direction = match begin.cmp(&end) {
            std::cmp::Ordering::Less => Direction::Forward,
            std::cmp::Ordering::Greater => Direction::Backward,
            std::cmp::Ordering::Equal => {
                return Err(StorageError::BadArgument(format!(
                    "empty scan range [{}, {})",
                    begin, end
                )))
            }
        };
        Ok(Self {
            begin,
            end,
            direction,
        })
    }

    /// Returns the first bound as given.
    pub fn begin(&self) -> Timestamp {
        self.begin
    }

    /// Returns the second bound as given.
    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Returns the scan direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns true for a descending scan.
    pub fn is_backward(&self) -> bool {
        self.direction == Direction::Backward
    }

    /// Returns true if `ts` lies inside the range.
    pub fn contains(&self, ts: Timestamp) -> bool {
        match self.direction {
            Direction::Forward => self.begin <= ts && ts < self.end,
            Direction::Backward => self.end < ts && ts <= self.begin,
        }
    }

    /// Returns true if any sample summarized by `agg` may lie inside the
    /// range.
    pub fn overlaps(&self, agg: &Aggregate) -> bool {
        if agg.is_empty() {
            return false;
        }
        match self.direction {
            Direction::Forward => agg.end >= self.begin && agg.begin < self.end,
            Direction::Backward => agg.end > self.end && agg.begin <= self.begin,
        }
    }
}

/// Node waiting to be visited.
#[derive(Debug)]
pub(crate) enum Pending {
    /// Already in memory (open nodes of a live tree).
    Loaded(Node),
    /// Still in the block store. A failed read of a `required` node always
    /// surfaces; otherwise a `Stale` child is skipped.
    Addr { addr: LogicAddr, required: bool },
}

/// Pull-based scan over a range of one series.
///
/// Single use and single direction. Also an
/// `Iterator<Item = Result<(Timestamp, f64)>>`.
pub struct NBTreeIterator {
    bstore: Arc<dyn BlockStore>,
    range: ScanRange,
    /// Nodes still to visit; the next one is on top.
    stack: Vec<Pending>,
    /// Matching samples of the current leaf, in scan order.
    page: Vec<(Timestamp, f64)>,
    pos: usize,
}

impl std::fmt::Debug for NBTreeIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NBTreeIterator")
            .field("range", &self.range)
            .field("pending_nodes", &self.stack.len())
            .field("buffered", &(self.page.len() - self.pos))
            .finish()
    }
}

impl NBTreeIterator {
    /// `roots` must be in scan order.
    pub(crate) fn new(bstore: Arc<dyn BlockStore>, range: ScanRange, roots: Vec<Pending>) -> Self {
        let mut stack = roots;
        stack.reverse();
        Self {
            bstore,
            range,
            stack,
            page: Vec::new(),
            pos: 0,
        }
    }

    /// Scans a committed root list (lowest level first) without a live
    /// writer.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::BadArgument` if `begin == end`. Unreadable
    /// roots are reported by the first read that reaches them.
    pub fn from_roots(
        bstore: Arc<dyn BlockStore>,
        roots: &[LogicAddr],
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<Self> {
        let range = ScanRange::new(begin, end)?;
        let mut pending: Vec<Pending> = roots
            .iter()
            .rev()
            .filter(|addr| !addr.is_empty())
            .map(|&addr| Pending::Addr {
                addr,
                required: true,
            })
            .collect();
        if range.is_backward() {
            pending.reverse();
        }
        Ok(Self::new(bstore, range, pending))
    }

    /// Returns the scanned range.
    pub fn range(&self) -> &ScanRange {
        &self.range
    }

    /// Fills the buffers with the next samples and returns how many were
    /// written.
    ///
    /// Fewer than `min(timestamps.len(), values.len())` samples are written
    /// only at the end of the scan; a later call then returns 0.
    ///
    /// # Errors
    ///
    /// Returns any block store or decode error other than a `Stale` child.
    pub fn read(&mut self, timestamps: &mut [Timestamp], values: &mut [f64]) -> Result<usize> {
        let max = timestamps.len().min(values.len());
        let mut written = 0;
        while written < max {
            if self.pos >= self.page.len() && !self.load_next_page()? {
                break;
            }
            let take = (self.page.len() - self.pos).min(max - written);
            for (k, &(ts, value)) in self.page[self.pos..self.pos + take].iter().enumerate() {
                timestamps[written + k] = ts;
                values[written + k] = value;
            }
            self.pos += take;
            written += take;
        }
        Ok(written)
    }

    /// Walks the stack until a leaf yields samples. Returns false once the
    /// scan is exhausted.
    fn load_next_page(&mut self) -> Result<bool> {
        while let Some(pending) = self.stack.pop() {
            let node = match pending {
                Pending::Loaded(node) => node,
                Pending::Addr { addr, required } => {
                    let loaded = self.bstore.read(addr).and_then(|b| Node::decode(&b));
                    match loaded {
                        Ok(node) => node,
                        Err(err) if !required && err.is_recoverable_in_scan() => {
                            warn!("Skipping subtree at {}: {}", addr, err);
                            continue;
                        }
                        Err(err) => return Err(err),
                    }
                }
            };

            match node {
                Node::Leaf(leaf) => {
                    self.page.clear();
                    self.pos = 0;
                    let values = leaf.values().iter().copied();
                    let samples = leaf.timestamps().iter().copied().zip(values);
                    let range = self.range;
                    let in_range = |&(ts, _): &(Timestamp, f64)| range.contains(ts);
                    match range.direction() {
                        Direction::Forward => self.page.extend(samples.filter(in_range)),
                        Direction::Backward => self.page.extend(samples.rev().filter(in_range)),
                    }
                    if !self.page.is_empty() {
                        return Ok(true);
                    }
                }
                Node::Superblock(sb) => {
                    let children = sb
                        .refs()
                        .iter()
                        .filter(|child| self.range.overlaps(&child.agg))
                        .map(|child| Pending::Addr {
                            addr: child.addr,
                            required: false,
                        });
                    // The stack pops from the end, so the first child to
                    // visit is pushed last.
                    match self.range.direction() {
                        Direction::Forward => {
                            let children: Vec<_> = children.collect();
                            self.stack.extend(children.into_iter().rev());
                        }
                        Direction::Backward => self.stack.extend(children),
                    }
                }
            }
        }
        Ok(false)
    }
}

impl Iterator for NBTreeIterator {
    type Item = Result<(Timestamp, f64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.page.len() {
            match self.load_next_page() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(err) => return Some(Err(err)),
            }
        }
        let sample = self.page[self.pos];
        self.pos += 1;
        Some(Ok(sample))
    }
}

/// Paged cursor over a scan.
///
/// Each page holds up to [`CURSOR_PAGE_SIZE`] samples; `proceed` loads the
/// next one. The cursor is at end of stream once a page comes back empty.
#[derive(Debug)]
pub struct NBTreeCursor {
    iter: NBTreeIterator,
    timestamps: Vec<Timestamp>,
    values: Vec<f64>,
    size: usize,
    eof: bool,
}

impl NBTreeCursor {
    /// Opens a cursor over a live tree and loads the first page.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::BadArgument` if `begin == end`, or the error
    /// of the first page load.
    pub fn new(tree: &NBTree, begin: Timestamp, end: Timestamp) -> Result<Self> {
        Self::from_iterator(tree.search(begin, end)?)
    }

    /// Wraps an iterator and loads the first page.
    pub fn from_iterator(iter: NBTreeIterator) -> Result<Self> {
        let mut cursor = Self {
            iter,
            timestamps: vec![0; CURSOR_PAGE_SIZE],
            values: vec![0.0; CURSOR_PAGE_SIZE],
            size: 0,
            eof: false,
        };
        cursor.proceed()?;
        Ok(cursor)
    }

    /// Returns true once every page was consumed.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Returns the number of samples in the current page.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns sample `index` of the current page.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::BadArgument` if `index >= size()`.
    pub fn at(&self, index: usize) -> Result<(Timestamp, f64)> {
        if index >= self.size {
            return Err(StorageError::BadArgument(format!(
                "cursor index {} out of page of {}",
                index, self.size
            )));
        }
        Ok((self.timestamps[index], self.values[index]))
    }

    /// Loads the next page.
    pub fn proceed(&mut self) -> Result<()> {
        if self.eof {
            self.size = 0;
            return Ok(());
        }
        self.size = self.iter.read(&mut self.timestamps, &mut self.values)?;
        self.eof = self.size == 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::{AllocationPolicy, BlockStoreBuilder};
    use crate::nbtree::TreeConfig;

    fn filled_tree(bstore: Arc<dyn BlockStore>, config: TreeConfig, n: u64) -> NBTree {
        let mut tree = NBTree::with_config(1, bstore, config).unwrap();
        for ts in 0..n {
            tree.append(ts, ts as f64).unwrap();
        }
        tree
    }

    fn timestamps(iter: NBTreeIterator) -> Vec<Timestamp> {
        iter.map(|sample| sample.unwrap().0).collect()
    }

    #[test]
    fn test_scan_range_direction() {
        let forward = ScanRange::new(10, 20).unwrap();
        assert_eq!(forward.direction(), Direction::Forward);
        assert!(forward.contains(10));
        assert!(!forward.contains(20));

        let backward = ScanRange::new(20, 10).unwrap();
        assert!(backward.is_backward());
        assert!(backward.contains(20));
        assert!(!backward.contains(10));

        assert!(matches!(
            ScanRange::new(5, 5),
            Err(StorageError::BadArgument(_))
        ));
    }

    #[test]
    fn test_scan_range_overlaps() {
        let mut agg = Aggregate::new();
        let range = ScanRange::new(10, 20).unwrap();
        assert!(!range.overlaps(&agg));

        agg.add(20, 0.0);
        agg.add(30, 0.0);
        assert!(!range.overlaps(&agg));
        assert!(ScanRange::new(30, 19).unwrap().overlaps(&agg));
        assert!(!ScanRange::new(40, 30).unwrap().overlaps(&agg));
        assert!(ScanRange::new(40, 29).unwrap().overlaps(&agg));
    }

    #[test]
    fn test_scan_both_directions() {
        let bstore = BlockStoreBuilder::create_memstore();
        let config = TreeConfig::default().with_leaf_capacity(3).with_fanout(2);
        let tree = filled_tree(bstore, config, 50);

        assert_eq!(
            timestamps(tree.search(0, 50).unwrap()),
            (0..50).collect::<Vec<_>>()
        );
        assert_eq!(
            timestamps(tree.search(49, 0).unwrap()),
            (1..50).rev().collect::<Vec<_>>()
        );
        assert_eq!(
            timestamps(tree.search(7, 31).unwrap()),
            (7..31).collect::<Vec<_>>()
        );
        assert_eq!(
            timestamps(tree.search(31, 7).unwrap()),
            (8..32).rev().collect::<Vec<_>>()
        );
        assert!(timestamps(tree.search(100, 200).unwrap()).is_empty());
    }

    #[test]
    fn test_read_in_small_batches() {
        let bstore = BlockStoreBuilder::create_memstore();
        let config = TreeConfig::default().with_leaf_capacity(4).with_fanout(3);
        let tree = filled_tree(bstore, config, 37);

        let mut iter = tree.search(0, 37).unwrap();
        let mut ts = [0u64; 5];
        let mut vals = [0f64; 5];
        let mut seen = Vec::new();
        loop {
            let n = iter.read(&mut ts, &mut vals).unwrap();
            seen.extend_from_slice(&ts[..n]);
            if n < ts.len() {
                break;
            }
        }
        assert_eq!(seen, (0..37).collect::<Vec<_>>());
        assert_eq!(iter.read(&mut ts, &mut vals).unwrap(), 0);
    }

    #[test]
    fn test_stale_children_are_pruned() {
        // Keeps 4 blocks: leaves of 2 samples, flushed superblocks of 2.
        let bstore = BlockStoreBuilder::create_bounded_memstore(4, AllocationPolicy::Ring);
        let config = TreeConfig::default().with_leaf_capacity(2).with_fanout(2);
        let tree = filled_tree(bstore, config, 16);

        let seen = timestamps(tree.search(0, 16).unwrap());
        assert!(!seen.is_empty());
        assert!(seen.len() < 16);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen.last(), Some(&15));
    }

    #[test]
    fn test_iterator_keeps_bounds_as_given() {
        let bstore = BlockStoreBuilder::create_memstore();
        let tree = filled_tree(bstore, TreeConfig::default(), 10);

        let iter = tree.search(9, 2).unwrap();
        let range = iter.range();
        assert_eq!((range.begin(), range.end()), (9, 2));
        assert!(range.is_backward());
        assert_eq!(timestamps(iter), (3..10).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_from_roots_missing_root_surfaces() {
        let bstore = BlockStoreBuilder::create_memstore();
        let roots = [LogicAddr::from_raw(3)];
        let mut iter = NBTreeIterator::from_roots(bstore, &roots, 0, 10).unwrap();
        assert!(matches!(iter.next(), Some(Err(StorageError::NotFound(_)))));
    }

    #[test]
    fn test_cursor_pages() {
        let bstore = BlockStoreBuilder::create_memstore();
        let tree = filled_tree(bstore, TreeConfig::default(), 2500);

        let mut cursor = NBTreeCursor::new(&tree, 0, 2500).unwrap();
        let mut pages = Vec::new();
        let mut next = 0;
        while !cursor.is_eof() {
            pages.push(cursor.size());
            for ix in 0..cursor.size() {
                assert_eq!(cursor.at(ix).unwrap(), (next, next as f64));
                next += 1;
            }
            cursor.proceed().unwrap();
        }
        assert_eq!(pages, vec![1024, 1024, 452]);
        assert_eq!(next, 2500);
        assert!(matches!(cursor.at(0), Err(StorageError::BadArgument(_))));
    }
}
