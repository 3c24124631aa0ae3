//! NBTree node layout.
//!
//! Every node occupies exactly one block:
//!
//! ```text
//! Offset  Size    Field
//! ------  ----    -----
//! 0x00    1       kind (1 = leaf, 2 = superblock)
//! 0x01    1       version
//! 0x02    2       count (u16 LE)
//! 0x04    4       crc32 of bytes 0x08..BLOCK_SIZE (u32 LE)
//! 0x08    8       series_id (u64 LE)
//! 0x10    2       level (u16 LE, 0 for leaves)
//! 0x12    14      reserved
//! 0x20    ...     payload
//! ```
//!
//! Leaf payload: `count` timestamps (u64 LE) followed by `count` values
//! (f64 LE). Superblock payload: `count` subtree references of 72 bytes.

use super::{SeriesId, Timestamp};
use crate::blockstore::{Block, LogicAddr, BLOCK_SIZE};
use crate::error::{Result, StorageError};

/// Node header size in bytes.
pub const NODE_HEADER_SIZE: usize = 32;

/// Serialized size of a [`SubtreeRef`].
pub const SUBTREE_REF_SIZE: usize = 72;

/// Maximum number of samples in a leaf.
pub const LEAF_CAPACITY: usize = (BLOCK_SIZE - NODE_HEADER_SIZE) / 16;

/// Maximum number of children of a superblock.
pub const FANOUT: usize = 32;

/// Current node format version.
pub const NODE_VERSION: u8 = 1;

const _: () = assert!(NODE_HEADER_SIZE + FANOUT * SUBTREE_REF_SIZE <= BLOCK_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum NodeKind {
    Leaf = 1,
    Superblock = 2,
}

impl NodeKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Leaf),
            2 => Some(Self::Superblock),
            _ => None,
        }
    }
}

/// Summary of the samples below a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregate {
    /// Number of samples.
    pub count: u64,
    /// Smallest timestamp.
    pub begin: Timestamp,
    /// Largest timestamp.
    pub end: Timestamp,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
    /// Sum of values.
    pub sum: f64,
    /// Value of the earliest sample.
    pub first: f64,
    /// Value of the latest sample.
    pub last: f64,
}

impl Default for Aggregate {
    fn default() -> Self {
        Self {
            count: 0,
            begin: Timestamp::MAX,
            end: Timestamp::MIN,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            first: 0.0,
            last: 0.0,
        }
    }
}

impl Aggregate {
    /// Creates an empty aggregate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no samples were added.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Adds a sample that is not older than any sample seen so far.
    pub fn add(&mut self, timestamp: Timestamp, value: f64) {
        if self.count == 0 {
            self.first = value;
        }
        self.count += 1;
        self.begin = self.begin.min(timestamp);
        self.end = self.end.max(timestamp);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.last = value;
    }

    /// Merges the aggregate of a later run of samples.
    pub fn combine(&mut self, later: &Aggregate) {
        if later.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = *later;
            return;
        }
        self.count += later.count;
        self.begin = self.begin.min(later.begin);
        self.end = self.end.max(later.end);
        self.min = self.min.min(later.min);
        self.max = self.max.max(later.max);
        self.sum += later.sum;
        self.last = later.last;
    }
}

/// Reference from a superblock to a child node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubtreeRef {
    /// Address of the child block.
    pub addr: LogicAddr,
    /// Aggregate of the child, captured when it was flushed.
    pub agg: Aggregate,
}

impl SubtreeRef {
    fn write_to(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.addr.to_raw());
        put_u64(buf, 8, self.agg.count);
        put_u64(buf, 16, self.agg.begin);
        put_u64(buf, 24, self.agg.end);
        put_u64(buf, 32, self.agg.min.to_bits());
        put_u64(buf, 40, self.agg.max.to_bits());
        put_u64(buf, 48, self.agg.sum.to_bits());
        put_u64(buf, 56, self.agg.first.to_bits());
        put_u64(buf, 64, self.agg.last.to_bits());
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            addr: LogicAddr::from_raw(get_u64(buf, 0)),
            agg: Aggregate {
                count: get_u64(buf, 8),
                begin: get_u64(buf, 16),
                end: get_u64(buf, 24),
                min: f64::from_bits(get_u64(buf, 32)),
                max: f64::from_bits(get_u64(buf, 40)),
                sum: f64::from_bits(get_u64(buf, 48)),
                first: f64::from_bits(get_u64(buf, 56)),
                last: f64::from_bits(get_u64(buf, 64)),
            },
        }
    }
}

/// Node holding raw samples of one series.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    series_id: SeriesId,
    timestamps: Vec<Timestamp>,
    values: Vec<f64>,
}

impl Leaf {
    /// Creates an empty leaf.
    pub fn new(series_id: SeriesId) -> Self {
        Self {
            series_id,
            timestamps: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Returns the series this leaf belongs to.
    pub fn series_id(&self) -> SeriesId {
        self.series_id
    }

    /// Returns the number of samples.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Returns true if the leaf holds no samples.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Appends a sample; ordering is the caller's responsibility.
    pub fn push(&mut self, timestamp: Timestamp, value: f64) {
        self.timestamps.push(timestamp);
        self.values.push(value);
    }

    /// Returns the timestamps in append order.
    pub fn timestamps(&self) -> &[Timestamp] {
        &self.timestamps
    }

    /// Returns the values in append order.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Computes the aggregate over all samples.
    pub fn aggregate(&self) -> Aggregate {
        let mut agg = Aggregate::new();
        for (&ts, &value) in self.timestamps.iter().zip(&self.values) {
            agg.add(ts, value);
        }
        agg
    }

    /// Serializes the leaf into a block.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::BadArgument` if more than `LEAF_CAPACITY`
    /// samples are held.
    pub fn encode(&self) -> Result<Block> {
        let count = self.len();
        if count > LEAF_CAPACITY {
            return Err(StorageError::BadArgument(format!(
                "leaf holds {} samples, capacity is {}",
                count, LEAF_CAPACITY
            )));
        }

        let mut block = Block::zeroed();
        let buf = block.as_bytes_mut();
        let values_at = NODE_HEADER_SIZE + count * 8;
        for (i, (&ts, &value)) in self.timestamps.iter().zip(&self.values).enumerate() {
            put_u64(buf, NODE_HEADER_SIZE + i * 8, ts);
            put_u64(buf, values_at + i * 8, value.to_bits());
        }
        write_header(buf, NodeKind::Leaf, count, self.series_id, 0);
        Ok(block)
    }

    fn decode_payload(buf: &[u8], series_id: SeriesId, count: usize) -> Result<Self> {
        if count > LEAF_CAPACITY {
            return Err(StorageError::Corrupt(format!(
                "leaf count {} exceeds capacity {}",
                count, LEAF_CAPACITY
            )));
        }
        let values_at = NODE_HEADER_SIZE + count * 8;
        let mut leaf = Self {
            series_id,
            timestamps: Vec::with_capacity(count),
            values: Vec::with_capacity(count),
        };
        for i in 0..count {
            leaf.timestamps.push(get_u64(buf, NODE_HEADER_SIZE + i * 8));
            let bits = get_u64(buf, values_at + i * 8);
            leaf.values.push(f64::from_bits(bits));
        }
        Ok(leaf)
    }
}

/// Node holding ordered references to child nodes one level below.
#[derive(Debug, Clone, PartialEq)]
pub struct Superblock {
    series_id: SeriesId,
    level: u16,
    refs: Vec<SubtreeRef>,
}

impl Superblock {
    /// Creates an empty superblock on `level` (at least 1).
    pub fn new(series_id: SeriesId, level: u16) -> Self {
        Self {
            series_id,
            level,
            refs: Vec::new(),
        }
    }

    /// Returns the series this superblock belongs to.
    pub fn series_id(&self) -> SeriesId {
        self.series_id
    }

    /// Returns the tree level of this node.
    pub fn level(&self) -> u16 {
        self.level
    }

    /// Returns the number of children.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Returns true if the superblock has no children.
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Appends a child reference.
    pub fn push(&mut self, child: SubtreeRef) {
        self.refs.push(child);
    }

    /// Returns the child references in timestamp order.
    pub fn refs(&self) -> &[SubtreeRef] {
        &self.refs
    }

    /// Combines the aggregates of all children.
    pub fn aggregate(&self) -> Aggregate {
        let mut agg = Aggregate::new();
        for child in &self.refs {
            agg.combine(&child.agg);
        }
        agg
    }

    /// Serializes the superblock into a block.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::BadArgument` if more than `FANOUT` children are
    /// held.
    pub fn encode(&self) -> Result<Block> {
        let count = self.len();
        if count > FANOUT {
            return Err(StorageError::BadArgument(format!(
                "superblock holds {} children, fanout is {}",
                count, FANOUT
            )));
        }

        let mut block = Block::zeroed();
        let buf = block.as_bytes_mut();
        for (i, child) in self.refs.iter().enumerate() {
            let at = NODE_HEADER_SIZE + i * SUBTREE_REF_SIZE;
            child.write_to(&mut buf[at..at + SUBTREE_REF_SIZE]);
        }
        write_header(buf, NodeKind::Superblock, count, self.series_id, self.level);
        Ok(block)
    }

    fn decode_payload(buf: &[u8], series_id: SeriesId, level: u16, count: usize) -> Result<Self> {
        if count > FANOUT {
            return Err(StorageError::Corrupt(format!(
                "superblock count {} exceeds fanout {}",
                count, FANOUT
            )));
        }
        let refs = (0..count)
            .map(|i| {
                let at = NODE_HEADER_SIZE + i * SUBTREE_REF_SIZE;
                SubtreeRef::read_from(&buf[at..at + SUBTREE_REF_SIZE])
            })
            .collect();
        Ok(Self {
            series_id,
            level,
            refs,
        })
    }
}

/// A decoded tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Raw samples.
    Leaf(Leaf),
    /// Child references.
    Superblock(Superblock),
}

impl Node {
    /// Decodes and validates a node block.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ChecksumMismatch` on a damaged block,
    /// `StorageError::UnsupportedVersion` on an unknown format, and
    /// `StorageError::Corrupt` on an unknown kind or inconsistent header.
    pub fn decode(block: &Block) -> Result<Self> {
        let buf = block.as_bytes();

        let expected = get_u32(buf, 4);
        let actual = crc32fast::hash(&buf[8..]);
        if expected != actual {
            return Err(StorageError::ChecksumMismatch { expected, actual });
        }

        let Some(kind) = NodeKind::from_u8(buf[0]) else {
            return Err(StorageError::Corrupt(format!("bad node kind {}", buf[0])));
        };
        if buf[1] != NODE_VERSION {
            return Err(StorageError::UnsupportedVersion(buf[1] as u16));
        }
        let count = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        let series_id = get_u64(buf, 8);
        let level = u16::from_le_bytes([buf[16], buf[17]]);

        match kind {
            NodeKind::Leaf if level == 0 => {
                Leaf::decode_payload(buf, series_id, count).map(Node::Leaf)
            }
            NodeKind::Superblock if level > 0 => {
                Superblock::decode_payload(buf, series_id, level, count).map(Node::Superblock)
            }
            _ => Err(StorageError::Corrupt(format!(
                "{:?} node on level {}",
                kind, level
            ))),
        }
    }

    /// Returns the series the node belongs to.
    pub fn series_id(&self) -> SeriesId {
        match self {
            Node::Leaf(leaf) => leaf.series_id(),
            Node::Superblock(sb) => sb.series_id(),
        }
    }

    /// Returns the tree level (0 for leaves).
    pub fn level(&self) -> u16 {
        match self {
            Node::Leaf(_) => 0,
            Node::Superblock(sb) => sb.level(),
        }
    }

    /// Returns the aggregate of everything below the node.
    pub fn aggregate(&self) -> Aggregate {
        match self {
            Node::Leaf(leaf) => leaf.aggregate(),
            Node::Superblock(sb) => sb.aggregate(),
        }
    }

    /// Returns true if the node holds nothing.
    pub fn is_empty(&self) -> bool {
        match self {
            Node::Leaf(leaf) => leaf.is_empty(),
            Node::Superblock(sb) => sb.is_empty(),
        }
    }
}

fn write_header(buf: &mut [u8], kind: NodeKind, count: usize, series_id: SeriesId, level: u16) {
    buf[0] = kind as u8;
    buf[1] = NODE_VERSION;
    buf[2..4].copy_from_slice(&(count as u16).to_le_bytes());
    put_u64(buf, 8, series_id);
    buf[16..18].copy_from_slice(&level.to_le_bytes());
    let crc = crc32fast::hash(&buf[8..]);
    buf[4..8].copy_from_slice(&crc.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}
