//! On-disk byte layout for headers and nodes.
//!
//! Both blocks start with a 32-bit magic. Integers are written in the byte
//! order of the tree: native for a new tree, or whatever the header magic
//! says for an existing one. Reading a header whose magic matches only after
//! a byte swap flips the order for every later read of that tree.
//!
//! # Header (28 bytes)
//!
//! ```text
//! 0  magic            u32
//! 4  format_version   u32
//! 8  entries_per_node u32
//! 12 reserved         u32
//! 16 root             u64
//! 24 crc32            u32   over [0, 24)
//! ```
//!
//! # Node (`24 + 24 * capacity` bytes)
//!
//! ```text
//! 0  magic       u32
//! 4  crc32       u32   over [8, end of used payload)
//! 8  count       u32
//! 12 reserved    u32
//! 16 left_child  u64   only when count > 0
//! 24 entries     count * { primary u64, secondary u64, right_child u64 }
//! ```

// Capacities are bounded by MAX_ENTRIES_PER_NODE, so counts always fit in u32.
#![allow(clippy::cast_possible_truncation)]

use std::fmt;

use crate::header::Header;
use crate::key::{Entry, Key, Offset};
use crate::node::Node;

/// Header magic ("BTHD" read big-endian).
pub const HEADER_MAGIC: u32 = 0x4254_4844;

/// Node magic ("BTND" read big-endian).
pub const NODE_MAGIC: u32 = 0x4254_4E44;

/// Current header format version.
pub const FORMAT_VERSION: u32 = 1;

/// Serialized header size in bytes.
pub const HEADER_SIZE: usize = 28;

/// Fixed bytes before the first entry of a node.
pub const NODE_PREFIX_SIZE: usize = 24;

/// Serialized size of one entry.
pub const ENTRY_SIZE: usize = 24;

/// Smallest capacity for which split and merge stay balanced.
pub const MIN_ENTRIES_PER_NODE: u32 = 2;

/// Largest accepted capacity.
pub const MAX_ENTRIES_PER_NODE: u32 = 4096;

mod offsets {
    pub const MAGIC: usize = 0;
    pub const HEADER_VERSION: usize = 4;
    pub const HEADER_CAPACITY: usize = 8;
    pub const HEADER_ROOT: usize = 16;
    pub const HEADER_CRC: usize = 24;

    pub const NODE_CRC: usize = 4;
    pub const NODE_COUNT: usize = 8;
    pub const NODE_LEFT_CHILD: usize = 16;
}

/// Bytes needed to store one node of the given capacity.
#[must_use]
pub const fn node_size(capacity: usize) -> usize {
    NODE_PREFIX_SIZE + ENTRY_SIZE * capacity
}

/// Byte order used to encode integers of one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Byte order of the running platform.
    pub const NATIVE: Self = if cfg!(target_endian = "big") {
        Self::Big
    } else {
        Self::Little
    };

    #[must_use]
    pub const fn swapped(self) -> Self {
        match self {
            Self::Little => Self::Big,
            Self::Big => Self::Little,
        }
    }

    fn read_u32(self, buf: &[u8], at: usize) -> u32 {
        let bytes = [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]];
        match self {
            Self::Little => u32::from_le_bytes(bytes),
            Self::Big => u32::from_be_bytes(bytes),
        }
    }

    fn write_u32(self, buf: &mut [u8], at: usize, value: u32) {
        let bytes = match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        };
        buf[at..at + 4].copy_from_slice(&bytes);
    }

    fn read_u64(self, buf: &[u8], at: usize) -> u64 {
        let bytes = [
            buf[at],
            buf[at + 1],
            buf[at + 2],
            buf[at + 3],
            buf[at + 4],
            buf[at + 5],
            buf[at + 6],
            buf[at + 7],
        ];
        match self {
            Self::Little => u64::from_le_bytes(bytes),
            Self::Big => u64::from_be_bytes(bytes),
        }
    }

    fn write_u64(self, buf: &mut [u8], at: usize, value: u64) {
        let bytes = match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        };
        buf[at..at + 8].copy_from_slice(&bytes);
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Little => write!(f, "little-endian"),
            Self::Big => write!(f, "big-endian"),
        }
    }
}

/// Why a persisted block was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptKind {
    /// Magic matched neither byte order.
    BadMagic { expected: u32, found: u32 },
    /// Stored checksum does not match the payload.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Header written by an unknown format version.
    UnsupportedVersion(u32),
    /// Header capacity outside the accepted range.
    InvalidCapacity(u32),
    /// Node count larger than the tree capacity.
    CountExceedsCapacity { count: u32, capacity: usize },
    /// Fewer bytes than the block needs.
    Truncated { expected: usize, actual: usize },
}

impl fmt::Display for CorruptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic { expected, found } => {
                write!(f, "bad magic: expected 0x{expected:08x}, found 0x{found:08x}")
            }
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}")
            }
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version {v}"),
            Self::InvalidCapacity(c) => write!(f, "invalid entries per node {c}"),
            Self::CountExceedsCapacity { count, capacity } => {
                write!(f, "entry count {count} exceeds capacity {capacity}")
            }
            Self::Truncated { expected, actual } => {
                write!(f, "truncated block: expected {expected} bytes, got {actual}")
            }
        }
    }
}

/// Check that `capacity` is in the accepted range.
#[must_use]
pub const fn is_valid_capacity(capacity: u32) -> bool {
    capacity >= MIN_ENTRIES_PER_NODE && capacity <= MAX_ENTRIES_PER_NODE
}

/// Encode a header in the given byte order.
#[must_use]
pub fn encode_header(header: &Header, order: ByteOrder) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    order.write_u32(&mut buf, offsets::MAGIC, HEADER_MAGIC);
    order.write_u32(&mut buf, offsets::HEADER_VERSION, FORMAT_VERSION);
    order.write_u32(&mut buf, offsets::HEADER_CAPACITY, header.entries_per_node);
    order.write_u64(&mut buf, offsets::HEADER_ROOT, header.root);
    let crc = crc32fast::hash(&buf[..offsets::HEADER_CRC]);
    order.write_u32(&mut buf, offsets::HEADER_CRC, crc);
    buf
}

/// Decode a header, detecting its byte order from the magic.
///
/// Returns `Ok(None)` when the magic is zero, i.e. no header was ever written.
pub fn decode_header(buf: &[u8]) -> Result<Option<(Header, ByteOrder)>, CorruptKind> {
    if buf.len() < HEADER_SIZE {
        return Err(CorruptKind::Truncated {
            expected: HEADER_SIZE,
            actual: buf.len(),
        });
    }

    let native = ByteOrder::NATIVE.read_u32(buf, offsets::MAGIC);
    if native == 0 {
        return Ok(None);
    }
    let order = if native == HEADER_MAGIC {
        ByteOrder::NATIVE
    } else if native == HEADER_MAGIC.swap_bytes() {
        ByteOrder::NATIVE.swapped()
    } else {
        return Err(CorruptKind::BadMagic {
            expected: HEADER_MAGIC,
            found: native,
        });
    };

    let stored_crc = order.read_u32(buf, offsets::HEADER_CRC);
    let actual_crc = crc32fast::hash(&buf[..offsets::HEADER_CRC]);
    if stored_crc != actual_crc {
        return Err(CorruptKind::ChecksumMismatch {
            expected: stored_crc,
            actual: actual_crc,
        });
    }

    let version = order.read_u32(buf, offsets::HEADER_VERSION);
    if version != FORMAT_VERSION {
        return Err(CorruptKind::UnsupportedVersion(version));
    }

    let entries_per_node = order.read_u32(buf, offsets::HEADER_CAPACITY);
    if !is_valid_capacity(entries_per_node) {
        return Err(CorruptKind::InvalidCapacity(entries_per_node));
    }

    let root = order.read_u64(buf, offsets::HEADER_ROOT);
    Ok(Some((Header::new(entries_per_node, root), order)))
}

/// Length of the used part of a node block with `count` entries.
const fn used_len(count: usize) -> usize {
    if count == 0 {
        offsets::NODE_COUNT + 4
    } else {
        NODE_PREFIX_SIZE + ENTRY_SIZE * count
    }
}

/// Encode a node into a full block of `node_size(node.capacity())` bytes.
#[must_use]
pub fn encode_node(node: &Node, order: ByteOrder) -> Vec<u8> {
    let mut buf = vec![0u8; node_size(node.capacity())];
    order.write_u32(&mut buf, offsets::MAGIC, NODE_MAGIC);
    order.write_u32(&mut buf, offsets::NODE_COUNT, node.count() as u32);

    if node.count() > 0 {
        order.write_u64(&mut buf, offsets::NODE_LEFT_CHILD, node.left_child());
        let mut at = NODE_PREFIX_SIZE;
        for entry in node.entries() {
            order.write_u64(&mut buf, at, entry.key.primary);
            order.write_u64(&mut buf, at + 8, entry.key.secondary);
            order.write_u64(&mut buf, at + 16, entry.right_child);
            at += ENTRY_SIZE;
        }
    }

    let crc = crc32fast::hash(&buf[offsets::NODE_COUNT..used_len(node.count())]);
    order.write_u32(&mut buf, offsets::NODE_CRC, crc);
    buf
}

/// Decode a node stored at `offset` for a tree of the given capacity.
pub fn decode_node(
    buf: &[u8],
    offset: Offset,
    capacity: usize,
    order: ByteOrder,
) -> Result<Node, CorruptKind> {
    let min = used_len(0);
    if buf.len() < min {
        return Err(CorruptKind::Truncated {
            expected: min,
            actual: buf.len(),
        });
    }

    let magic = order.read_u32(buf, offsets::MAGIC);
    if magic != NODE_MAGIC {
        return Err(CorruptKind::BadMagic {
            expected: NODE_MAGIC,
            found: magic,
        });
    }

    let count = order.read_u32(buf, offsets::NODE_COUNT);
    let count_usize = count as usize;
    if count_usize > capacity {
        return Err(CorruptKind::CountExceedsCapacity { count, capacity });
    }

    let used = used_len(count_usize);
    if buf.len() < used {
        return Err(CorruptKind::Truncated {
            expected: used,
            actual: buf.len(),
        });
    }

    let stored_crc = order.read_u32(buf, offsets::NODE_CRC);
    let actual_crc = crc32fast::hash(&buf[offsets::NODE_COUNT..used]);
    if stored_crc != actual_crc {
        return Err(CorruptKind::ChecksumMismatch {
            expected: stored_crc,
            actual: actual_crc,
        });
    }

    if count_usize == 0 {
        return Ok(Node::new(offset, capacity));
    }

    let left_child = order.read_u64(buf, offsets::NODE_LEFT_CHILD);
    let mut entries = Vec::with_capacity(count_usize);
    let mut at = NODE_PREFIX_SIZE;
    for _ in 0..count_usize {
        let key = Key::new(order.read_u64(buf, at), order.read_u64(buf, at + 8));
        entries.push(Entry::new(key, order.read_u64(buf, at + 16)));
        at += ENTRY_SIZE;
    }

    Ok(Node::from_parts(offset, capacity, left_child, &entries))
}
