//! Block storage for tree nodes.
//!
//! The tree never touches files directly. It asks a [`NodeStore`] for
//! fixed-size blocks identified by an opaque [`Offset`] and reads and writes
//! whole node images through it.
//!
//! Three stores are provided:
//! - [`MemoryStore`]: blocks in a hash map, used by tests and short-lived trees
//! - [`FileStore`]: one packed file, offsets are byte positions in that file
//! - [`DirStore`]: one file per node, offsets are numeric node ids
//!
//! # Usage
//!
//! ```
//! use ordered_index::store::{MemoryStore, NodeStore};
//!
//! let mut store = MemoryStore::new();
//! let offset = store.allocate(16).expect("allocate");
//! store.write(offset, b"hello").expect("write");
//!
//! let mut buf = [0u8; 5];
//! store.read(offset, &mut buf).expect("read");
//! assert_eq!(&buf, b"hello");
//! ```

mod dir;
mod file;
mod memory;

pub use dir::DirStore;
pub use file::FileStore;
pub use memory::{MemoryStore, MemoryStoreStats};

use std::path::PathBuf;

use crate::key::Offset;

/// Errors raised by a node store.
#[derive(Debug)]
pub enum StoreError {
    /// I/O error.
    Io(std::io::Error),
    /// Store file or directory already exists.
    AlreadyExists(PathBuf),
    /// No more blocks can be allocated.
    Exhausted { limit: u64 },
    /// Request larger than one block.
    BlockTooLarge { requested: usize, block_size: usize },
    /// Offset does not name an allocated block.
    InvalidOffset(Offset),
    /// Store metadata is unreadable.
    Format(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::AlreadyExists(p) => write!(f, "store already exists: {}", p.display()),
            Self::Exhausted { limit } => write!(f, "store exhausted ({limit} blocks)"),
            Self::BlockTooLarge {
                requested,
                block_size,
            } => write!(
                f,
                "request of {requested} bytes exceeds block size {block_size}"
            ),
            Self::InvalidOffset(offset) => write!(f, "invalid block offset {offset}"),
            Self::Format(msg) => write!(f, "store format error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Allocate, free, read and write fixed-size node blocks.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `header_offset` is always readable and reads as zeros until written
/// - `NULL_OFFSET` (0) is never returned by `allocate`
/// - `read` returns the last bytes written to that offset
/// - allocation failure is reported as [`StoreError::Exhausted`] and nothing
///   is retried internally
pub trait NodeStore {
    /// Offset of the reserved block holding the tree header.
    fn header_offset(&self) -> Offset;

    /// Largest number of bytes a single block can hold.
    fn block_size(&self) -> usize;

    /// Reserve a block able to hold `size_hint` bytes.
    fn allocate(&mut self, size_hint: usize) -> Result<Offset, StoreError>;

    /// Release a block returned by `allocate`.
    fn free(&mut self, offset: Offset) -> Result<(), StoreError>;

    /// Read up to `buf.len()` bytes from the block at `offset`.
    ///
    /// Returns the number of bytes read.
    fn read(&mut self, offset: Offset, buf: &mut [u8]) -> Result<usize, StoreError>;

    /// Write `buf` to the start of the block at `offset`.
    ///
    /// Returns the number of bytes written.
    fn write(&mut self, offset: Offset, buf: &[u8]) -> Result<usize, StoreError>;

    /// Make all previous writes durable.
    fn sync(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl<S: NodeStore + ?Sized> NodeStore for &mut S {
    fn header_offset(&self) -> Offset {
        (**self).header_offset()
    }

    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn allocate(&mut self, size_hint: usize) -> Result<Offset, StoreError> {
        (**self).allocate(size_hint)
    }

    fn free(&mut self, offset: Offset) -> Result<(), StoreError> {
        (**self).free(offset)
    }

    fn read(&mut self, offset: Offset, buf: &mut [u8]) -> Result<usize, StoreError> {
        (**self).read(offset, buf)
    }

    fn write(&mut self, offset: Offset, buf: &[u8]) -> Result<usize, StoreError> {
        (**self).write(offset, buf)
    }

    fn sync(&mut self) -> Result<(), StoreError> {
        (**self).sync()
    }
}
