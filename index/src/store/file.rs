//! Packed single-file node store.
//!
//! The file is a sequence of `block_size`-byte blocks and an offset is the
//! byte position of a block:
//!
//! - Block 0: store superblock (format, block size, block count, free list)
//! - Block 1: tree header anchor
//! - Remaining blocks: nodes, or entries of the free list
//!
//! Freed blocks form a singly-linked list threaded through their first eight
//! bytes. Allocation pops that list before growing the file.
//!
//! Superblock fields are always little-endian; the tree's own byte order only
//! applies to the blocks it writes.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::key::{NULL_OFFSET, Offset};
use crate::layout::HEADER_SIZE;
use crate::store::{NodeStore, StoreError};

/// Magic identifying a packed index file: "ORDIDXST".
pub const MAGIC: [u8; 8] = *b"ORDIDXST";

/// Current store format version.
pub const FORMAT_VERSION: u32 = 1;

/// Smallest accepted block size.
pub const MIN_BLOCK_SIZE: usize = 64;

/// Number of blocks reserved before the first node.
const RESERVED_BLOCKS: u64 = 2;

/// Superblock field offsets.
mod offsets {
    pub const MAGIC: usize = 0;
    pub const FORMAT_VERSION: usize = 8;
    pub const BLOCK_SIZE: usize = 12;
    pub const BLOCK_COUNT: usize = 16;
    pub const FREE_HEAD: usize = 24;
    pub const FREE_COUNT: usize = 32;
    pub const END: usize = 40;
}

/// Allocation state persisted in block 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Superblock {
    block_size: u32,
    block_count: u64,
    free_head: Offset,
    free_count: u64,
}

impl Superblock {
    fn to_bytes(self) -> [u8; offsets::END] {
        let mut buf = [0u8; offsets::END];
        buf[offsets::MAGIC..offsets::MAGIC + 8].copy_from_slice(&MAGIC);
        buf[offsets::FORMAT_VERSION..offsets::FORMAT_VERSION + 4]
            .copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[offsets::BLOCK_SIZE..offsets::BLOCK_SIZE + 4]
            .copy_from_slice(&self.block_size.to_le_bytes());
        buf[offsets::BLOCK_COUNT..offsets::BLOCK_COUNT + 8]
            .copy_from_slice(&self.block_count.to_le_bytes());
        buf[offsets::FREE_HEAD..offsets::FREE_HEAD + 8].copy_from_slice(&self.free_head.to_le_bytes());
        buf[offsets::FREE_COUNT..offsets::FREE_COUNT + 8]
            .copy_from_slice(&self.free_count.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; offsets::END]) -> Result<Self, StoreError> {
        if buf[offsets::MAGIC..offsets::MAGIC + 8] != MAGIC {
            return Err(StoreError::Format("invalid magic".to_string()));
        }

        let version = read_u32(buf, offsets::FORMAT_VERSION);
        if version != FORMAT_VERSION {
            return Err(StoreError::Format(format!("unsupported version {version}")));
        }

        let block_size = read_u32(buf, offsets::BLOCK_SIZE);
        if (block_size as usize) < MIN_BLOCK_SIZE {
            return Err(StoreError::Format(format!("invalid block size {block_size}")));
        }

        let block_count = read_u64(buf, offsets::BLOCK_COUNT);
        if block_count < RESERVED_BLOCKS {
            return Err(StoreError::Format(format!("invalid block count {block_count}")));
        }

        Ok(Self {
            block_size,
            block_count,
            free_head: read_u64(buf, offsets::FREE_HEAD),
            free_count: read_u64(buf, offsets::FREE_COUNT),
        })
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes([
        buf[at],
        buf[at + 1],
        buf[at + 2],
        buf[at + 3],
        buf[at + 4],
        buf[at + 5],
        buf[at + 6],
        buf[at + 7],
    ])
}

/// A node store backed by one file of fixed-size blocks.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    path: PathBuf,
    superblock: Superblock,
    /// Offsets currently on the free list.
    freed: HashSet<Offset>,
    /// Maximum number of blocks the file may grow to.
    max_blocks: Option<u64>,
}

impl FileStore {
    /// Create a new store file.
    ///
    /// Returns an error if the file already exists.
    pub fn create(path: &Path, block_size: usize) -> Result<Self, StoreError> {
        if path.exists() {
            return Err(StoreError::AlreadyExists(path.to_path_buf()));
        }
        let block_size_u32 = u32::try_from(block_size)
            .ok()
            .filter(|&size| size as usize >= MIN_BLOCK_SIZE)
            .ok_or_else(|| StoreError::Format(format!("invalid block size {block_size}")))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let superblock = Superblock {
            block_size: block_size_u32,
            block_count: RESERVED_BLOCKS,
            free_head: NULL_OFFSET,
            free_count: 0,
        };
        file.set_len(RESERVED_BLOCKS * u64::from(block_size_u32))?;

        let mut store = Self {
            file,
            path: path.to_path_buf(),
            superblock,
            freed: HashSet::new(),
            max_blocks: None,
        };
        store.write_superblock()?;
        store.file.sync_all()?;

        tracing::debug!(path = %path.display(), block_size, "created node store file");
        Ok(store)
    }

    /// Open an existing store file.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut buf = [0u8; offsets::END];
        file.read_exact(&mut buf)?;
        let superblock = Superblock::from_bytes(&buf)?;

        let expected_len = superblock.block_count * u64::from(superblock.block_size);
        let actual_len = file.metadata()?.len();
        if actual_len < expected_len {
            return Err(StoreError::Format(format!(
                "file is {actual_len} bytes but {} blocks need {expected_len}",
                superblock.block_count
            )));
        }

        let mut store = Self {
            file,
            path: path.to_path_buf(),
            superblock,
            freed: HashSet::new(),
            max_blocks: None,
        };
        store.load_free_list()?;
        Ok(store)
    }

    /// Open the store at `path`, creating it with `block_size` if missing.
    pub fn open_or_create(path: &Path, block_size: usize) -> Result<Self, StoreError> {
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path, block_size)
        }
    }

    /// Cap the total number of blocks in the file, reserved blocks included.
    #[must_use]
    pub fn with_max_blocks(mut self, max_blocks: u64) -> Self {
        self.max_blocks = Some(max_blocks);
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total blocks in the file, including the superblock and header anchor.
    #[must_use]
    pub const fn block_count(&self) -> u64 {
        self.superblock.block_count
    }

    /// Blocks currently on the free list.
    #[must_use]
    pub const fn free_count(&self) -> u64 {
        self.superblock.free_count
    }

    /// Blocks holding live nodes.
    #[must_use]
    pub const fn live_blocks(&self) -> u64 {
        self.superblock.block_count - RESERVED_BLOCKS - self.superblock.free_count
    }

    fn block_size_u64(&self) -> u64 {
        u64::from(self.superblock.block_size)
    }

    /// Walk the persisted free list, rejecting chains that leave the file,
    /// revisit a block or disagree with the recorded count.
    fn load_free_list(&mut self) -> Result<(), StoreError> {
        let mut offset = self.superblock.free_head;
        while offset != NULL_OFFSET {
            if self.check_offset(offset, false).is_err() || !self.freed.insert(offset) {
                return Err(StoreError::Format(format!("free list broken at offset {offset}")));
            }
            offset = self.read_next_free(offset)?;
        }
        if self.freed.len() as u64 != self.superblock.free_count {
            return Err(StoreError::Format(format!(
                "free list holds {} blocks, superblock records {}",
                self.freed.len(),
                self.superblock.free_count
            )));
        }
        Ok(())
    }

    fn read_next_free(&mut self, offset: Offset) -> Result<Offset, StoreError> {
        let mut next = [0u8; 8];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut next)?;
        Ok(u64::from_le_bytes(next))
    }

    fn write_superblock(&mut self) -> Result<(), StoreError> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.superblock.to_bytes())?;
        Ok(())
    }

    /// Check that `offset` is block-aligned and inside the file. The header
    /// anchor is accepted only when `allow_header` is set.
    fn check_offset(&self, offset: Offset, allow_header: bool) -> Result<(), StoreError> {
        let block_size = self.block_size_u64();
        let first = if allow_header { 1 } else { RESERVED_BLOCKS };
        let aligned = offset % block_size == 0;
        let index = offset / block_size;
        if !aligned || index < first || index >= self.superblock.block_count {
            return Err(StoreError::InvalidOffset(offset));
        }
        Ok(())
    }
}

impl NodeStore for FileStore {
    fn header_offset(&self) -> Offset {
        self.block_size_u64()
    }

    fn block_size(&self) -> usize {
        self.superblock.block_size as usize
    }

    fn allocate(&mut self, size_hint: usize) -> Result<Offset, StoreError> {
        if size_hint > self.block_size() {
            return Err(StoreError::BlockTooLarge {
                requested: size_hint,
                block_size: self.block_size(),
            });
        }

        let offset = if self.superblock.free_head == NULL_OFFSET {
            if let Some(limit) = self.max_blocks {
                if self.superblock.block_count >= limit {
                    return Err(StoreError::Exhausted { limit });
                }
            }
            let offset = self.superblock.block_count * self.block_size_u64();
            let block_count = self.superblock.block_count + 1;
            self.file.set_len(block_count * self.block_size_u64())?;
            self.superblock.block_count = block_count;
            offset
        } else {
            let offset = self.superblock.free_head;
            self.superblock.free_head = self.read_next_free(offset)?;
            self.superblock.free_count -= 1;
            self.freed.remove(&offset);
            offset
        };

        self.write_superblock()?;
        Ok(offset)
    }

    fn free(&mut self, offset: Offset) -> Result<(), StoreError> {
        self.check_offset(offset, false)?;
        if self.freed.contains(&offset) {
            return Err(StoreError::InvalidOffset(offset));
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&self.superblock.free_head.to_le_bytes())?;
        self.superblock.free_head = offset;
        self.superblock.free_count += 1;
        self.write_superblock()
    }

    fn read(&mut self, offset: Offset, buf: &mut [u8]) -> Result<usize, StoreError> {
        self.check_offset(offset, true)?;
        let len = buf.len().min(self.block_size());
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf[..len])?;
        Ok(len)
    }

    fn write(&mut self, offset: Offset, buf: &[u8]) -> Result<usize, StoreError> {
        self.check_offset(offset, true)?;
        if buf.len() > self.block_size() {
            return Err(StoreError::BlockTooLarge {
                requested: buf.len(),
                block_size: self.block_size(),
            });
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn sync(&mut self) -> Result<(), StoreError> {
        self.file.sync_all()?;
        Ok(())
    }
}

// Header anchor must hold a full tree header.
const _: () = assert!(MIN_BLOCK_SIZE >= HEADER_SIZE);
