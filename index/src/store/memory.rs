//! In-memory node store.
//!
//! Blocks live in a `HashMap` keyed by offset. Offsets are small integers:
//! 1 is the header block and nodes start at 2. Freed offsets are reused
//! most-recently-freed first.

use std::collections::HashMap;

use crate::key::Offset;
use crate::layout::{HEADER_SIZE, MAX_ENTRIES_PER_NODE, node_size};
use crate::store::{NodeStore, StoreError};

const HEADER_OFFSET: Offset = 1;
const FIRST_NODE_OFFSET: Offset = 2;

/// Counters for store traffic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub reads: u64,
    pub writes: u64,
    pub allocations: u64,
    pub frees: u64,
}

/// A node store held entirely in memory.
#[derive(Debug)]
pub struct MemoryStore {
    blocks: HashMap<Offset, Vec<u8>>,
    block_size: usize,
    next_offset: Offset,
    free_list: Vec<Offset>,
    /// Maximum number of node blocks alive at once.
    limit: Option<u64>,
    stats: MemoryStoreStats,
}

impl MemoryStore {
    /// Create a store whose blocks fit a node of any supported capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_block_size(node_size(MAX_ENTRIES_PER_NODE as usize))
    }

    /// Create a store with a specific maximum block size.
    ///
    /// # Panics
    /// Panics if `block_size` cannot hold a tree header.
    #[must_use]
    pub fn with_block_size(block_size: usize) -> Self {
        assert!(
            block_size >= HEADER_SIZE,
            "block size {block_size} cannot hold a {HEADER_SIZE}-byte header"
        );
        let mut blocks = HashMap::new();
        blocks.insert(HEADER_OFFSET, vec![0u8; HEADER_SIZE]);
        Self {
            blocks,
            block_size,
            next_offset: FIRST_NODE_OFFSET,
            free_list: Vec::new(),
            limit: None,
            stats: MemoryStoreStats::default(),
        }
    }

    /// Cap the number of live node blocks. Allocation beyond the cap fails
    /// with [`StoreError::Exhausted`].
    #[must_use]
    pub fn with_limit(mut self, max_blocks: u64) -> Self {
        self.limit = Some(max_blocks);
        self
    }

    /// Number of allocated node blocks (the header block is not counted).
    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.blocks.len() - 1
    }

    /// Check whether `offset` names an allocated node block.
    #[must_use]
    pub fn is_allocated(&self, offset: Offset) -> bool {
        offset != HEADER_OFFSET && self.blocks.contains_key(&offset)
    }

    #[must_use]
    pub const fn stats(&self) -> &MemoryStoreStats {
        &self.stats
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStore for MemoryStore {
    fn header_offset(&self) -> Offset {
        HEADER_OFFSET
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate(&mut self, size_hint: usize) -> Result<Offset, StoreError> {
        if size_hint > self.block_size {
            return Err(StoreError::BlockTooLarge {
                requested: size_hint,
                block_size: self.block_size,
            });
        }
        if let Some(limit) = self.limit {
            if self.live_blocks() as u64 >= limit {
                return Err(StoreError::Exhausted { limit });
            }
        }

        let offset = self.free_list.pop().unwrap_or_else(|| {
            let offset = self.next_offset;
            self.next_offset += 1;
            offset
        });
        self.blocks.insert(offset, vec![0u8; size_hint]);
        self.stats.allocations += 1;
        Ok(offset)
    }

    fn free(&mut self, offset: Offset) -> Result<(), StoreError> {
        if offset == HEADER_OFFSET || self.blocks.remove(&offset).is_none() {
            return Err(StoreError::InvalidOffset(offset));
        }
        self.free_list.push(offset);
        self.stats.frees += 1;
        Ok(())
    }

    fn read(&mut self, offset: Offset, buf: &mut [u8]) -> Result<usize, StoreError> {
        let block = self
            .blocks
            .get(&offset)
            .ok_or(StoreError::InvalidOffset(offset))?;
        let len = buf.len().min(block.len());
        buf[..len].copy_from_slice(&block[..len]);
        self.stats.reads += 1;
        Ok(len)
    }

    fn write(&mut self, offset: Offset, buf: &[u8]) -> Result<usize, StoreError> {
        let block = self
            .blocks
            .get_mut(&offset)
            .ok_or(StoreError::InvalidOffset(offset))?;
        if buf.len() > block.len() {
            return Err(StoreError::BlockTooLarge {
                requested: buf.len(),
                block_size: block.len(),
            });
        }
        block[..buf.len()].copy_from_slice(buf);
        self.stats.writes += 1;
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::NULL_OFFSET;

    #[test]
    fn test_header_block_reads_zero() {
        let mut store = MemoryStore::new();
        let mut buf = [0xFFu8; HEADER_SIZE];
        let n = store.read(store.header_offset(), &mut buf).expect("read");
        assert_eq!(n, HEADER_SIZE);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_allocate_never_returns_null_or_header() {
        let mut store = MemoryStore::new();
        for _ in 0..10 {
            let offset = store.allocate(32).expect("allocate");
            assert_ne!(offset, NULL_OFFSET);
            assert_ne!(offset, store.header_offset());
        }
        assert_eq!(store.live_blocks(), 10);
    }

    #[test]
    fn test_free_reuses_offset() {
        let mut store = MemoryStore::new();
        let a = store.allocate(8).expect("allocate a");
        let b = store.allocate(8).expect("allocate b");
        store.free(a).expect("free a");

        assert!(!store.is_allocated(a));
        assert!(store.is_allocated(b));
        assert_eq!(store.allocate(8).expect("allocate c"), a);
    }

    #[test]
    fn test_free_unknown_offset() {
        let mut store = MemoryStore::new();
        assert!(matches!(store.free(99), Err(StoreError::InvalidOffset(99))));
        let header = store.header_offset();
        assert!(matches!(store.free(header), Err(StoreError::InvalidOffset(_))));
    }

    #[test]
    fn test_limit_exhausts() {
        let mut store = MemoryStore::new().with_limit(2);
        store.allocate(8).expect("first");
        let second = store.allocate(8).expect("second");
        assert!(matches!(
            store.allocate(8),
            Err(StoreError::Exhausted { limit: 2 })
        ));

        store.free(second).expect("free");
        assert!(store.allocate(8).is_ok());
    }

    #[test]
    fn test_oversized_requests_rejected() {
        let mut store = MemoryStore::with_block_size(64);
        assert!(matches!(
            store.allocate(65),
            Err(StoreError::BlockTooLarge { .. })
        ));

        let offset = store.allocate(16).expect("allocate");
        assert!(matches!(
            store.write(offset, &[0u8; 17]),
            Err(StoreError::BlockTooLarge { .. })
        ));
    }

    #[test]
    fn test_stats_track_traffic() {
        let mut store = MemoryStore::new();
        let offset = store.allocate(4).expect("allocate");
        store.write(offset, &[1, 2, 3, 4]).expect("write");
        let mut buf = [0u8; 4];
        store.read(offset, &mut buf).expect("read");
        store.free(offset).expect("free");

        assert_eq!(
            *store.stats(),
            MemoryStoreStats {
                reads: 1,
                writes: 1,
                allocations: 1,
                frees: 1,
            }
        );
    }
}
