//! Best-fit free-space pool built on the ordered index.
//!
//! Each free extent is stored as the key `(size, location)`. A nearest-larger
//! search for `(n, 0)` then yields the smallest extent of at least `n` units,
//! lowest location first among equal sizes.

use crate::config::IndexConfig;
use crate::key::Key;
use crate::store::NodeStore;
use crate::tree::{BTree, BTreeError};

/// A run of free units starting at `location`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub location: u64,
    pub size: u64,
}

impl Extent {
    #[must_use]
    pub const fn new(location: u64, size: u64) -> Self {
        Self { location, size }
    }

    const fn key(self) -> Key {
        Key::new(self.size, self.location)
    }

    const fn from_key(key: Key) -> Self {
        Self::new(key.secondary, key.primary)
    }
}

/// Free extents indexed by size.
///
/// Adjacent extents are not coalesced.
pub struct FreeSpaceIndex<S: NodeStore> {
    tree: BTree<S>,
}

impl<S: NodeStore> FreeSpaceIndex<S> {
    pub fn open(store: S, config: IndexConfig) -> Result<Self, BTreeError> {
        Ok(Self {
            tree: BTree::open(store, config)?,
        })
    }

    /// Add a free extent. Empty extents are ignored.
    ///
    /// Returns `false` if the extent was ignored or already recorded.
    pub fn release(&mut self, location: u64, size: u64) -> Result<bool, BTreeError> {
        if size == 0 {
            return Ok(false);
        }
        self.tree.add(Extent::new(location, size).key())
    }

    /// Take `size` units from the smallest extent that can hold them.
    ///
    /// Any remainder stays in the pool as a smaller extent directly after
    /// the returned one. Returns `None` when no extent is large enough or
    /// `size` is zero.
    ///
    /// The remainder is recorded before the extent is removed, so a failed
    /// acquire leaves the pool as it was.
    pub fn acquire(&mut self, size: u64) -> Result<Option<Extent>, BTreeError> {
        if size == 0 {
            return Ok(None);
        }
        let Some(found) = self.tree.search(&Key::new(size, 0))? else {
            return Ok(None);
        };

        let extent = Extent::from_key(found);
        if extent.size > size {
            self.release(extent.location + size, extent.size - size)?;
        }
        self.tree.delete(&found)?;
        tracing::trace!(
            location = extent.location,
            size,
            from = extent.size,
            "acquired extent"
        );
        Ok(Some(Extent::new(extent.location, size)))
    }

    /// Largest free extent.
    pub fn largest(&mut self) -> Result<Option<Extent>, BTreeError> {
        Ok(self.tree.last()?.map(Extent::from_key))
    }

    pub fn total_free(&mut self) -> Result<u64, BTreeError> {
        Ok(self.tree.keys()?.iter().map(|k| k.primary).sum())
    }

    /// All extents ordered by size, then location.
    pub fn extents(&mut self) -> Result<Vec<Extent>, BTreeError> {
        Ok(self.tree.keys()?.into_iter().map(Extent::from_key).collect())
    }

    #[must_use]
    pub const fn tree(&self) -> &BTree<S> {
        &self.tree
    }

    #[allow(clippy::missing_const_for_fn)] // mutable references can't be const
    pub fn tree_mut(&mut self) -> &mut BTree<S> {
        &mut self.tree
    }

    pub fn into_store(self) -> S {
        self.tree.into_store()
    }
}
