//! Tree-wide persistent metadata.

use crate::key::Offset;

/// Header stored once per tree at the store's header offset.
///
/// `entries_per_node` is fixed when the tree is created. `root` moves when the
/// tree grows a new root or collapses an empty one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub entries_per_node: u32,
    pub root: Offset,
}

impl Header {
    #[must_use]
    pub const fn new(entries_per_node: u32, root: Offset) -> Self {
        Self {
            entries_per_node,
            root,
        }
    }

    /// Capacity as a slot count.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.entries_per_node as usize
    }
}
