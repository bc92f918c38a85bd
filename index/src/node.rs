//! In-memory B-tree node.
//!
//! Every node owns storage for exactly `capacity` entries regardless of how
//! many are in use, so slot addressing stays O(1) and insert/remove cost at
//! most one O(capacity) shift.
//!
//! Children are identified by offset only. Position 0 is the leftmost child,
//! position `i >= 1` is the right child of entry `i - 1`. Loading a child is
//! the tree's job (see [`BTree::get_child`](crate::BTree::get_child)).

use crate::key::{Entry, Key, NULL_OFFSET, Offset};

/// One node of the tree.
///
/// # Invariants
/// - `count <= capacity`
/// - `entries[..count]` is strictly increasing by key
/// - the node is a leaf iff `left_child == NULL_OFFSET`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    offset: Offset,
    count: usize,
    left_child: Offset,
    entries: Box<[Entry]>,
}

impl Node {
    /// Create an empty leaf with room for `capacity` entries.
    #[must_use]
    pub fn new(offset: Offset, capacity: usize) -> Self {
        Self {
            offset,
            count: 0,
            left_child: NULL_OFFSET,
            entries: vec![Entry::default(); capacity].into_boxed_slice(),
        }
    }

    /// Rebuild a node from decoded parts.
    ///
    /// # Panics
    /// Panics if `entries` does not fit in `capacity`.
    #[must_use]
    pub fn from_parts(offset: Offset, capacity: usize, left_child: Offset, entries: &[Entry]) -> Self {
        assert!(
            entries.len() <= capacity,
            "node holds {} entries but capacity is {capacity}",
            entries.len()
        );
        let mut node = Self::new(offset, capacity);
        node.left_child = left_child;
        node.entries[..entries.len()].copy_from_slice(entries);
        node.count = entries.len();
        node
    }

    #[must_use]
    pub const fn offset(&self) -> Offset {
        self.offset
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    #[must_use]
    pub const fn left_child(&self) -> Offset {
        self.left_child
    }

    pub const fn set_left_child(&mut self, offset: Offset) {
        self.left_child = offset;
    }

    /// The entries currently in use.
    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries[..self.count]
    }

    /// # Panics
    /// Panics if `index >= count`.
    #[must_use]
    pub fn entry(&self, index: usize) -> Entry {
        self.entries()[index]
    }

    /// Replace the key of an existing entry, keeping its right child.
    ///
    /// The caller is responsible for keeping keys ordered.
    pub fn set_key(&mut self, index: usize, key: Key) {
        assert!(index < self.count, "set_key index {index} out of range (count {})", self.count);
        self.entries[index].key = key;
    }

    #[must_use]
    pub fn first_key(&self) -> Option<Key> {
        self.entries().first().map(|e| e.key)
    }

    #[must_use]
    pub fn last_key(&self) -> Option<Key> {
        self.entries().last().map(|e| e.key)
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        self.left_child == NULL_OFFSET
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Below minimum occupancy (`count < capacity / 2`).
    #[must_use]
    pub fn is_poor(&self) -> bool {
        self.count < self.capacity() / 2
    }

    /// Has an entry to spare (`count > capacity / 2`).
    #[must_use]
    pub fn is_plentiful(&self) -> bool {
        self.count > self.capacity() / 2
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    /// Offset of the child at `index` (0 = leftmost).
    ///
    /// Returns `NULL_OFFSET` for every position of a leaf.
    #[must_use]
    pub fn child(&self, index: usize) -> Offset {
        assert!(index <= self.count, "child index {index} out of range (count {})", self.count);
        if index == 0 {
            self.left_child
        } else {
            self.entries[index - 1].right_child
        }
    }

    /// Binary search over the used entries.
    ///
    /// Returns `(true, i)` on an exact match at `i`, otherwise `(false, i)`
    /// where `i` is the first entry greater than `key` (or `count`). In both
    /// cases `i` is also the child position to descend into on a miss.
    #[must_use]
    pub fn search(&self, key: &Key) -> (bool, usize) {
        match self.entries().binary_search_by(|e| e.key.cmp(key)) {
            Ok(i) => (true, i),
            Err(i) => (false, i),
        }
    }

    /// Shift-and-insert `entry` at `index`.
    ///
    /// # Panics
    /// Panics if the node is full or `index > count`. Callers split first.
    pub fn insert_entry(&mut self, entry: Entry, index: usize) {
        assert!(!self.is_full(), "insert_entry on full node at offset {}", self.offset);
        assert!(index <= self.count, "insert_entry index {index} out of range (count {})", self.count);
        self.entries.copy_within(index..self.count, index + 1);
        self.entries[index] = entry;
        self.count += 1;
    }

    /// Shift-and-remove the entry at `index`, returning it.
    ///
    /// # Panics
    /// Panics if `index >= count`.
    pub fn remove_entry(&mut self, index: usize) -> Entry {
        assert!(index < self.count, "remove_entry index {index} out of range (count {})", self.count);
        let removed = self.entries[index];
        self.entries.copy_within(index + 1..self.count, index);
        self.count -= 1;
        self.entries[self.count] = Entry::default();
        removed
    }

    /// Move `entries[index..count)` into the empty node `other`, which becomes
    /// the right sibling. This node keeps `entries[..index)`.
    pub fn split(&mut self, other: &mut Self, index: usize) {
        assert!(other.is_empty(), "split target at offset {} is not empty", other.offset);
        assert_eq!(other.capacity(), self.capacity(), "split between nodes of different capacity");
        assert!(index <= self.count, "split index {index} out of range (count {})", self.count);

        let moved = self.count - index;
        other.entries[..moved].copy_from_slice(&self.entries[index..self.count]);
        other.count = moved;
        self.entries[index..self.count].fill(Entry::default());
        self.count = index;
    }

    /// Append all of `other`'s entries after this node's own. `other` ends
    /// up empty.
    pub fn concatenate(&mut self, other: &mut Self) {
        assert!(
            self.count + other.count <= self.capacity(),
            "concatenate overflows node at offset {} ({} + {} > {})",
            self.offset,
            self.count,
            other.count,
            self.capacity()
        );
        let start = self.count;
        self.entries[start..start + other.count].copy_from_slice(other.entries());
        self.count += other.count;
        other.entries[..other.count].fill(Entry::default());
        other.count = 0;
    }
}
