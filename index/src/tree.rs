//! Persistent B-tree over `(primary, secondary)` keys.
//!
//! Nodes live in a [`NodeStore`] and are materialized on demand into a cache
//! keyed by offset. Children are always addressed by offset, never by
//! reference, so freeing a node can't leave a dangling child link behind.
//!
//! Every structural change is written back to the store before the operation
//! returns, so the cache never holds state the store lacks. [`BTree::flush`]
//! can drop it at any point between operations.
//!
//! Keys are unique. Adding a key twice is a no-op. [`BTree::search`] returns
//! the exact key or the smallest stored key above it.

use std::collections::{HashMap, VecDeque};
use std::collections::hash_map::Entry as Slot;

use crate::config::IndexConfig;
use crate::header::Header;
use crate::key::{Entry, Key, NULL_OFFSET, Offset};
use crate::layout::{
    ByteOrder, CorruptKind, HEADER_SIZE, decode_header, decode_node, encode_header, encode_node,
    is_valid_capacity, node_size,
};
use crate::node::Node;
use crate::store::{NodeStore, StoreError};

/// Deepest tree the checker will descend before reporting a cycle.
const MAX_CHECK_DEPTH: usize = 64;

/// Result of inserting below a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Insertion {
    /// The entry now lives somewhere in the subtree.
    Absorbed,
    /// The key was already present.
    Duplicate,
    /// A split pushed the entry back up; the caller must insert it.
    Pending,
}

/// Summary returned by [`BTree::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub height: usize,
    pub nodes: usize,
    pub keys: usize,
}

/// A B-tree backed by a node store.
pub struct BTree<S: NodeStore> {
    store: S,
    header: Header,
    order: ByteOrder,
    max_cached_nodes: usize,
    cache: HashMap<Offset, Node>,
    /// Blocks reserved for the splits of the insert in progress.
    spare: VecDeque<Offset>,
}

impl<S: NodeStore> BTree<S> {
    /// Open the tree stored in `store`, creating an empty one if the store
    /// holds no header yet.
    ///
    /// An existing tree keeps its persisted capacity and byte order;
    /// `config.entries_per_node` and `config.byte_order` only apply to new
    /// trees.
    pub fn open(mut store: S, config: IndexConfig) -> Result<Self, BTreeError> {
        let mut tree = match read_header(&mut store)? {
            Some((header, order)) => Self::existing(store, header, order, &config)?,
            None => {
                if !is_valid_capacity(config.entries_per_node) {
                    return Err(BTreeError::InvalidCapacity(config.entries_per_node));
                }
                let capacity = config.entries_per_node as usize;
                check_block_size(&store, capacity)?;

                let root = store.allocate(node_size(capacity))?;
                write_node(&mut store, &Node::new(root, capacity), config.byte_order)?;

                let header = Header::new(config.entries_per_node, root);
                let mut tree = Self::with_parts(store, header, config.byte_order, config.max_cached_nodes);
                tree.write_header()?;
                tracing::info!(
                    root,
                    entries_per_node = config.entries_per_node,
                    order = %config.byte_order,
                    "created ordered index"
                );
                tree
            }
        };

        let root = tree.header.root;
        tree.load(root)?;
        Ok(tree)
    }

    /// Open the tree stored in `store` without creating one.
    ///
    /// Nothing is written to the store. Fails with
    /// [`BTreeError::MissingHeader`] if it holds no tree.
    pub fn open_existing(mut store: S, config: IndexConfig) -> Result<Self, BTreeError> {
        let Some((header, order)) = read_header(&mut store)? else {
            return Err(BTreeError::MissingHeader);
        };
        let mut tree = Self::existing(store, header, order, &config)?;
        let root = tree.header.root;
        tree.load(root)?;
        Ok(tree)
    }

    fn existing(store: S, header: Header, order: ByteOrder, config: &IndexConfig) -> Result<Self, BTreeError> {
        check_block_size(&store, header.capacity())?;
        if order != ByteOrder::NATIVE {
            tracing::warn!(
                %order,
                native = %ByteOrder::NATIVE,
                "index was written with the opposite byte order, flipping reads"
            );
        }
        if header.entries_per_node != config.entries_per_node {
            tracing::debug!(
                requested = config.entries_per_node,
                persisted = header.entries_per_node,
                "using persisted node capacity"
            );
        }
        tracing::info!(
            root = header.root,
            entries_per_node = header.entries_per_node,
            "opened ordered index"
        );
        Ok(Self::with_parts(store, header, order, config.max_cached_nodes))
    }

    fn with_parts(store: S, header: Header, order: ByteOrder, max_cached_nodes: usize) -> Self {
        Self {
            store,
            header,
            order,
            max_cached_nodes,
            cache: HashMap::new(),
            spare: VecDeque::new(),
        }
    }

    /// Release the cache and hand back the store.
    pub fn into_store(self) -> S {
        self.store
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Direct access to the store. Writing node blocks behind the tree's
    /// back is only safe after a [`flush`](Self::flush).
    #[allow(clippy::missing_const_for_fn)] // mutable references can't be const
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    #[must_use]
    pub const fn header(&self) -> &Header {
        &self.header
    }

    #[must_use]
    pub const fn entries_per_node(&self) -> u32 {
        self.header.entries_per_node
    }

    /// Byte order of the persisted tree.
    #[must_use]
    pub const fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// Number of nodes currently materialized.
    #[must_use]
    pub fn cached_nodes(&self) -> usize {
        self.cache.len()
    }

    /// The root node.
    pub fn root(&mut self) -> Result<&Node, BTreeError> {
        let root = self.header.root;
        self.load(root).map(|node| &*node)
    }

    /// Child `index` of the node at `parent` (0 = leftmost), loading it from
    /// the store if it is not cached. `None` at a leaf edge.
    pub fn get_child(&mut self, parent: Offset, index: usize) -> Result<Option<&Node>, BTreeError> {
        let child = self.load(parent)?.child(index);
        if child == NULL_OFFSET {
            return Ok(None);
        }
        self.load(child).map(|node| Some(&*node))
    }

    /// Find `key`, or failing that the smallest stored key greater than it.
    ///
    /// Returns `None` when every stored key is smaller.
    pub fn search(&mut self, key: &Key) -> Result<Option<Key>, BTreeError> {
        let mut candidate = None;
        let mut offset = self.header.root;
        loop {
            let node = self.load(offset)?;
            let (found, index) = node.search(key);
            if found {
                return Ok(Some(*key));
            }
            // Keys further down this path are all below entries[index].
            if index < node.count() {
                candidate = Some(node.entry(index).key);
            }
            let child = node.child(index);
            if child == NULL_OFFSET {
                return Ok(candidate);
            }
            offset = child;
        }
    }

    pub fn contains(&mut self, key: &Key) -> Result<bool, BTreeError> {
        Ok(self.search(key)? == Some(*key))
    }

    /// Smallest key in the tree.
    pub fn first(&mut self) -> Result<Option<Key>, BTreeError> {
        let mut offset = self.header.root;
        loop {
            let node = self.load(offset)?;
            if node.is_leaf() {
                return Ok(node.first_key());
            }
            offset = node.left_child();
        }
    }

    /// Largest key in the tree.
    pub fn last(&mut self) -> Result<Option<Key>, BTreeError> {
        let mut offset = self.header.root;
        loop {
            let node = self.load(offset)?;
            if node.is_leaf() {
                return Ok(node.last_key());
            }
            offset = node.child(node.count());
        }
    }

    /// Insert `key`.
    ///
    /// Returns `false` if the key was already present, in which case the
    /// tree is left untouched.
    ///
    /// Every block the insert can split into is allocated before any node
    /// changes. If the store runs out the error is returned and the tree
    /// still holds exactly the keys it held before.
    pub fn add(&mut self, key: Key) -> Result<bool, BTreeError> {
        let Some(blocks) = self.blocks_needed(&key)? else {
            return Ok(false);
        };
        self.reserve(blocks)?;

        let mut entry = Entry::leaf(key);
        let root = self.header.root;
        let inserted = self.insert(&mut entry, root).and_then(|outcome| {
            if outcome == Insertion::Pending {
                self.grow_root(entry)?;
            }
            Ok(outcome)
        });
        let released = self.release_spare();
        let outcome = inserted?;
        released?;

        self.flush_if_needed()?;
        Ok(outcome != Insertion::Duplicate)
    }

    /// Number of new nodes inserting `key` will allocate, or `None` if the
    /// key is already present.
    ///
    /// Only the run of full nodes directly above the leaf splits. A path
    /// that is full all the way up also grows a new root.
    fn blocks_needed(&mut self, key: &Key) -> Result<Option<usize>, BTreeError> {
        let mut depth = 0;
        let mut full_run = 0;
        let mut offset = self.header.root;
        loop {
            let node = self.load(offset)?;
            let (found, index) = node.search(key);
            if found {
                return Ok(None);
            }
            depth += 1;
            full_run = if node.is_full() { full_run + 1 } else { 0 };

            let child = node.child(index);
            if child == NULL_OFFSET {
                break;
            }
            offset = child;
        }
        Ok(Some(if full_run == depth { full_run + 1 } else { full_run }))
    }

    fn reserve(&mut self, blocks: usize) -> Result<(), BTreeError> {
        let size = node_size(self.header.capacity());
        while self.spare.len() < blocks {
            match self.store.allocate(size) {
                Ok(offset) => self.spare.push_back(offset),
                Err(e) => {
                    if let Err(free_err) = self.release_spare() {
                        tracing::warn!(error = %free_err, "failed to return reserved blocks");
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn take_spare(&mut self) -> Result<Offset, BTreeError> {
        self.spare
            .pop_front()
            .ok_or_else(|| BTreeError::Invariant("split without a reserved block".to_string()))
    }

    fn release_spare(&mut self) -> Result<(), BTreeError> {
        while let Some(offset) = self.spare.pop_back() {
            self.store.free(offset)?;
        }
        Ok(())
    }

    fn insert(&mut self, entry: &mut Entry, offset: Offset) -> Result<Insertion, BTreeError> {
        let node = self.load(offset)?;
        let (found, index) = node.search(&entry.key);
        if found {
            return Ok(Insertion::Duplicate);
        }

        let child = node.child(index);
        if child != NULL_OFFSET {
            let outcome = self.insert(entry, child)?;
            if outcome != Insertion::Pending {
                return Ok(outcome);
            }
        }
        self.insert_at(offset, entry, index)
    }

    /// Insert `entry` at `index` of the node at `offset`, splitting it if
    /// full. After a split `entry` is replaced by the promoted median.
    fn insert_at(&mut self, offset: Offset, entry: &mut Entry, index: usize) -> Result<Insertion, BTreeError> {
        let node = self.load(offset)?;
        if !node.is_full() {
            node.insert_entry(*entry, index);
            self.persist(offset)?;
            return Ok(Insertion::Absorbed);
        }

        let capacity = self.header.capacity();
        let right_offset = self.take_spare()?;
        let mut left = self.take(offset)?;
        let mut right = Node::new(right_offset, capacity);

        // Both halves end with at least capacity / 2 entries.
        let mid = capacity / 2;
        if index < mid {
            left.split(&mut right, mid - 1);
            left.insert_entry(*entry, index);
        } else {
            left.split(&mut right, mid);
            right.insert_entry(*entry, index - mid);
        }

        let mut promoted = right.remove_entry(0);
        right.set_left_child(promoted.right_child);
        promoted.right_child = right_offset;
        *entry = promoted;

        tracing::debug!(
            left = offset,
            right = right_offset,
            promoted = %promoted.key,
            "split node"
        );
        self.put(right)?;
        self.put(left)?;
        Ok(Insertion::Pending)
    }

    fn grow_root(&mut self, entry: Entry) -> Result<(), BTreeError> {
        let capacity = self.header.capacity();
        let old_root = self.header.root;
        let new_root = self.take_spare()?;
        self.put(Node::from_parts(new_root, capacity, old_root, &[entry]))?;

        self.header.root = new_root;
        self.write_header()?;
        tracing::debug!(old_root, new_root, "grew new root");
        Ok(())
    }

    /// Remove `key`. Returns `false` if it was not present.
    pub fn delete(&mut self, key: &Key) -> Result<bool, BTreeError> {
        let root = self.header.root;
        let removed = self.remove(key, root)?;
        if removed {
            self.collapse_root()?;
        }
        self.flush_if_needed()?;
        Ok(removed)
    }

    fn remove(&mut self, key: &Key, offset: Offset) -> Result<bool, BTreeError> {
        let node = self.load(offset)?;
        let (found, index) = node.search(key);

        if found {
            let right = node.child(index + 1);
            if right == NULL_OFFSET {
                node.remove_entry(index);
                self.persist(offset)?;
                return Ok(true);
            }

            let successor = self.leftmost_key(right)?;
            self.load(offset)?.set_key(index, successor);
            self.persist(offset)?;
            self.remove(&successor, right)?;
            if self.load(right)?.is_poor() {
                self.restore_balance(offset, index + 1)?;
            }
            return Ok(true);
        }

        let child = node.child(index);
        if child == NULL_OFFSET || !self.remove(key, child)? {
            return Ok(false);
        }
        if self.load(child)?.is_poor() {
            self.restore_balance(offset, index)?;
        }
        Ok(true)
    }

    fn leftmost_key(&mut self, mut offset: Offset) -> Result<Key, BTreeError> {
        loop {
            let node = self.load(offset)?;
            if node.is_leaf() {
                return node
                    .first_key()
                    .ok_or_else(|| BTreeError::Invariant(format!("empty non-root leaf at offset {offset}")));
            }
            offset = node.left_child();
        }
    }

    /// Refill child `child_index` of `parent` after it dropped below minimum
    /// occupancy, by borrowing from a sibling or merging with one.
    fn restore_balance(&mut self, parent: Offset, child_index: usize) -> Result<(), BTreeError> {
        let node = self.load(parent)?;
        let count = node.count();
        assert!(count > 0, "restore_balance on empty node at offset {parent}");

        let separator = if child_index < count { child_index } else { count - 1 };
        let left = node.child(separator);
        let right = node.child(separator + 1);

        if self.load(left)?.is_plentiful() {
            self.rotate_right(parent, separator)
        } else if self.load(right)?.is_plentiful() {
            self.rotate_left(parent, separator)
        } else {
            self.merge(parent, separator)
        }
    }

    /// Move the last entry of the left sibling up through the separator and
    /// the separator down into the front of the right sibling.
    fn rotate_right(&mut self, parent: Offset, separator: usize) -> Result<(), BTreeError> {
        let (mut left, mut right) = self.take_siblings(parent, separator)?;

        let borrowed = left.remove_entry(left.count() - 1);
        let node = self.load(parent)?;
        let down = node.entry(separator).key;
        node.set_key(separator, borrowed.key);

        right.insert_entry(Entry::new(down, right.left_child()), 0);
        right.set_left_child(borrowed.right_child);

        tracing::trace!(parent, left = left.offset(), right = right.offset(), "rotated right");
        self.persist(parent)?;
        self.put(left)?;
        self.put(right)
    }

    /// Move the first entry of the right sibling up through the separator and
    /// the separator down onto the end of the left sibling.
    fn rotate_left(&mut self, parent: Offset, separator: usize) -> Result<(), BTreeError> {
        let (mut left, mut right) = self.take_siblings(parent, separator)?;

        let borrowed = right.remove_entry(0);
        let node = self.load(parent)?;
        let down = node.entry(separator).key;
        node.set_key(separator, borrowed.key);

        left.insert_entry(Entry::new(down, right.left_child()), left.count());
        right.set_left_child(borrowed.right_child);

        tracing::trace!(parent, left = left.offset(), right = right.offset(), "rotated left");
        self.persist(parent)?;
        self.put(left)?;
        self.put(right)
    }

    /// Fold the separator and the right sibling into the left sibling and
    /// free the right sibling.
    fn merge(&mut self, parent: Offset, separator: usize) -> Result<(), BTreeError> {
        let (mut left, mut right) = self.take_siblings(parent, separator)?;

        let down = self.load(parent)?.remove_entry(separator);
        left.insert_entry(Entry::new(down.key, right.left_child()), left.count());
        left.concatenate(&mut right);

        tracing::debug!(
            parent,
            left = left.offset(),
            freed = right.offset(),
            entries = left.count(),
            "merged nodes"
        );
        self.persist(parent)?;
        self.put(left)?;
        self.discard(right)
    }

    /// Replace an empty internal root by its only child.
    fn collapse_root(&mut self) -> Result<(), BTreeError> {
        let root = self.header.root;
        let node = self.load(root)?;
        if !node.is_empty() || node.is_leaf() {
            return Ok(());
        }

        let child = node.left_child();
        let old = self.take(root)?;
        self.header.root = child;
        self.write_header()?;
        self.discard(old)?;
        tracing::debug!(old_root = root, new_root = child, "collapsed root");
        Ok(())
    }

    /// Drop every cached node and reload the root from the store.
    pub fn flush(&mut self) -> Result<(), BTreeError> {
        let released = self.cache.len();
        self.cache.clear();
        let root = self.header.root;
        self.load(root)?;
        tracing::debug!(released, "flushed node cache");
        Ok(())
    }

    fn flush_if_needed(&mut self) -> Result<(), BTreeError> {
        if self.max_cached_nodes > 0 && self.cache.len() > self.max_cached_nodes {
            self.flush()?;
        }
        Ok(())
    }

    /// Make every write so far durable.
    pub fn sync(&mut self) -> Result<(), BTreeError> {
        self.store.sync()?;
        Ok(())
    }

    /// All keys in ascending order.
    pub fn keys(&mut self) -> Result<Vec<Key>, BTreeError> {
        let mut keys = Vec::new();
        let root = self.header.root;
        self.collect_keys(root, &mut keys)?;
        Ok(keys)
    }

    fn collect_keys(&mut self, offset: Offset, keys: &mut Vec<Key>) -> Result<(), BTreeError> {
        let node = self.peek(offset)?;
        if !node.is_leaf() {
            self.collect_keys(node.left_child(), keys)?;
        }
        for entry in node.entries() {
            keys.push(entry.key);
            if entry.right_child != NULL_OFFSET {
                self.collect_keys(entry.right_child, keys)?;
            }
        }
        Ok(())
    }

    /// Number of keys, counted by traversal.
    pub fn len(&mut self) -> Result<usize, BTreeError> {
        Ok(self.check()?.keys)
    }

    pub fn is_empty(&mut self) -> Result<bool, BTreeError> {
        Ok(self.root()?.is_empty())
    }

    /// Number of levels, 1 for a tree that is a single leaf.
    pub fn height(&mut self) -> Result<usize, BTreeError> {
        let mut height = 1;
        let mut offset = self.header.root;
        loop {
            let node = self.load(offset)?;
            if node.is_leaf() {
                return Ok(height);
            }
            offset = node.left_child();
            height += 1;
        }
    }

    /// Walk the whole tree and verify its structure.
    ///
    /// Checks key order across nodes, minimum occupancy of non-root nodes,
    /// child links and uniform leaf depth. Nodes are read without being
    /// cached.
    pub fn check(&mut self) -> Result<TreeStats, BTreeError> {
        let mut walk = CheckWalk::default();
        let root = self.header.root;
        self.check_node(root, None, None, 1, &mut walk)?;
        Ok(TreeStats {
            height: walk.leaf_depth.unwrap_or(1),
            nodes: walk.nodes,
            keys: walk.keys,
        })
    }

    fn check_node(
        &mut self,
        offset: Offset,
        lower: Option<Key>,
        upper: Option<Key>,
        depth: usize,
        walk: &mut CheckWalk,
    ) -> Result<(), BTreeError> {
        if depth > MAX_CHECK_DEPTH {
            return Err(BTreeError::Invariant(format!(
                "tree deeper than {MAX_CHECK_DEPTH} levels at offset {offset}"
            )));
        }
        let node = self.peek(offset)?;
        walk.nodes += 1;
        walk.keys += node.count();

        let is_root = depth == 1;
        if !is_root && node.is_poor() {
            return Err(BTreeError::Invariant(format!(
                "node at offset {offset} holds {} entries, minimum is {}",
                node.count(),
                node.capacity() / 2
            )));
        }
        if is_root && !node.is_leaf() && node.is_empty() {
            return Err(BTreeError::Invariant(format!(
                "internal root at offset {offset} has no entries"
            )));
        }

        let mut previous = lower;
        for entry in node.entries() {
            if previous.is_some_and(|p| entry.key <= p) {
                return Err(BTreeError::Invariant(format!(
                    "key {} at offset {offset} is out of order",
                    entry.key
                )));
            }
            previous = Some(entry.key);
        }
        if let (Some(last), Some(upper)) = (node.last_key(), upper) {
            if last >= upper {
                return Err(BTreeError::Invariant(format!(
                    "key {last} at offset {offset} is not below {upper}"
                )));
            }
        }

        if node.is_leaf() {
            if node.entries().iter().any(|e| e.right_child != NULL_OFFSET) {
                return Err(BTreeError::Invariant(format!(
                    "leaf at offset {offset} has a right child"
                )));
            }
            match walk.leaf_depth {
                None => walk.leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    return Err(BTreeError::Invariant(format!(
                        "leaf at offset {offset} is at depth {depth}, expected {expected}"
                    )));
                }
                Some(_) => {}
            }
            return Ok(());
        }

        for index in 0..=node.count() {
            let child = node.child(index);
            if child == NULL_OFFSET {
                return Err(BTreeError::Invariant(format!(
                    "internal node at offset {offset} is missing child {index}"
                )));
            }
            let child_lower = if index == 0 { lower } else { Some(node.entry(index - 1).key) };
            let child_upper = if index < node.count() { Some(node.entry(index).key) } else { upper };
            self.check_node(child, child_lower, child_upper, depth + 1, walk)?;
        }
        Ok(())
    }

    /// Cached node at `offset`, read from the store on a miss.
    fn load(&mut self, offset: Offset) -> Result<&mut Node, BTreeError> {
        let capacity = self.header.capacity();
        match self.cache.entry(offset) {
            Slot::Occupied(slot) => Ok(slot.into_mut()),
            Slot::Vacant(slot) => {
                let node = read_node(&mut self.store, offset, capacity, self.order)?;
                tracing::trace!(offset, count = node.count(), "loaded node");
                Ok(slot.insert(node))
            }
        }
    }

    /// Copy of the node at `offset` without caching it.
    fn peek(&mut self, offset: Offset) -> Result<Node, BTreeError> {
        match self.cache.get(&offset) {
            Some(node) => Ok(node.clone()),
            None => read_node(&mut self.store, offset, self.header.capacity(), self.order),
        }
    }

    /// Remove a node from the cache for a multi-node update.
    fn take(&mut self, offset: Offset) -> Result<Node, BTreeError> {
        self.load(offset)?;
        self.cache
            .remove(&offset)
            .ok_or_else(|| BTreeError::Invariant(format!("node at offset {offset} vanished from cache")))
    }

    fn take_siblings(&mut self, parent: Offset, separator: usize) -> Result<(Node, Node), BTreeError> {
        let node = self.load(parent)?;
        let left = node.child(separator);
        let right = node.child(separator + 1);
        Ok((self.take(left)?, self.take(right)?))
    }

    /// Write a node and return it to the cache.
    fn put(&mut self, node: Node) -> Result<(), BTreeError> {
        write_node(&mut self.store, &node, self.order)?;
        self.cache.insert(node.offset(), node);
        Ok(())
    }

    /// Write the cached node at `offset` back to the store.
    fn persist(&mut self, offset: Offset) -> Result<(), BTreeError> {
        let node = self
            .cache
            .get(&offset)
            .ok_or_else(|| BTreeError::Invariant(format!("persisting uncached node at offset {offset}")))?;
        write_node(&mut self.store, node, self.order)
    }

    /// Free an emptied node's block.
    fn discard(&mut self, node: Node) -> Result<(), BTreeError> {
        assert!(
            node.is_empty(),
            "freeing node at offset {} that still holds {} entries",
            node.offset(),
            node.count()
        );
        self.cache.remove(&node.offset());
        self.store.free(node.offset())?;
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), BTreeError> {
        let offset = self.store.header_offset();
        self.store.write(offset, &encode_header(&self.header, self.order))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CheckWalk {
    leaf_depth: Option<usize>,
    nodes: usize,
    keys: usize,
}

/// Read and validate the header anchor. `None` if no tree was ever written.
fn read_header<S: NodeStore>(store: &mut S) -> Result<Option<(Header, ByteOrder)>, BTreeError> {
    let header_offset = store.header_offset();
    let mut buf = [0u8; HEADER_SIZE];
    let read = store.read(header_offset, &mut buf)?;
    if read < HEADER_SIZE {
        return Err(BTreeError::Corrupt {
            offset: header_offset,
            kind: CorruptKind::Truncated {
                expected: HEADER_SIZE,
                actual: read,
            },
        });
    }
    decode_header(&buf).map_err(|kind| BTreeError::Corrupt {
        offset: header_offset,
        kind,
    })
}

fn check_block_size<S: NodeStore>(store: &S, capacity: usize) -> Result<(), BTreeError> {
    let required = node_size(capacity);
    let available = store.block_size();
    if required > available {
        return Err(BTreeError::BlockTooSmall { required, available });
    }
    Ok(())
}

fn read_node<S: NodeStore>(
    store: &mut S,
    offset: Offset,
    capacity: usize,
    order: ByteOrder,
) -> Result<Node, BTreeError> {
    let mut buf = vec![0u8; node_size(capacity)];
    let read = store.read(offset, &mut buf)?;
    decode_node(&buf[..read], offset, capacity, order).map_err(|kind| BTreeError::Corrupt { offset, kind })
}

fn write_node<S: NodeStore>(store: &mut S, node: &Node, order: ByteOrder) -> Result<(), BTreeError> {
    store.write(node.offset(), &encode_node(node, order))?;
    Ok(())
}

/// Errors that can occur during tree operations.
#[derive(Debug)]
pub enum BTreeError {
    /// Node store error, including allocation failure.
    Store(StoreError),
    /// A persisted header or node failed validation.
    Corrupt { offset: Offset, kind: CorruptKind },
    /// Requested entries per node outside the supported range.
    InvalidCapacity(u32),
    /// Store blocks can't hold a node of this capacity.
    BlockTooSmall { required: usize, available: usize },
    /// The store holds no tree.
    MissingHeader,
    /// Structural check failed.
    Invariant(String),
}

impl BTreeError {
    /// Whether this is the store running out of blocks.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Store(StoreError::Exhausted { .. }))
    }
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Corrupt { offset, kind } => write!(f, "corrupt index at offset {offset}: {kind}"),
            Self::InvalidCapacity(capacity) => write!(f, "invalid entries per node: {capacity}"),
            Self::BlockTooSmall { required, available } => write!(
                f,
                "node needs {required} bytes but store blocks hold {available}"
            ),
            Self::MissingHeader => write!(f, "store holds no index header"),
            Self::Invariant(msg) => write!(f, "invariant violated: {msg}"),
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for BTreeError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::HEADER_MAGIC;
    use crate::store::{DirStore, FileStore, MemoryStore};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn key(n: u64) -> Key {
        Key::new(n, 0)
    }

    fn config(entries_per_node: u32) -> IndexConfig {
        IndexConfig::with_entries_per_node(entries_per_node)
    }

    fn memory_tree(entries_per_node: u32) -> BTree<MemoryStore> {
        BTree::open(MemoryStore::new(), config(entries_per_node)).expect("open tree")
    }

    #[test]
    fn test_empty_tree() {
        let mut tree = memory_tree(4);
        assert_eq!(tree.search(&key(1)).expect("search"), None);
        assert_eq!(tree.first().expect("first"), None);
        assert_eq!(tree.last().expect("last"), None);
        assert!(tree.is_empty().expect("is_empty"));
        assert!(!tree.delete(&key(1)).expect("delete"));
        assert_eq!(
            tree.check().expect("check"),
            TreeStats {
                height: 1,
                nodes: 1,
                keys: 0
            }
        );
    }

    #[test]
    fn test_nearest_larger() {
        let mut tree = memory_tree(4);
        for n in [1, 5, 10] {
            assert!(tree.add(key(n)).expect("add"));
        }

        assert_eq!(tree.search(&key(3)).expect("search"), Some(key(5)));
        assert_eq!(tree.search(&key(10)).expect("search"), Some(key(10)));
        assert_eq!(tree.search(&key(11)).expect("search"), None);
        assert_eq!(tree.search(&key(0)).expect("search"), Some(key(1)));
        assert_eq!(tree.search(&Key::new(5, 1)).expect("search"), Some(key(10)));
    }

    #[test]
    fn test_nearest_larger_across_levels() {
        let mut tree = memory_tree(2);
        for n in (0..200).map(|n| n * 10) {
            tree.add(key(n)).expect("add");
        }
        assert!(tree.height().expect("height") > 2);

        for query in 0..=1990u64 {
            let expected = query.div_ceil(10) * 10;
            assert_eq!(
                tree.search(&key(query)).expect("search"),
                Some(key(expected)),
                "query {query}"
            );
        }
        assert_eq!(tree.search(&key(1991)).expect("search"), None);
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let mut tree = memory_tree(4);
        for n in 0..10 {
            tree.add(key(n)).expect("add");
        }
        let before = tree.keys().expect("keys");
        let writes = tree.store().stats().writes;

        assert!(!tree.add(key(3)).expect("add duplicate"));
        assert_eq!(tree.keys().expect("keys"), before);
        assert_eq!(tree.store().stats().writes, writes);
    }

    #[test]
    fn test_add_delete_round_trip() {
        let mut tree = memory_tree(3);
        for n in (0..50).map(|n| n * 2) {
            tree.add(key(n)).expect("add");
        }
        let before = tree.keys().expect("keys");

        for n in (0..50).map(|n| n * 2 + 1) {
            assert!(tree.add(key(n)).expect("add"));
            assert!(tree.delete(&key(n)).expect("delete"));
            assert_eq!(tree.keys().expect("keys"), before);
            tree.check().expect("check");
        }
    }

    #[test]
    fn test_delete_miss_leaves_tree_unchanged() {
        let mut tree = memory_tree(4);
        for n in 0..20 {
            tree.add(key(n * 3)).expect("add");
        }
        let before = tree.keys().expect("keys");
        let writes = tree.store().stats().writes;

        assert!(!tree.delete(&key(4)).expect("delete"));
        assert!(!tree.delete(&key(1000)).expect("delete"));
        assert_eq!(tree.keys().expect("keys"), before);
        assert_eq!(tree.store().stats().writes, writes);
    }

    /// Fill a tree of `capacity` to exactly two levels, delete `doomed` in
    /// order and expect a lone leaf holding `survivor`.
    fn assert_collapses(capacity: u32, doomed: &[u64], survivor: u64) {
        let mut tree = memory_tree(capacity);
        for n in 1..=u64::from(capacity) + 1 {
            tree.add(key(n)).expect("add");
        }

        assert_eq!(tree.height().expect("height"), 2, "capacity {capacity}");
        assert_eq!(tree.root().expect("root").count(), 1, "capacity {capacity}");
        tree.check().expect("check");

        for &n in doomed {
            assert!(tree.delete(&key(n)).expect("delete"), "capacity {capacity}, key {n}");
            tree.check().expect("check");
        }

        let root = tree.root().expect("root");
        assert!(root.is_leaf(), "capacity {capacity}");
        assert_eq!(root.count(), 1);
        assert_eq!(root.entry(0).key, key(survivor));
        assert_eq!(tree.height().expect("height"), 1);
        assert_eq!(tree.store().live_blocks(), 1);
    }

    #[test]
    fn test_split_and_collapse() {
        for capacity in 2..=9u32 {
            let last = u64::from(capacity) + 1;
            let doomed: Vec<u64> = (1..last).collect();
            assert_collapses(capacity, &doomed, last);
        }
    }

    #[test]
    fn test_collapse_from_high_end() {
        for capacity in 2..=9u32 {
            let last = u64::from(capacity) + 1;
            let doomed: Vec<u64> = (2..=last).rev().collect();
            assert_collapses(capacity, &doomed, 1);
        }
    }

    #[test]
    fn test_collapse_interleaved() {
        for capacity in 2..=9u32 {
            let last = u64::from(capacity) + 1;
            let middle = last.div_ceil(2);
            let doomed: Vec<u64> = (1..=last)
                .filter(|n| n % 2 == 0)
                .chain((1..=last).filter(|n| n % 2 == 1))
                .filter(|&n| n != middle)
                .collect();
            assert_collapses(capacity, &doomed, middle);
        }
    }

    #[test]
    fn test_split_keeps_halves_balanced() {
        let mut tree = memory_tree(6);
        for n in [10, 20, 30, 40, 50, 60, 5] {
            tree.add(key(n)).expect("add");
        }
        let root = tree.header().root;
        let left = tree.get_child(root, 0).expect("child").expect("left").count();
        let right = tree.get_child(root, 1).expect("child").expect("right").count();
        assert_eq!(left + right, 6);
        assert!(left >= 3 && right >= 3);
        assert!(tree.get_child(root, 1).expect("child").is_some());

        let leaf = tree.root().expect("root").left_child();
        assert!(tree.get_child(leaf, 0).expect("child").is_none());
    }

    #[test]
    fn test_delete_internal_key_uses_successor() {
        let mut tree = memory_tree(2);
        for n in 1..=20 {
            tree.add(key(n)).expect("add");
        }
        let root_key = tree.root().expect("root").entry(0).key;

        assert!(tree.delete(&root_key).expect("delete"));
        assert!(!tree.contains(&root_key).expect("contains"));
        tree.check().expect("check");

        let expected: Vec<Key> = (1..=20).filter(|&n| key(n) != root_key).map(key).collect();
        assert_eq!(tree.keys().expect("keys"), expected);
    }

    #[test]
    fn test_delete_everything_frees_all_but_root() {
        let mut tree = memory_tree(4);
        for n in 0..500 {
            tree.add(key(n)).expect("add");
        }
        for n in (0..500).rev() {
            assert!(tree.delete(&key(n)).expect("delete"));
        }
        assert!(tree.is_empty().expect("is_empty"));
        assert_eq!(tree.store().live_blocks(), 1);
        assert_eq!(tree.store().stats().allocations, tree.store().stats().frees + 1);
    }

    #[test]
    fn test_random_operations_match_btreeset() {
        for (seed, capacity) in [(1u64, 2u32), (2, 3), (3, 4), (4, 5), (5, 8), (6, 16)] {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut tree = memory_tree(capacity);
            let mut model = BTreeSet::new();

            for _ in 0..1500 {
                let k = Key::new(rng.random_range(0..200), rng.random_range(0..3));
                if rng.random_bool(0.6) {
                    assert_eq!(tree.add(k).expect("add"), model.insert(k));
                } else {
                    assert_eq!(tree.delete(&k).expect("delete"), model.remove(&k));
                }

                let stats = tree.check().expect("check");
                assert_eq!(stats.keys, model.len());

                let query = Key::new(rng.random_range(0..210), rng.random_range(0..3));
                assert_eq!(
                    tree.search(&query).expect("search"),
                    model.range(query..).next().copied(),
                    "seed {seed} query {query}"
                );
            }

            assert_eq!(
                tree.keys().expect("keys"),
                model.iter().copied().collect::<Vec<_>>()
            );
            assert_eq!(tree.first().expect("first"), model.first().copied());
            assert_eq!(tree.last().expect("last"), model.last().copied());
        }
    }

    #[test]
    fn test_flush_is_transparent() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut plain = memory_tree(4);
        let mut flushed = memory_tree(4);

        for _ in 0..1000 {
            let k = key(rng.random_range(0..300));
            let adding = rng.random_bool(0.55);
            let (a, b) = if adding {
                (plain.add(k).expect("add"), flushed.add(k).expect("add"))
            } else {
                (plain.delete(&k).expect("delete"), flushed.delete(&k).expect("delete"))
            };
            assert_eq!(a, b);

            flushed.flush().expect("flush");
            assert_eq!(flushed.cached_nodes(), 1);

            let query = key(rng.random_range(0..300));
            assert_eq!(
                plain.search(&query).expect("search"),
                flushed.search(&query).expect("search")
            );
        }
        assert_eq!(plain.keys().expect("keys"), flushed.keys().expect("keys"));
    }

    #[test]
    fn test_automatic_flush_bounds_cache() {
        let config = IndexConfig {
            max_cached_nodes: 3,
            ..config(2)
        };
        let mut tree = BTree::open(MemoryStore::new(), config).expect("open tree");
        for n in 0..300 {
            tree.add(key(n)).expect("add");
            assert!(tree.cached_nodes() <= 3);
        }
        for n in 0..300 {
            tree.delete(&key(n)).expect("delete");
            assert!(tree.cached_nodes() <= 3);
        }
    }

    #[test]
    fn test_invalid_capacity() {
        for bad in [0, 1, 4097] {
            let result = BTree::open(MemoryStore::new(), config(bad));
            assert!(matches!(result, Err(BTreeError::InvalidCapacity(c)) if c == bad));
        }
    }

    #[test]
    fn test_block_too_small() {
        let result = BTree::open(MemoryStore::with_block_size(100), config(64));
        assert!(matches!(
            result,
            Err(BTreeError::BlockTooSmall {
                required,
                available: 100
            }) if required == node_size(64)
        ));
    }

    #[test]
    fn test_exhaustion_propagates() {
        let mut tree = BTree::open(MemoryStore::new().with_limit(1), config(4)).expect("open tree");
        for n in 0..4 {
            tree.add(key(n)).expect("add");
        }

        let err = tree.add(key(4)).expect_err("split needs a block");
        assert!(err.is_exhausted(), "unexpected error: {err}");
        assert!(matches!(err, BTreeError::Store(StoreError::Exhausted { limit: 1 })));
    }

    #[test]
    fn test_exhausted_root_growth_keeps_keys() {
        let mut tree = BTree::open(MemoryStore::new().with_limit(2), config(4)).expect("open tree");
        for n in 0..4 {
            tree.add(key(n)).expect("add");
        }

        // The leaf split fits under the limit but the new root does not.
        let err = tree.add(key(4)).expect_err("new root needs a third block");
        assert!(err.is_exhausted(), "unexpected error: {err}");
        assert_eq!(tree.store().live_blocks(), 1);

        tree.flush().expect("flush");
        assert_eq!(tree.keys().expect("keys"), (0..4).map(key).collect::<Vec<_>>());
        assert!(!tree.contains(&key(4)).expect("contains"));
        assert_eq!(tree.check().expect("check").nodes, 1);
    }

    #[test]
    fn test_exhaustion_never_loses_keys() {
        let mut tree = BTree::open(MemoryStore::new().with_limit(40), config(2)).expect("open tree");
        let mut added = Vec::new();
        let err = loop {
            let next = key(added.len() as u64);
            match tree.add(next) {
                Ok(inserted) => {
                    assert!(inserted);
                    added.push(next);
                }
                Err(e) => break e,
            }
        };
        assert!(err.is_exhausted(), "unexpected error: {err}");
        assert!(added.len() > 20);

        tree.flush().expect("flush");
        assert_eq!(tree.keys().expect("keys"), added);
        let stats = tree.check().expect("check");
        assert_eq!(stats.nodes, tree.store().live_blocks());
    }

    #[test]
    fn test_open_existing_requires_header() {
        let mut store = MemoryStore::new();
        {
            let result = BTree::open_existing(&mut store, config(4));
            assert!(matches!(result, Err(BTreeError::MissingHeader)));
        }
        assert_eq!(store.live_blocks(), 0);
        assert_eq!(store.stats().writes, 0);

        {
            let mut tree = BTree::open(&mut store, config(4)).expect("create");
            tree.add(key(3)).expect("add");
        }
        let mut tree = BTree::open_existing(&mut store, config(64)).expect("open existing");
        assert_eq!(tree.entries_per_node(), 4);
        assert!(tree.contains(&key(3)).expect("contains"));
    }

    #[test]
    fn test_open_existing_leaves_empty_file_untouched() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("index.db");
        drop(FileStore::create(&path, 512).expect("create store"));
        let len = std::fs::metadata(&path).expect("metadata").len();

        let store = FileStore::open(&path).expect("open store");
        assert!(matches!(
            BTree::open_existing(store, config(4)),
            Err(BTreeError::MissingHeader)
        ));

        let store = FileStore::open(&path).expect("reopen store");
        assert_eq!(store.live_blocks(), 0);
        assert_eq!(std::fs::metadata(&path).expect("metadata").len(), len);
    }

    #[test]
    fn test_header_capacity_wins_on_reopen() {
        let mut tree = memory_tree(4);
        for n in 0..40 {
            tree.add(key(n)).expect("add");
        }
        let store = tree.into_store();

        let mut tree = BTree::open(store, config(64)).expect("reopen");
        assert_eq!(tree.entries_per_node(), 4);
        assert_eq!(tree.len().expect("len"), 40);
        tree.check().expect("check");
    }

    #[test]
    fn test_borrowed_store() {
        let mut store = MemoryStore::new();
        {
            let mut tree = BTree::open(&mut store, config(4)).expect("open tree");
            tree.add(key(7)).expect("add");
        }
        let mut tree = BTree::open(&mut store, config(4)).expect("reopen");
        assert!(tree.contains(&key(7)).expect("contains"));
    }

    #[test]
    fn test_corrupt_header_magic() {
        let mut store = MemoryStore::new();
        let header = store.header_offset();
        let mut buf = [0u8; HEADER_SIZE];
        buf[..4].copy_from_slice(&0xDEAD_BEEFu32.to_ne_bytes());
        store.write(header, &buf).expect("write");

        let result = BTree::open(store, config(4));
        assert!(matches!(
            result,
            Err(BTreeError::Corrupt {
                offset,
                kind: CorruptKind::BadMagic { expected: HEADER_MAGIC, .. }
            }) if offset == header
        ));
    }

    #[test]
    fn test_corrupt_node_detected() {
        let mut tree = memory_tree(4);
        for n in 0..10 {
            tree.add(key(n)).expect("add");
        }
        let root = tree.header().root;
        let leaf = tree.root().expect("root").left_child();

        // Flip a byte inside the first entry of the leaf.
        let mut buf = vec![0u8; node_size(4)];
        tree.store_mut().read(leaf, &mut buf).expect("read");
        buf[30] ^= 0xFF;
        tree.store_mut().write(leaf, &buf).expect("write");
        tree.flush().expect("flush");

        let err = tree.search(&key(0)).expect_err("corrupt leaf");
        assert!(matches!(
            err,
            BTreeError::Corrupt {
                offset,
                kind: CorruptKind::ChecksumMismatch { .. }
            } if offset == leaf
        ));
        assert_ne!(root, leaf);
    }

    #[test]
    fn test_byte_swapped_tree_reopens() {
        let swapped = ByteOrder::NATIVE.swapped();
        let config = IndexConfig {
            byte_order: swapped,
            ..config(4)
        };
        let mut tree = BTree::open(MemoryStore::new(), config).expect("open tree");
        for n in 0..30 {
            tree.add(key(n)).expect("add");
        }
        let store = tree.into_store();

        let mut tree = BTree::open(store, IndexConfig::default()).expect("reopen");
        assert_eq!(tree.byte_order(), swapped);
        assert_eq!(tree.keys().expect("keys"), (0..30).map(key).collect::<Vec<_>>());

        tree.delete(&key(3)).expect("delete");
        tree.add(key(100)).expect("add");
        tree.check().expect("check");
    }

    #[test]
    fn test_persists_across_reopen_in_file() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("index.db");
        let block_size = node_size(8);

        {
            let store = FileStore::create(&path, block_size).expect("create store");
            let mut tree = BTree::open(store, config(8)).expect("open tree");
            for n in 0..500 {
                tree.add(Key::new(n % 50, n)).expect("add");
            }
            for n in (0..500).step_by(3) {
                tree.delete(&Key::new(n % 50, n)).expect("delete");
            }
            tree.sync().expect("sync");
        }

        let store = FileStore::open(&path).expect("open store");
        let mut tree = BTree::open(store, IndexConfig::default()).expect("reopen");
        let stats = tree.check().expect("check");
        assert_eq!(stats.keys, 500 - 167);
        assert!(tree.contains(&Key::new(1, 1)).expect("contains"));
        assert!(!tree.contains(&Key::new(0, 0)).expect("contains"));

        let freed = tree.store().free_count();
        assert_eq!(tree.store().live_blocks() as usize, stats.nodes);
        tree.add(Key::new(99, 0)).expect("add");
        assert!(tree.store().free_count() <= freed);
    }

    #[test]
    fn test_persists_across_reopen_in_directory() {
        let dir = tempdir().expect("create temp dir");
        let root = dir.path().join("nodes");
        let block_size = node_size(4);

        {
            let store = DirStore::create(&root, block_size).expect("create store");
            let mut tree = BTree::open(store, config(4)).expect("open tree");
            for n in 0..100 {
                tree.add(key(n)).expect("add");
            }
            tree.sync().expect("sync");
        }

        let store = DirStore::open(&root, block_size).expect("open store");
        let mut tree = BTree::open(store, config(4)).expect("reopen");
        assert_eq!(tree.len().expect("len"), 100);
        assert_eq!(tree.search(&Key::new(41, 1)).expect("search"), Some(key(42)));
    }

    #[test]
    fn test_error_display() {
        let err = BTreeError::Corrupt {
            offset: 7,
            kind: CorruptKind::UnsupportedVersion(9),
        };
        assert!(err.to_string().starts_with("corrupt index at offset 7"));
        assert!(!err.is_exhausted());
        assert_eq!(BTreeError::MissingHeader.to_string(), "store holds no index header");
    }
}
