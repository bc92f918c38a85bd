// Layout of an index:
// 1. A node store hands out fixed-size blocks by offset
// 2. One block holds the header: node capacity and root offset
// 3. Every other block holds one node of the B-tree
//
// Operations descend from the root, pull nodes into the cache on demand
// and write each changed node back before returning.
//
// Components:
//  - Node store (memory, packed file, directory of node files)
//  - B-tree controller over a node cache
//  - Free-space pool keyed by (size, location)

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod free_space;
pub mod header;
pub mod key;
pub mod layout;
pub mod node;
pub mod store;
pub mod tree;

pub use config::{ConfigError, IndexConfig};
pub use free_space::{Extent, FreeSpaceIndex};
pub use header::Header;
pub use key::{Entry, Key, NULL_OFFSET, Offset};
pub use layout::{ByteOrder, CorruptKind};
pub use node::Node;
pub use tree::{BTree, BTreeError, TreeStats};
