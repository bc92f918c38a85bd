//! Keys, entries and node offsets.
//!
//! A key is an ordered `(primary, secondary)` pair of `u64`s. Ordering is
//! primary-major, secondary-minor, which lets a free-space pool encode
//! `(size, location)` and ask for "the smallest extent of at least N bytes".

use std::fmt;

/// Opaque location of a node inside a [`NodeStore`](crate::store::NodeStore).
pub type Offset = u64;

/// Sentinel offset meaning "no such node".
pub const NULL_OFFSET: Offset = 0;

/// An ordered pair of 64-bit integers.
///
/// The derived ordering compares `primary` first and `secondary` second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Key {
    pub primary: u64,
    pub secondary: u64,
}

impl Key {
    /// Smallest possible key.
    pub const MIN: Self = Self::new(0, 0);

    /// Largest possible key.
    pub const MAX: Self = Self::new(u64::MAX, u64::MAX);

    #[must_use]
    pub const fn new(primary: u64, secondary: u64) -> Self {
        Self { primary, secondary }
    }
}

impl From<(u64, u64)> for Key {
    fn from((primary, secondary): (u64, u64)) -> Self {
        Self::new(primary, secondary)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.primary, self.secondary)
    }
}

/// A key plus the offset of the subtree holding keys `>= key` and below the
/// next entry's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Entry {
    pub key: Key,
    pub right_child: Offset,
}

impl Entry {
    #[must_use]
    pub const fn new(key: Key, right_child: Offset) -> Self {
        Self { key, right_child }
    }

    /// An entry with no right subtree, as stored in leaves.
    #[must_use]
    pub const fn leaf(key: Key) -> Self {
        Self::new(key, NULL_OFFSET)
    }
}
