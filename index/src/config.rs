//! Index configuration.
//!
//! Configuration is passed explicitly to [`BTree::open`](crate::BTree::open).
//! The binary builds it from environment variables.
//!
//! # Environment Variables
//!
//! - `ORDERED_INDEX_ENTRIES_PER_NODE`: node capacity for new trees (default: `64`)
//! - `ORDERED_INDEX_MAX_CACHED_NODES`: cached nodes before an automatic flush,
//!   `0` disables it (default: `4096`)
//! - `ORDERED_INDEX_PATH`: index file checked by the binary when no path
//!   argument is given
//!
//! # Invariants
//!
//! - `entries_per_node` from the environment always lies in `[2, 4096]`
//! - an existing tree's persisted capacity overrides `entries_per_node`

use std::path::PathBuf;

use crate::layout::{ByteOrder, MAX_ENTRIES_PER_NODE, MIN_ENTRIES_PER_NODE, is_valid_capacity};

pub const ENTRIES_PER_NODE_VAR: &str = "ORDERED_INDEX_ENTRIES_PER_NODE";
pub const MAX_CACHED_NODES_VAR: &str = "ORDERED_INDEX_MAX_CACHED_NODES";
pub const PATH_VAR: &str = "ORDERED_INDEX_PATH";

/// Tree configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexConfig {
    /// Entries per node for a newly created tree.
    pub entries_per_node: u32,
    /// Cached node count above which a top-level operation flushes the cache.
    pub max_cached_nodes: usize,
    /// Byte order used when creating a tree. Existing trees keep theirs.
    pub byte_order: ByteOrder,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            entries_per_node: Self::DEFAULT_ENTRIES_PER_NODE,
            max_cached_nodes: Self::DEFAULT_MAX_CACHED_NODES,
            byte_order: ByteOrder::NATIVE,
        }
    }
}

impl IndexConfig {
    pub const DEFAULT_ENTRIES_PER_NODE: u32 = 64;
    pub const DEFAULT_MAX_CACHED_NODES: usize = 4096;

    /// Default configuration with a different node capacity.
    #[must_use]
    pub fn with_entries_per_node(entries_per_node: u32) -> Self {
        Self {
            entries_per_node,
            ..Self::default()
        }
    }

    /// Load configuration from the process environment.
    ///
    /// Unset variables take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but does not parse or is out of
    /// range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value
    /// or `None` when it is unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let entries_per_node = match lookup(ENTRIES_PER_NODE_VAR) {
            Some(value) => parse_entries_per_node(&value)?,
            None => Self::DEFAULT_ENTRIES_PER_NODE,
        };

        let max_cached_nodes = match lookup(MAX_CACHED_NODES_VAR) {
            Some(value) => value.trim().parse::<usize>().map_err(|_| ConfigError::InvalidValue {
                name: MAX_CACHED_NODES_VAR.to_string(),
                message: format!("'{value}' is not a non-negative integer"),
            })?,
            None => Self::DEFAULT_MAX_CACHED_NODES,
        };

        Ok(Self {
            entries_per_node,
            max_cached_nodes,
            byte_order: ByteOrder::NATIVE,
        })
    }
}

fn parse_entries_per_node(value: &str) -> Result<u32, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        name: ENTRIES_PER_NODE_VAR.to_string(),
        message: format!(
            "'{value}' is not an integer in [{MIN_ENTRIES_PER_NODE}, {MAX_ENTRIES_PER_NODE}]"
        ),
    };
    let parsed = value.trim().parse::<u32>().map_err(|_| invalid())?;
    if is_valid_capacity(parsed) {
        Ok(parsed)
    } else {
        Err(invalid())
    }
}

/// Resolve the index file path: the explicit argument if given, otherwise
/// `ORDERED_INDEX_PATH` through `lookup`.
///
/// # Errors
///
/// Returns [`ConfigError::MissingEnvVar`] when neither is present, or
/// [`ConfigError::InvalidValue`] when the variable is empty.
pub fn resolve_path(
    arg: Option<String>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<PathBuf, ConfigError> {
    if let Some(arg) = arg {
        return Ok(PathBuf::from(arg));
    }
    let value = lookup(PATH_VAR).ok_or_else(|| ConfigError::MissingEnvVar(PATH_VAR.to_string()))?;
    if value.is_empty() {
        return Err(ConfigError::InvalidValue {
            name: PATH_VAR.to_string(),
            message: "must not be empty".to_string(),
        });
    }
    Ok(PathBuf::from(value))
}
