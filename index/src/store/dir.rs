//! One-file-per-node store.
//!
//! Each block is a file named by its 16-hex-digit id inside the store
//! directory. Id 1 is the header anchor and reads as zeros until the tree
//! writes it. Node ids start at 2 and the next id is recovered on open by
//! scanning the directory.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::key::Offset;
use crate::store::{NodeStore, StoreError};

const HEADER_ID: Offset = 1;
const FIRST_NODE_ID: Offset = 2;
const EXTENSION: &str = "node";

/// A node store keeping every block in its own file.
#[derive(Debug)]
pub struct DirStore {
    dir: PathBuf,
    block_size: usize,
    next_id: Offset,
    /// Ids freed during this session, reused newest first.
    free_ids: Vec<Offset>,
    live: HashSet<Offset>,
    /// Ids written since the last `sync`.
    dirty: HashSet<Offset>,
    max_nodes: Option<u64>,
}

impl DirStore {
    /// Create a new store directory.
    ///
    /// Fails with [`StoreError::AlreadyExists`] if `dir` exists and is not
    /// empty.
    pub fn create(dir: &Path, block_size: usize) -> Result<Self, StoreError> {
        if dir.exists() && fs::read_dir(dir)?.next().is_some() {
            return Err(StoreError::AlreadyExists(dir.to_path_buf()));
        }
        fs::create_dir_all(dir)?;
        tracing::debug!(dir = %dir.display(), block_size, "created node store directory");
        Ok(Self::empty(dir, block_size))
    }

    /// Open an existing store directory.
    pub fn open(dir: &Path, block_size: usize) -> Result<Self, StoreError> {
        if !dir.is_dir() {
            return Err(StoreError::Format(format!(
                "{} is not a directory",
                dir.display()
            )));
        }

        let mut store = Self::empty(dir, block_size);
        for item in fs::read_dir(dir)? {
            let path = item?.path();
            let Some(id) = parse_block_name(&path) else {
                continue;
            };
            if id >= FIRST_NODE_ID {
                store.live.insert(id);
                store.next_id = store.next_id.max(id + 1);
            }
        }

        tracing::debug!(
            dir = %dir.display(),
            nodes = store.live.len(),
            next_id = store.next_id,
            "opened node store directory"
        );
        Ok(store)
    }

    /// Open the store in `dir`, creating it if missing or empty.
    pub fn open_or_create(dir: &Path, block_size: usize) -> Result<Self, StoreError> {
        match Self::create(dir, block_size) {
            Err(StoreError::AlreadyExists(_)) => Self::open(dir, block_size),
            result => result,
        }
    }

    /// Cap the number of live node files.
    #[must_use]
    pub fn with_max_nodes(mut self, max_nodes: u64) -> Self {
        self.max_nodes = Some(max_nodes);
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of live node files.
    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.live.len()
    }

    fn empty(dir: &Path, block_size: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            block_size,
            next_id: FIRST_NODE_ID,
            free_ids: Vec::new(),
            live: HashSet::new(),
            dirty: HashSet::new(),
            max_nodes: None,
        }
    }

    fn block_path(&self, id: Offset) -> PathBuf {
        self.dir.join(format!("{id:016x}.{EXTENSION}"))
    }

    fn check_id(&self, id: Offset) -> Result<(), StoreError> {
        if id == HEADER_ID || self.live.contains(&id) {
            Ok(())
        } else {
            Err(StoreError::InvalidOffset(id))
        }
    }
}

/// Parse `{id:016x}.node`, ignoring anything else in the directory.
fn parse_block_name(path: &Path) -> Option<Offset> {
    if path.extension()? != EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.len() != 16 {
        return None;
    }
    Offset::from_str_radix(stem, 16).ok()
}

impl NodeStore for DirStore {
    fn header_offset(&self) -> Offset {
        HEADER_ID
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
        if let Some(limit) = self.max_nodes {
            if self.live.len() as u64 >= limit {
                return Err(StoreError::Exhausted { limit });
            }
        }

        let id = self.free_ids.pop().unwrap_or(self.next_id);
        if id == self.next_id {
            self.next_id += 1;
        }
        File::create(self.block_path(id))?;
        self.live.insert(id);
        self.dirty.insert(id);
        Ok(id)
    }

    fn free(&mut self, offset: Offset) -> Result<(), StoreError> {
        if offset == HEADER_ID || !self.live.remove(&offset) {
            return Err(StoreError::InvalidOffset(offset));
        }
        fs::remove_file(self.block_path(offset))?;
        self.dirty.remove(&offset);
        self.free_ids.push(offset);
        Ok(())
    }

    fn read(&mut self, offset: Offset, buf: &mut [u8]) -> Result<usize, StoreError> {
        self.check_id(offset)?;
        let len = buf.len().min(self.block_size);
        let buf = &mut buf[..len];

        let mut file = match File::open(self.block_path(offset)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && offset == HEADER_ID => {
                buf.fill(0);
                return Ok(len);
            }
            Err(e) => return Err(e.into()),
        };

        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf[filled..].fill(0);
        Ok(len)
    }

    fn write(&mut self, offset: Offset, buf: &[u8]) -> Result<usize, StoreError> {
        self.check_id(offset)?;
        if buf.len() > self.block_size {
            return Err(StoreError::BlockTooLarge {
                requested: buf.len(),
                block_size: self.block_size,
            });
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.block_path(offset))?;
        file.write_all(buf)?;
        self.dirty.insert(offset);
        Ok(buf.len())
    }

    fn sync(&mut self) -> Result<(), StoreError> {
        for id in self.dirty.drain() {
            File::open(self.dir.join(format!("{id:016x}.{EXTENSION}")))?.sync_all()?;
        }
        Ok(())
    }
}
