//! Heap Reader
//!
//! Read-only access to a heap file through its in-memory index.

use std::path::{Path, PathBuf};

use crate::config::HeapConfig;
use crate::error::Result;
use crate::order::KeyOrder;

use super::core::CoreCell;
use super::iterator::RotatingKeys;
use super::KeyIter;

/// Read-only heap
///
/// `has` and `size` answer from the index alone; `get` and `length` read the
/// file at the indexed offset.
pub struct HeapReader {
    pub(crate) cell: CoreCell,
    path: PathBuf,
}

impl HeapReader {
    /// Open a heap file with the given key layout
    pub fn open(path: impl AsRef<Path>, keylength: usize, order: KeyOrder) -> Result<Self> {
        Self::with_config(path, &HeapConfig::with_key(keylength, order))
    }

    /// Open a heap file with a full configuration
    pub fn with_config(path: impl AsRef<Path>, config: &HeapConfig) -> Result<Self> {
        let path = path.as_ref();
        Ok(Self {
            cell: CoreCell::open(path, config)?,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.cell.name()
    }

    pub fn keylength(&self) -> usize {
        self.cell.keylength()
    }

    pub fn order(&self) -> KeyOrder {
        self.cell.order()
    }

    /// Payload stored under `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.cell.with(|core| core.get(key))
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        self.cell.with(|core| core.has(key))
    }

    /// Payload length under `key`, -1 if absent
    pub fn length(&self, key: &[u8]) -> Result<i64> {
        self.cell.with(|core| core.length(key))
    }

    /// Snapshot of the keys, see [`RecordIndex::keys`](super::RecordIndex::keys)
    pub fn keys(&self, up: bool, from: Option<&[u8]>) -> Result<KeyIter> {
        let keys = self.cell.with(|core| core.keys(up, from))?;
        Ok(Box::new(keys.into_iter()))
    }

    /// Keys starting at `from`, wrapping around once
    pub fn keys_rotating(&self, up: bool, from: &[u8]) -> Result<KeyIter> {
        let head = self.keys(up, Some(from))?;
        let all = self.keys(up, None)?;
        let start = self.cell.with(|core| Ok(core.normalize(from)?.into_owned()))?;
        Ok(Box::new(RotatingKeys::new(head, all, start, self.order(), up)))
    }

    pub fn first_key(&self) -> Result<Option<Vec<u8>>> {
        self.cell.with(|core| Ok(core.index().smallest_key()))
    }

    pub fn last_key(&self) -> Result<Option<Vec<u8>>> {
        self.cell.with(|core| Ok(core.index().largest_key()))
    }

    /// Number of records (0 once closed)
    pub fn size(&self) -> usize {
        self.cell.with_or(0, |core| core.size())
    }

    /// File length in bytes (0 once closed)
    pub fn length_bytes(&self) -> u64 {
        self.cell.with_or(0, |core| core.file_len())
    }

    /// Estimated memory held by index and gap list
    pub fn mem(&self) -> usize {
        self.cell.with_or(0, |core| core.mem())
    }

    pub fn is_closed(&self) -> bool {
        self.cell.is_closed()
    }

    /// Close the heap, optionally dumping its index for the next open
    pub fn close(&self, write_dump: bool) -> Result<()> {
        self.cell.close(write_dump)
    }
}
