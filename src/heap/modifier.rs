//! Heap Modifier
//!
//! A reader that may also free and shrink records. Used for shards that no
//! longer take new writes.

use std::path::Path;

use crate::config::HeapConfig;
use crate::error::Result;
use crate::order::KeyOrder;

use super::reader::HeapReader;
use super::KeyIter;

pub struct HeapModifier {
    reader: HeapReader,
}

impl HeapModifier {
    pub fn open(path: impl AsRef<Path>, keylength: usize, order: KeyOrder) -> Result<Self> {
        Ok(Self {
            reader: HeapReader::open(path, keylength, order)?,
        })
    }

    pub fn with_config(path: impl AsRef<Path>, config: &HeapConfig) -> Result<Self> {
        Ok(Self {
            reader: HeapReader::with_config(path, config)?,
        })
    }

    /// Read-only view of the same heap
    pub fn reader(&self) -> &HeapReader {
        &self.reader
    }

    pub fn path(&self) -> &Path {
        self.reader.path()
    }

    pub fn name(&self) -> &str {
        self.reader.name()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.reader.get(key)
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        self.reader.has(key)
    }

    pub fn length(&self, key: &[u8]) -> Result<i64> {
        self.reader.length(key)
    }

    pub fn keys(&self, up: bool, from: Option<&[u8]>) -> Result<KeyIter> {
        self.reader.keys(up, from)
    }

    pub fn size(&self) -> usize {
        self.reader.size()
    }

    /// Free the record of `key`; absent keys are ignored
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        self.reader.cell.with(|core| core.remove(key)).map(|_| ())
    }

    /// Rewrite the payload of `key` in place
    ///
    /// The rewriter must not grow the payload. Returns the bytes saved, 0 if
    /// the key is absent.
    pub fn replace<F>(&self, key: &[u8], mut rewriter: F) -> Result<usize>
    where
        F: FnMut(&[u8]) -> Result<Vec<u8>>,
    {
        self.reader.cell.with(|core| core.replace(key, &mut rewriter))
    }

    /// Drop every record and truncate the file
    pub fn clear(&self) -> Result<()> {
        self.reader.cell.with(|core| core.clear())
    }

    pub fn close(&self, write_dump: bool) -> Result<()> {
        self.reader.close(write_dump)
    }
}
