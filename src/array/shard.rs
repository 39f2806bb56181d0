//! Shards
//!
//! One heap file of an array. Only the newest shard takes writes; every
//! other shard is opened read-only, which skips the write buffer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::HeapConfig;
use crate::error::{HeapError, Result};
use crate::heap::{Heap, HeapModifier, KeyIter};

/// An open shard heap
pub enum Shard {
    ReadOnly(HeapModifier),
    Writable(Heap),
}

impl Shard {
    /// Open `path` as a writable or a read-only shard
    pub fn open(path: &Path, config: &HeapConfig, writable: bool) -> Result<Self> {
        if writable {
            Ok(Shard::Writable(Heap::with_config(path, config)?))
        } else {
            Ok(Shard::ReadOnly(HeapModifier::with_config(path, config)?))
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Shard::Writable(_))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self {
            Shard::ReadOnly(h) => h.get(key),
            Shard::Writable(h) => h.get(key),
        }
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        match self {
            Shard::ReadOnly(h) => h.has(key),
            Shard::Writable(h) => h.has(key),
        }
    }

    pub fn length(&self, key: &[u8]) -> Result<i64> {
        match self {
            Shard::ReadOnly(h) => h.length(key),
            Shard::Writable(h) => h.length(key),
        }
    }

    pub fn keys(&self, up: bool, from: Option<&[u8]>) -> Result<KeyIter> {
        match self {
            Shard::ReadOnly(h) => h.keys(up, from),
            Shard::Writable(h) => h.keys(up, from),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Shard::ReadOnly(h) => h.size(),
            Shard::Writable(h) => h.size(),
        }
    }

    /// Bytes on disk (plus buffered bytes for the writable shard)
    pub fn length_bytes(&self) -> u64 {
        match self {
            Shard::ReadOnly(h) => h.reader().length_bytes(),
            Shard::Writable(h) => h.length_bytes(),
        }
    }

    pub fn mem(&self) -> usize {
        match self {
            Shard::ReadOnly(h) => h.reader().mem(),
            Shard::Writable(h) => h.mem(),
        }
    }

    pub fn put(&self, key: &[u8], payload: &[u8]) -> Result<()> {
        match self {
            Shard::ReadOnly(h) => Err(HeapError::Unsupported(format!(
                "put into read-only shard {}",
                h.name()
            ))),
            Shard::Writable(h) => h.put(key, payload),
        }
    }

    pub fn remove(&self, key: &[u8]) -> Result<()> {
        match self {
            Shard::ReadOnly(h) => h.remove(key),
            Shard::Writable(h) => h.remove(key),
        }
    }

    pub fn replace(
        &self,
        key: &[u8],
        rewriter: &mut dyn FnMut(&[u8]) -> Result<Vec<u8>>,
    ) -> Result<usize> {
        match self {
            Shard::ReadOnly(h) => h.replace(key, rewriter),
            Shard::Writable(h) => h.replace(key, rewriter),
        }
    }

    pub fn clear(&self) -> Result<()> {
        match self {
            Shard::ReadOnly(h) => h.clear(),
            Shard::Writable(h) => h.clear(),
        }
    }

    pub fn close(&self, write_dump: bool) -> Result<()> {
        match self {
            Shard::ReadOnly(h) => h.close(write_dump),
            Shard::Writable(h) => h.close(write_dump),
        }
    }
}

/// A shard together with where and when it was created
pub struct ShardItem {
    pub created: DateTime<Utc>,
    pub path: PathBuf,
    pub shard: Shard,
}

impl ShardItem {
    /// Time since creation, zero for timestamps in the future
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
