//! Gap Allocator
//!
//! Free byte ranges inside a heap file.
//!
//! Each gap is a free record: `offset` is where its length prefix starts and
//! `size` is its `reclen`, so a gap covers `4 + size` bytes on disk. Gaps are
//! kept twice: by offset (for adjacency and trailing checks) and by size (for
//! best-fit lookups).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::Result;

use super::dump::{read_dump, write_dump};
use super::LENGTH_PREFIX;

/// Set of free `{offset, size}` ranges
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Gap {
    by_offset: BTreeMap<u64, u32>,
    by_size: BTreeSet<(u32, u64)>,
}

impl Gap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a free range, replacing any gap already at `offset`
    pub fn put(&mut self, offset: u64, size: u32) {
        if let Some(old) = self.by_offset.insert(offset, size) {
            self.by_size.remove(&(old, offset));
        }
        self.by_size.insert((size, offset));
    }

    /// Forget the gap at `offset`, returning its size
    pub fn remove(&mut self, offset: u64) -> Option<u32> {
        let size = self.by_offset.remove(&offset)?;
        self.by_size.remove(&(size, offset));
        Some(size)
    }

    /// Smallest gap with at least `size` bytes (lowest offset among equals)
    pub fn find_at_least(&self, size: u32) -> Option<(u64, u32)> {
        self.by_size
            .range((size, 0)..)
            .next()
            .map(|&(size, offset)| (offset, size))
    }

    pub fn clear(&mut self) {
        self.by_offset.clear();
        self.by_size.clear();
    }

    pub fn len(&self) -> usize {
        self.by_offset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_offset.is_empty()
    }

    /// Gaps in offset order
    pub fn iter(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.by_offset.iter().map(|(&o, &s)| (o, s))
    }

    /// Total on-disk bytes covered by gaps, length prefixes included
    pub fn total_bytes(&self) -> u64 {
        self.by_offset
            .values()
            .map(|&s| LENGTH_PREFIX + s as u64)
            .sum()
    }

    /// Merge gaps that directly follow each other
    ///
    /// Returns the surviving gaps whose size changed; their new length
    /// prefix has to be written back to the file by the caller.
    pub fn coalesce(&mut self) -> Vec<(u64, u32)> {
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.by_offset.len());
        let mut changed: BTreeSet<u64> = BTreeSet::new();

        for (&offset, &size) in &self.by_offset {
            if let Some(last) = merged.last_mut() {
                let end = last.0 + LENGTH_PREFIX + last.1;
                let grown = last.1 + LENGTH_PREFIX + size as u64;
                if end == offset && grown <= i32::MAX as u64 {
                    last.1 = grown;
                    changed.insert(last.0);
                    continue;
                }
            }
            merged.push((offset, size as u64));
        }

        if changed.is_empty() {
            return Vec::new();
        }
        self.clear();
        for &(offset, size) in &merged {
            self.put(offset, size as u32);
        }
        merged
            .into_iter()
            .filter(|(offset, _)| changed.contains(offset))
            .map(|(offset, size)| (offset, size as u32))
            .collect()
    }

    /// Remove the gaps that reach the end of a file of `file_len` bytes
    ///
    /// Returns the new file length once those gaps are cut off.
    pub fn take_trailing(&mut self, file_len: u64) -> u64 {
        let mut end = file_len;
        while let Some((&offset, &size)) = self.by_offset.iter().next_back() {
            if offset + LENGTH_PREFIX + size as u64 != end {
                break;
            }
            self.remove(offset);
            end = offset;
        }
        end
    }

    /// Write the gap list to `path`
    pub fn dump(&self, path: &Path) -> Result<()> {
        let pairs: Vec<(u64, u32)> = self.iter().collect();
        write_dump(path, &pairs)
    }

    /// Read a gap list written by [`Gap::dump`]
    pub fn load(path: &Path) -> Result<Self> {
        let pairs: Vec<(u64, u32)> = read_dump(path)?;
        let mut gap = Gap::new();
        for (offset, size) in pairs {
            gap.put(offset, size);
        }
        Ok(gap)
    }
}
