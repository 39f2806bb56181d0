//! Record Index
//!
//! Maps keys to the offset of their record in the heap file.
//!
//! Keys are stored as [`KeyOrder::sort_key`] transforms, so the natural
//! order of the underlying `BTreeMap` is the configured key order.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HeapError, Result};
use crate::order::{display_key, KeyOrder};

use super::dump::{read_dump, write_dump};

/// Estimated per-entry overhead of the map beyond key and offset
const ENTRY_OVERHEAD: usize = 48;

/// Serialized form of an index dump
#[derive(Serialize, Deserialize)]
struct IndexDump {
    keylength: usize,
    order: KeyOrder,
    /// Original keys and offsets, in key order
    entries: Vec<(Vec<u8>, u64)>,
}

/// In-memory key → offset index
#[derive(Debug, Clone)]
pub struct RecordIndex {
    keylength: usize,
    order: KeyOrder,
    map: BTreeMap<Vec<u8>, u64>,
}

impl RecordIndex {
    pub fn new(keylength: usize, order: KeyOrder) -> Self {
        Self {
            keylength,
            order,
            map: BTreeMap::new(),
        }
    }

    pub fn keylength(&self) -> usize {
        self.keylength
    }

    pub fn order(&self) -> KeyOrder {
        self.order
    }

    /// Add a key; an existing entry for the key is an error
    pub fn put(&mut self, key: &[u8], offset: u64) -> Result<()> {
        if key.len() != self.keylength {
            return Err(HeapError::Precondition(format!(
                "key of {} bytes in an index of keylength {}",
                key.len(),
                self.keylength
            )));
        }
        if !self.order.wellformed(key) {
            return Err(HeapError::InvalidKey(format!(
                "{} is not a {} key",
                display_key(key),
                self.order.name()
            )));
        }
        let sort_key = self.order.sort_key(key).into_owned();
        if self.map.contains_key(&sort_key) {
            return Err(HeapError::DuplicateKey(display_key(key)));
        }
        self.map.insert(sort_key, offset);
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<u64> {
        if !self.order.wellformed(key) {
            return None;
        }
        self.map.get(self.order.sort_key(key).as_ref()).copied()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Remove a key, returning its offset
    pub fn remove(&mut self, key: &[u8]) -> Option<u64> {
        if !self.order.wellformed(key) {
            return None;
        }
        self.map.remove(self.order.sort_key(key).as_ref())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Keys in ascending (`up`) or descending order
    ///
    /// With `from`, ascending iteration starts at the first key `>= from` and
    /// descending iteration at the last key `<= from`. The keys are copied
    /// out, so the result does not borrow the index.
    pub fn keys(&self, up: bool, from: Option<&[u8]>) -> Vec<Vec<u8>> {
        let from = from.map(|k| self.order.sort_key(k).into_owned());
        let range: Box<dyn DoubleEndedIterator<Item = &Vec<u8>> + '_> = match (&from, up) {
            (None, _) => Box::new(self.map.keys()),
            (Some(f), true) => Box::new(
                self.map
                    .range::<Vec<u8>, _>((Bound::Included(f), Bound::Unbounded))
                    .map(|(k, _)| k),
            ),
            (Some(f), false) => Box::new(
                self.map
                    .range::<Vec<u8>, _>((Bound::Unbounded, Bound::Included(f)))
                    .map(|(k, _)| k),
            ),
        };
        if up {
            range.map(|k| self.order.restore(k)).collect()
        } else {
            range.rev().map(|k| self.order.restore(k)).collect()
        }
    }

    /// All `(key, offset)` pairs in key order
    pub fn entries(&self) -> Vec<(Vec<u8>, u64)> {
        self.map
            .iter()
            .map(|(k, &o)| (self.order.restore(k), o))
            .collect()
    }

    pub fn smallest_key(&self) -> Option<Vec<u8>> {
        self.map.keys().next().map(|k| self.order.restore(k))
    }

    pub fn largest_key(&self) -> Option<Vec<u8>> {
        self.map.keys().next_back().map(|k| self.order.restore(k))
    }

    /// First, middle and last entry, for dump verification
    pub(crate) fn sample(&self) -> Vec<(Vec<u8>, u64)> {
        let mut picks = Vec::with_capacity(3);
        let mut push = |entry: Option<(&Vec<u8>, &u64)>| {
            if let Some((k, &o)) = entry {
                if !picks.iter().any(|(_, p)| *p == o) {
                    picks.push((self.order.restore(k), o));
                }
            }
        };
        push(self.map.iter().next());
        push(self.map.iter().nth(self.map.len() / 2));
        push(self.map.iter().next_back());
        picks
    }

    /// Estimated memory held by the index, in bytes
    pub fn mem(&self) -> usize {
        self.map.len() * (self.keylength + std::mem::size_of::<u64>() + ENTRY_OVERHEAD)
    }

    // =========================================================================
    // Dumps
    // =========================================================================

    /// Write the index to `path`
    pub fn dump(&self, path: &Path) -> Result<()> {
        let dump = IndexDump {
            keylength: self.keylength,
            order: self.order,
            entries: self.entries(),
        };
        write_dump(path, &dump)
    }

    /// Read an index written by [`RecordIndex::dump`]
    ///
    /// The dump must have been written with the same key layout.
    pub fn load(path: &Path, keylength: usize, order: KeyOrder) -> Result<Self> {
        let dump: IndexDump = read_dump(path)?;
        if dump.keylength != keylength || dump.order != order {
            return Err(HeapError::Dump(format!(
                "{} was written with keylength {} / {}, expected {} / {}",
                path.display(),
                dump.keylength,
                dump.order.name(),
                keylength,
                order.name()
            )));
        }
        let mut index = RecordIndex::new(keylength, order);
        for (key, offset) in dump.entries {
            index
                .put(&key, offset)
                .map_err(|e| HeapError::Dump(format!("{}: {}", path.display(), e)))?;
        }
        Ok(index)
    }
}
