//! Heap
//!
//! Read-write heap with a write buffer.
//!
//! ## Put Path
//! ```text
//! put(key, payload)
//!   ├─ key in buffer or index → DuplicateKey
//!   ├─ free slot fits         → written in place
//!   ├─ payload > buffer       → flush buffer, append directly
//!   ├─ buffer would overflow  → flush buffer, then buffer the record
//!   └─ otherwise              → buffer the record
//! ```
//! A flush cuts trailing free records off the file and appends every
//! buffered record with one write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::HeapConfig;
use crate::error::{HeapError, Result};
use crate::order::{display_key, KeyOrder};

use super::core::{file_name, HeapCore};
use super::iterator::RotatingKeys;
use super::record::MAX_RECLEN;
use super::{BlobStore, KeyIter};

struct HeapState {
    core: HeapCore,
    /// Normalized key → payload, not yet on disk
    buffer: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Payload bytes held in `buffer`
    buffered: usize,
}

impl HeapState {
    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let records: Vec<(&[u8], &[u8])> = self
            .buffer
            .iter()
            .map(|(k, p)| (k.as_slice(), p.as_slice()))
            .collect();
        self.core.append(&records)?;
        debug!(
            path = %self.core.path().display(),
            records = self.buffer.len(),
            bytes = self.buffered,
            "write buffer flushed"
        );
        self.buffer.clear();
        self.buffered = 0;
        Ok(())
    }
}

/// Read-write heap file
pub struct Heap {
    path: PathBuf,
    name: String,
    keylength: usize,
    order: KeyOrder,
    buffer_max: usize,
    state: Mutex<Option<HeapState>>,
}

impl Heap {
    /// Open or create a heap file with the given key layout
    pub fn open(path: impl AsRef<Path>, keylength: usize, order: KeyOrder) -> Result<Self> {
        Self::with_config(path, &HeapConfig::with_key(keylength, order))
    }

    /// Open or create a heap file with a full configuration
    pub fn with_config(path: impl AsRef<Path>, config: &HeapConfig) -> Result<Self> {
        let path = path.as_ref();
        let core = HeapCore::open(path, config)?;
        Ok(Self {
            path: path.to_path_buf(),
            name: file_name(path),
            keylength: config.keylength,
            order: config.order,
            buffer_max: config.buffer_size,
            state: Mutex::new(Some(HeapState {
                core,
                buffer: BTreeMap::new(),
                buffered: 0,
            })),
        })
    }

    fn with<T>(&self, f: impl FnOnce(&mut HeapState) -> Result<T>) -> Result<T> {
        let mut guard = self.state.lock();
        match guard.as_mut() {
            Some(state) => f(state),
            None => Err(HeapError::Closed(self.name.clone())),
        }
    }

    fn with_or<T>(&self, closed: T, f: impl FnOnce(&HeapState) -> T) -> T {
        match self.state.lock().as_ref() {
            Some(state) => f(state),
            None => closed,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keylength(&self) -> usize {
        self.keylength
    }

    pub fn order(&self) -> KeyOrder {
        self.order
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store a payload under a new key
    pub fn put(&self, key: &[u8], payload: &[u8]) -> Result<()> {
        if self.keylength + payload.len() > MAX_RECLEN {
            return Err(HeapError::RecordTooLarge(self.keylength + payload.len()));
        }
        let buffer_max = self.buffer_max;
        self.with(|state| {
            let key = state.core.normalize(key)?.into_owned();
            if !state.core.order().wellformed(&key) {
                return Err(HeapError::InvalidKey(format!(
                    "{} is not a {} key",
                    display_key(&key),
                    state.core.order().name()
                )));
            }
            if state.buffer.contains_key(&key) || state.core.index().contains(&key) {
                return Err(HeapError::DuplicateKey(display_key(&key)));
            }

            if state.core.try_reuse(&key, payload)? {
                return Ok(());
            }

            // Unbuffered, or too big for the buffer: write it through
            if buffer_max == 0 || payload.len() > buffer_max {
                state.flush()?;
                return state.core.append(&[(key.as_slice(), payload)]);
            }

            if state.buffered + payload.len() > buffer_max {
                state.flush()?;
            }
            state.buffered += payload.len();
            state.buffer.insert(key, payload.to_vec());
            Ok(())
        })
    }

    /// Write all buffered records to the file
    pub fn flush(&self) -> Result<()> {
        self.with(|state| state.flush())
    }

    /// Free the record of `key`; absent keys are ignored
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        self.with(|state| {
            let key = state.core.normalize(key)?;
            if let Some(payload) = state.buffer.remove(key.as_ref()) {
                state.buffered -= payload.len();
                return Ok(());
            }
            state.core.remove(&key).map(|_| ())
        })
    }

    /// Rewrite the payload of `key` in place
    ///
    /// The rewriter must not grow the payload. Returns the bytes saved, 0 if
    /// the key is absent.
    pub fn replace<F>(&self, key: &[u8], mut rewriter: F) -> Result<usize>
    where
        F: FnMut(&[u8]) -> Result<Vec<u8>>,
    {
        self.with(|state| {
            let key = state.core.normalize(key)?;
            if let Some(payload) = state.buffer.get_mut(key.as_ref()) {
                let new = rewriter(payload)?;
                if new.len() > payload.len() {
                    return Err(HeapError::PayloadGrowth {
                        old: payload.len(),
                        new: new.len(),
                    });
                }
                let saved = payload.len() - new.len();
                *payload = new;
                state.buffered -= saved;
                return Ok(saved);
            }
            state.core.replace(&key, &mut rewriter)
        })
    }

    /// Drop every record and truncate the file
    pub fn clear(&self) -> Result<()> {
        self.with(|state| {
            state.buffer.clear();
            state.buffered = 0;
            state.core.clear()
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with(|state| {
            let key = state.core.normalize(key)?;
            if let Some(payload) = state.buffer.get(key.as_ref()) {
                return Ok(Some(payload.clone()));
            }
            state.core.get(&key)
        })
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        self.with(|state| {
            let key = state.core.normalize(key)?;
            Ok(state.buffer.contains_key(key.as_ref()) || state.core.index().contains(&key))
        })
    }

    /// Payload length under `key`, -1 if absent
    pub fn length(&self, key: &[u8]) -> Result<i64> {
        self.with(|state| {
            let key = state.core.normalize(key)?;
            if let Some(payload) = state.buffer.get(key.as_ref()) {
                return Ok(payload.len() as i64);
            }
            state.core.length(&key)
        })
    }

    /// Snapshot of the keys; flushes the buffer first
    pub fn keys(&self, up: bool, from: Option<&[u8]>) -> Result<KeyIter> {
        let keys = self.with(|state| {
            state.flush()?;
            state.core.keys(up, from)
        })?;
        Ok(Box::new(keys.into_iter()))
    }

    /// Keys starting at `from`, wrapping around once
    pub fn keys_rotating(&self, up: bool, from: &[u8]) -> Result<KeyIter> {
        let head = self.keys(up, Some(from))?;
        let all = self.keys(up, None)?;
        let start = self.order.normalize(from, self.keylength)?.into_owned();
        Ok(Box::new(RotatingKeys::new(head, all, start, self.order, up)))
    }

    pub fn first_key(&self) -> Result<Option<Vec<u8>>> {
        self.with(|state| {
            state.flush()?;
            Ok(state.core.index().smallest_key())
        })
    }

    pub fn last_key(&self) -> Result<Option<Vec<u8>>> {
        self.with(|state| {
            state.flush()?;
            Ok(state.core.index().largest_key())
        })
    }

    /// Number of records, buffered ones included (0 once closed)
    pub fn size(&self) -> usize {
        self.with_or(0, |state| state.core.size() + state.buffer.len())
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// File length plus buffered bytes (0 once closed)
    pub fn length_bytes(&self) -> u64 {
        self.with_or(0, |state| {
            let pending: usize = state
                .buffer
                .iter()
                .map(|(k, p)| 4 + k.len() + p.len())
                .sum();
            state.core.file_len() + pending as u64
        })
    }

    /// Number of free records
    pub fn gaps(&self) -> usize {
        self.with_or(0, |state| state.core.gap().len())
    }

    /// Estimated memory of index, gap list and buffer
    pub fn mem(&self) -> usize {
        self.with_or(0, |state| state.core.mem() + state.buffered)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().is_none()
    }

    /// Flush, close, and optionally dump the index; closing twice is a no-op
    pub fn close(&self, write_dump: bool) -> Result<()> {
        let state = self.state.lock().take();
        match state {
            Some(mut state) => {
                state.flush()?;
                state.core.close(write_dump).map(|_| ())
            }
            None => Ok(()),
        }
    }
}

impl BlobStore for Heap {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn keylength(&self) -> usize {
        self.keylength
    }

    fn order(&self) -> KeyOrder {
        self.order
    }

    fn clear(&self) -> Result<()> {
        Heap::clear(self)
    }

    fn size(&self) -> usize {
        Heap::size(self)
    }

    fn keys(&self, up: bool, from: Option<&[u8]>) -> Result<KeyIter> {
        Heap::keys(self, up, from)
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        Heap::has(self, key)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Heap::get(self, key)
    }

    fn length(&self, key: &[u8]) -> Result<i64> {
        Heap::length(self, key)
    }

    fn put(&self, key: &[u8], payload: &[u8]) -> Result<()> {
        Heap::put(self, key, payload)
    }

    fn replace(
        &self,
        key: &[u8],
        rewriter: &mut dyn FnMut(&[u8]) -> Result<Vec<u8>>,
    ) -> Result<usize> {
        Heap::replace(self, key, rewriter)
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        Heap::remove(self, key)
    }

    fn close(&self, write_dump: bool) -> Result<()> {
        Heap::close(self, write_dump)
    }
}
