//! Heap Core
//!
//! Shared state behind every heap flavour: the record file, its index and
//! its gap list. The public types in this module tree wrap a `HeapCore` in a
//! lock and expose the subset of operations they allow.
//!
//! ## Open
//! ```text
//! open(path)
//!   ├─ fingerprint matches an .idx/.gap pair?
//!   │    ├─ yes → load both, verify 3 sampled keys against the file
//!   │    └─ no / any failure → full scan
//!   ├─ delete every dump of the file
//!   └─ coalesce adjacent gaps
//! ```

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::HeapConfig;
use crate::error::{HeapError, Result};
use crate::memory::MemoryBudget;
use crate::order::{display_key, KeyOrder};
use crate::registry::HeapRegistry;

use super::dump::{delete_dumps, fingerprint, gap_dump_path, index_dump_path};
use super::gap::Gap;
use super::index::RecordIndex;
use super::record::{encode_reclen, RecordFile, ScanItem};
use super::{DUMP_THRESHOLD, EMPTY_MARKER, LENGTH_PREFIX};

/// Extra bytes reserved from the budget on top of each payload read
const READ_SLACK: usize = 64;

/// Smallest remainder worth splitting off a reused gap: a length prefix and
/// at least one byte for the free marker
const MIN_SPLIT: usize = LENGTH_PREFIX as usize + 1;

pub(crate) struct HeapCore {
    file: RecordFile,
    index: RecordIndex,
    gap: Gap,
    keylength: usize,
    order: KeyOrder,
    budget: Arc<MemoryBudget>,
    registry: Option<Arc<HeapRegistry>>,
    /// Dumps of this file may still exist and must go on the next mutation
    dumps_on_disk: bool,
}

impl HeapCore {
    // =========================================================================
    // Open
    // =========================================================================

    pub(crate) fn open(path: &Path, config: &HeapConfig) -> Result<Self> {
        config.validate()?;
        let file = RecordFile::open(path)?;

        let mut core = Self {
            index: RecordIndex::new(config.keylength, config.order),
            gap: Gap::new(),
            keylength: config.keylength,
            order: config.order,
            budget: Arc::clone(&config.budget),
            registry: config.registry.clone(),
            dumps_on_disk: false,
            file,
        };

        let mut loaded = false;
        if core.file.len() > 0 {
            loaded = core.load_dumps()?;
            if !loaded {
                core.rebuild_index()?;
            }
        }
        if let Err(e) = delete_dumps(path, &[]) {
            warn!(path = %path.display(), error = %e, "could not delete heap dumps");
            core.dumps_on_disk = true;
        }

        for (offset, size) in core.gap.coalesce() {
            core.file.write_reclen(offset, size as usize)?;
        }

        if let Some(registry) = &core.registry {
            registry.register(path, core.index.len());
        }
        info!(
            path = %path.display(),
            entries = core.index.len(),
            gaps = core.gap.len(),
            from_dump = loaded,
            "heap opened"
        );
        Ok(core)
    }

    /// Try the fingerprinted dumps; false means a scan is needed
    fn load_dumps(&mut self) -> Result<bool> {
        let path = self.file.path().to_path_buf();
        let fp = fingerprint(&path)?;
        let idx = index_dump_path(&path, &fp);
        let gap = gap_dump_path(&path, &fp);
        if !idx.exists() || !gap.exists() {
            return Ok(false);
        }

        let loaded = RecordIndex::load(&idx, self.keylength, self.order)
            .and_then(|index| Gap::load(&gap).map(|gap| (index, gap)));
        let (index, gap) = match loaded {
            Ok(pair) => pair,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "heap dump unreadable, rescanning");
                return Ok(false);
            }
        };
        if index.is_empty() {
            return Ok(false);
        }
        self.index = index;
        self.gap = gap;

        if !self.verify_sample()? {
            warn!(path = %path.display(), "heap dump does not match file, rescanning");
            self.index.clear();
            self.gap.clear();
            return Ok(false);
        }
        debug!(path = %path.display(), fingerprint = %fp, "heap index loaded from dump");
        Ok(true)
    }

    /// Reread sampled keys at their indexed offsets
    fn verify_sample(&mut self) -> Result<bool> {
        for (key, pos) in self.index.sample() {
            if pos + LENGTH_PREFIX + self.keylength as u64 > self.file.len() {
                return Ok(false);
            }
            let reclen = self.file.read_reclen(pos)?;
            if reclen < self.keylength as i32 {
                return Ok(false);
            }
            let stored = self.file.read_key(pos, self.keylength)?;
            if !self.order.equal(&stored, &key) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Rebuild index and gap list from a full scan of the file
    ///
    /// Malformed, short and duplicate records are turned into free records.
    /// A bad length or a truncated tail ends the scan and cuts the file there.
    pub(crate) fn rebuild_index(&mut self) -> Result<()> {
        self.index.clear();
        self.gap.clear();

        let mut to_free: Vec<u64> = Vec::new();
        let mut cut_at: Option<u64> = None;

        for item in self.file.scan(self.keylength)? {
            match item? {
                ScanItem::Record { pos, reclen, key } => {
                    if key.first() == Some(&EMPTY_MARKER) {
                        self.gap.put(pos, reclen as u32);
                        continue;
                    }
                    let reason = if key.len() < self.keylength {
                        Some("record shorter than key")
                    } else if !self.order.wellformed(&key) {
                        Some("malformed key")
                    } else if self.index.contains(&key) {
                        Some("duplicate key")
                    } else {
                        None
                    };
                    match reason {
                        Some(reason) => {
                            warn!(
                                path = %self.file.path().display(),
                                pos,
                                key = %display_key(&key),
                                reason,
                                "freeing bad record"
                            );
                            to_free.push(pos);
                            self.gap.put(pos, reclen as u32);
                        }
                        None => self.index.put(&key, pos)?,
                    }
                }
                ScanItem::BadLength { pos, reclen } => {
                    error!(
                        path = %self.file.path().display(),
                        pos,
                        reclen,
                        "invalid record length, truncating heap"
                    );
                    cut_at = Some(pos);
                    break;
                }
                ScanItem::Truncated { pos } => {
                    error!(
                        path = %self.file.path().display(),
                        pos,
                        "incomplete trailing record, truncating heap"
                    );
                    cut_at = Some(pos);
                    break;
                }
            }
        }

        for pos in to_free {
            self.file.tombstone(pos)?;
        }
        if let Some(pos) = cut_at {
            self.file.truncate(pos)?;
        }
        debug!(
            path = %self.file.path().display(),
            entries = self.index.len(),
            gaps = self.gap.len(),
            "heap index rebuilt"
        );
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub(crate) fn path(&self) -> &Path {
        self.file.path()
    }

    pub(crate) fn keylength(&self) -> usize {
        self.keylength
    }

    pub(crate) fn order(&self) -> KeyOrder {
        self.order
    }

    pub(crate) fn index(&self) -> &RecordIndex {
        &self.index
    }

    pub(crate) fn gap(&self) -> &Gap {
        &self.gap
    }

    /// Current file length in bytes
    pub(crate) fn file_len(&self) -> u64 {
        self.file.len()
    }

    pub(crate) fn size(&self) -> usize {
        self.index.len()
    }

    /// Estimated memory of index and gap list
    pub(crate) fn mem(&self) -> usize {
        self.index.mem() + self.gap.len() * 2 * (8 + 4 + 32)
    }

    /// Bring `key` to `keylength` bytes
    pub(crate) fn normalize<'a>(&self, key: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        self.order.normalize(key, self.keylength)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub(crate) fn has(&self, key: &[u8]) -> Result<bool> {
        let key = self.normalize(key)?;
        Ok(self.index.contains(&key))
    }

    pub(crate) fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = self.normalize(key)?;
        let pos = match self.index.get(&key) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let len = self.checked_payload_len(&key, pos)?;
        let _reservation = self.budget.reserve(len + self.keylength + READ_SLACK)?;
        Ok(Some(self.file.read_payload(pos, self.keylength, len)?))
    }

    pub(crate) fn length(&mut self, key: &[u8]) -> Result<i64> {
        let key = self.normalize(key)?;
        match self.index.get(&key) {
            Some(pos) => Ok(self.checked_payload_len(&key, pos)? as i64),
            None => Ok(-1),
        }
    }

    /// Payload length of the record at `pos`, after checking that the record
    /// is sane and carries `key`
    fn checked_payload_len(&mut self, key: &[u8], pos: u64) -> Result<usize> {
        if pos + LENGTH_PREFIX + self.keylength as u64 > self.file.len() {
            return self.corrupted(key, pos, "record starts past end of file");
        }
        let reclen = self.file.read_reclen(pos)? as i64;
        let len = reclen - self.keylength as i64;
        if len < 0 {
            return self.corrupted(key, pos, "negative payload length");
        }
        if pos + LENGTH_PREFIX + reclen as u64 > self.file.len() {
            return self.corrupted(key, pos, "record runs past end of file");
        }
        let stored = self.file.read_key(pos, self.keylength)?;
        if !self.order.equal(&stored, key) {
            return self.corrupted(key, pos, "key mismatch");
        }
        Ok(len as usize)
    }

    /// Rebuild the index and report the inconsistency to the caller
    fn corrupted<T>(&mut self, key: &[u8], pos: u64, reason: &str) -> Result<T> {
        warn!(
            path = %self.file.path().display(),
            key = %display_key(key),
            pos,
            reason,
            "index inconsistent with heap file, rebuilding"
        );
        self.rebuild_index()?;
        Err(HeapError::Corruption(format!(
            "{} at offset {} in {}",
            reason,
            pos,
            self.file.path().display()
        )))
    }

    pub(crate) fn keys(&self, up: bool, from: Option<&[u8]>) -> Result<Vec<Vec<u8>>> {
        let from = from.map(|k| self.normalize(k)).transpose()?;
        Ok(self.index.keys(up, from.as_deref()))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write into a free slot if one fits exactly or leaves room for a
    /// smaller free record behind it
    pub(crate) fn try_reuse(&mut self, key: &[u8], payload: &[u8]) -> Result<bool> {
        let reclen = self.keylength + payload.len();
        encode_reclen(reclen)?;
        if reclen > u32::MAX as usize {
            return Ok(false);
        }

        let exact = self
            .gap
            .find_at_least(reclen as u32)
            .filter(|&(_, size)| size as usize == reclen);
        let slot = match exact {
            Some(slot) => Some(slot),
            None => match reclen.checked_add(MIN_SPLIT) {
                Some(min) if min <= u32::MAX as usize => self.gap.find_at_least(min as u32),
                _ => None,
            },
        };
        let (offset, size) = match slot {
            Some(slot) => slot,
            None => return Ok(false),
        };

        self.gap.remove(offset);
        self.file.write_record(offset, reclen, key, payload)?;
        let rest = size as usize - reclen;
        if rest > 0 {
            let free_pos = offset + LENGTH_PREFIX + reclen as u64;
            let free_len = rest - LENGTH_PREFIX as usize;
            self.file.write_free(free_pos, free_len)?;
            self.gap.put(free_pos, free_len as u32);
        }
        self.index.put(key, offset)?;
        self.mutated();
        debug!(
            path = %self.file.path().display(),
            key = %display_key(key),
            offset,
            split = rest > 0,
            "record written into gap"
        );
        Ok(true)
    }

    /// Append records with one sequential write
    ///
    /// Keys must be normalized and absent from the index.
    pub(crate) fn append(&mut self, records: &[(&[u8], &[u8])]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.shrink_trailing_gaps()?;

        let total: usize = records
            .iter()
            .map(|(k, p)| LENGTH_PREFIX as usize + k.len() + p.len())
            .sum();
        let mut buf = BytesMut::with_capacity(total);
        let mut positions = Vec::with_capacity(records.len());
        let base = self.file.len();
        for (key, payload) in records {
            positions.push(base + buf.len() as u64);
            buf.put_slice(&encode_reclen(key.len() + payload.len())?);
            buf.put_slice(key);
            buf.put_slice(payload);
        }

        self.file.append(&buf)?;
        for ((key, _), pos) in records.iter().zip(positions) {
            self.index.put(key, pos)?;
        }
        self.mutated();
        Ok(())
    }

    /// Cut free records off the end of the file
    pub(crate) fn shrink_trailing_gaps(&mut self) -> Result<()> {
        let len = self.file.len();
        let new_len = self.gap.take_trailing(len);
        if new_len < len {
            self.file.truncate(new_len)?;
            debug!(
                path = %self.file.path().display(),
                freed = len - new_len,
                "truncated trailing gaps"
            );
        }
        Ok(())
    }

    /// Free the record of `key`; returns whether it existed
    pub(crate) fn remove(&mut self, key: &[u8]) -> Result<bool> {
        let key = self.normalize(key)?;
        let pos = match self.index.get(&key) {
            Some(pos) => pos,
            None => return Ok(false),
        };
        let len = self.checked_payload_len(&key, pos)?;
        self.file.tombstone(pos)?;
        self.gap.put(pos, (self.keylength + len) as u32);
        self.index.remove(&key);
        self.mutated();
        Ok(true)
    }

    /// Rewrite a payload in place; returns the bytes saved
    pub(crate) fn replace(
        &mut self,
        key: &[u8],
        rewriter: &mut dyn FnMut(&[u8]) -> Result<Vec<u8>>,
    ) -> Result<usize> {
        let key = self.normalize(key)?;
        let pos = match self.index.get(&key) {
            Some(pos) => pos,
            None => return Ok(0),
        };
        let len = self.checked_payload_len(&key, pos)?;
        let old = {
            let _reservation = self.budget.reserve(len + self.keylength + READ_SLACK)?;
            self.file.read_payload(pos, self.keylength, len)?
        };
        let new = rewriter(&old)?;
        if new.len() > old.len() {
            return Err(HeapError::PayloadGrowth {
                old: old.len(),
                new: new.len(),
            });
        }
        if new == old {
            return Ok(0);
        }
        self.file.overwrite_payload(pos, self.keylength, &new, old.len())?;
        self.mutated();
        Ok(old.len() - new.len())
    }

    /// Drop every record and truncate the file
    pub(crate) fn clear(&mut self) -> Result<()> {
        self.index.clear();
        self.gap.clear();
        self.file.truncate(0)?;
        delete_dumps(self.file.path(), &[])?;
        self.dumps_on_disk = false;
        self.touch_registry();
        info!(path = %self.file.path().display(), "heap cleared");
        Ok(())
    }

    fn mutated(&mut self) {
        if self.dumps_on_disk {
            match delete_dumps(self.file.path(), &[]) {
                Ok(_) => self.dumps_on_disk = false,
                Err(e) => {
                    warn!(path = %self.file.path().display(), error = %e, "could not delete heap dumps")
                }
            }
        }
        self.touch_registry();
    }

    fn touch_registry(&self) {
        if let Some(registry) = &self.registry {
            registry.update(self.file.path(), self.index.len());
        }
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Sync the file and optionally dump index and gap list
    ///
    /// Returns the path of the closed file.
    pub(crate) fn close(mut self, write_dump: bool) -> Result<PathBuf> {
        self.file.sync()?;
        let path = self.file.path().to_path_buf();

        let big_enough =
            self.index.len() > DUMP_THRESHOLD || self.gap.len() > DUMP_THRESHOLD;
        if write_dump && big_enough {
            let fp = fingerprint(&path)?;
            let idx = index_dump_path(&path, &fp);
            let gap = gap_dump_path(&path, &fp);
            self.index.dump(&idx)?;
            self.gap.dump(&gap)?;
            delete_dumps(&path, &[idx.as_path(), gap.as_path()])?;
            debug!(path = %path.display(), fingerprint = %fp, "heap dumps written");
        }

        if let Some(registry) = &self.registry {
            registry.unregister(&path);
        }
        info!(
            path = %path.display(),
            entries = self.index.len(),
            bytes = self.file.len(),
            "heap closed"
        );
        Ok(path)
    }
}

// =============================================================================
// Locked Core
// =============================================================================

/// A `HeapCore` behind a mutex; `None` once closed
pub(crate) struct CoreCell {
    name: String,
    keylength: usize,
    order: KeyOrder,
    inner: Mutex<Option<HeapCore>>,
}

impl CoreCell {
    pub(crate) fn open(path: &Path, config: &HeapConfig) -> Result<Self> {
        let core = HeapCore::open(path, config)?;
        Ok(Self {
            name: file_name(path),
            keylength: core.keylength(),
            order: core.order(),
            inner: Mutex::new(Some(core)),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn keylength(&self) -> usize {
        self.keylength
    }

    pub(crate) fn order(&self) -> KeyOrder {
        self.order
    }

    /// Run `f` on the open core
    pub(crate) fn with<T>(&self, f: impl FnOnce(&mut HeapCore) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.lock();
        match guard.as_mut() {
            Some(core) => f(core),
            None => Err(HeapError::Closed(self.name.clone())),
        }
    }

    /// Like [`CoreCell::with`], with a fallback value for a closed heap
    pub(crate) fn with_or<T>(&self, closed: T, f: impl FnOnce(&HeapCore) -> T) -> T {
        match self.inner.lock().as_ref() {
            Some(core) => f(core),
            None => closed,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    /// Close the core; closing twice is a no-op
    pub(crate) fn close(&self, write_dump: bool) -> Result<()> {
        match self.inner.lock().take() {
            Some(core) => core.close(write_dump).map(|_| ()),
            None => Ok(()),
        }
    }
}

/// File name of `path` for display
pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
