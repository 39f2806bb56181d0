//! Merge Compactor
//!
//! Combines two heap files into one key-ordered file.
//!
//! ## Merge Walk
//! ```text
//!   A: k1 ─ k2 ───────         key(A) < key(B)  → copy A
//!   B: ──── k2' ─ k3           key(A) > key(B)  → copy B
//!                              key(A) = key(B)  → ContainerMerge(A, B)
//!   out: k1, merge(k2,k2'), k3
//! ```
//! Output goes through a [`HeapWriter`], so the target only appears under
//! its final name once it is complete. Inputs are deleted only after the
//! output has been closed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::config::HeapConfig;
use crate::error::{HeapError, Result};
use crate::heap::dump::delete_dumps;
use crate::heap::writer::partial_path;
use crate::heap::{HeapReader, HeapWriter, KeyIter};
use crate::order::{display_key, KeyOrder};

// =============================================================================
// Container Merges
// =============================================================================

/// Combines the payloads of a key present in both inputs
///
/// `older` comes from the first input, `newer` from the second.
pub trait ContainerMerge: Send + Sync {
    fn merge(&self, key: &[u8], older: &[u8], newer: &[u8]) -> Result<Vec<u8>>;
}

impl<F> ContainerMerge for F
where
    F: Fn(&[u8], &[u8], &[u8]) -> Result<Vec<u8>> + Send + Sync,
{
    fn merge(&self, key: &[u8], older: &[u8], newer: &[u8]) -> Result<Vec<u8>> {
        self(key, older, newer)
    }
}

/// Keeps the payload of the second input
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferNewer;

impl ContainerMerge for PreferNewer {
    fn merge(&self, _key: &[u8], _older: &[u8], newer: &[u8]) -> Result<Vec<u8>> {
        Ok(newer.to_vec())
    }
}

/// Union of posting containers
///
/// ```text
/// ┌────────────┬──────────────────┬──────────────────┬─────┐
/// │ count (4)  │ row (row_width)  │ row (row_width)  │ ... │
/// │ u32 BE     │ key_width bytes  │                  │     │
/// │            │ identify the row │                  │     │
/// └────────────┴──────────────────┴──────────────────┴─────┘
/// ```
/// Bytes after the last row are ignored, so containers stay readable after
/// an in-place shrink. Rows with the same row key are merged with the
/// second container winning; output rows are sorted by row key.
#[derive(Debug, Clone, Copy)]
pub struct PostingsMerge {
    pub row_width: usize,
    pub key_width: usize,
}

impl PostingsMerge {
    pub fn new(row_width: usize, key_width: usize) -> Self {
        Self {
            row_width,
            key_width: key_width.min(row_width),
        }
    }

    /// Build a container from rows of `row_width` bytes
    pub fn encode<R: AsRef<[u8]>>(&self, rows: &[R]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(4 + rows.len() * self.row_width);
        out.extend_from_slice(&(rows.len() as u32).to_be_bytes());
        for row in rows {
            let row = row.as_ref();
            if row.len() != self.row_width {
                return Err(HeapError::Precondition(format!(
                    "row of {} bytes in a container of width {}",
                    row.len(),
                    self.row_width
                )));
            }
            out.extend_from_slice(row);
        }
        Ok(out)
    }

    /// Split a container into its rows
    pub fn decode<'a>(&self, container: &'a [u8]) -> Result<Vec<&'a [u8]>> {
        if container.len() < 4 {
            return Err(HeapError::Corruption(format!(
                "posting container of {} bytes has no row count",
                container.len()
            )));
        }
        let count = u32::from_be_bytes([container[0], container[1], container[2], container[3]])
            as usize;
        let end = count
            .checked_mul(self.row_width)
            .and_then(|n| n.checked_add(4))
            .filter(|&end| end <= container.len())
            .ok_or_else(|| {
                HeapError::Corruption(format!(
                    "posting container claims {} rows but has {} bytes",
                    count,
                    container.len()
                ))
            })?;
        if self.row_width == 0 {
            return Ok(vec![&container[4..4]; count]);
        }
        Ok(container[4..end].chunks_exact(self.row_width).collect())
    }
}

impl ContainerMerge for PostingsMerge {
    fn merge(&self, _key: &[u8], older: &[u8], newer: &[u8]) -> Result<Vec<u8>> {
        let mut rows: BTreeMap<&[u8], &[u8]> = BTreeMap::new();
        for row in self.decode(older)?.into_iter().chain(self.decode(newer)?) {
            rows.insert(&row[..self.key_width], row);
        }
        let rows: Vec<&[u8]> = rows.into_values().collect();
        self.encode(&rows)
    }
}

// =============================================================================
// Compactor
// =============================================================================

/// Merges and rewrites heap files
pub struct MergeCompactor {
    config: HeapConfig,
}

impl MergeCompactor {
    /// Compactor for heaps with the key layout of `config`
    pub fn new(config: HeapConfig) -> Self {
        Self { config }
    }

    pub fn keylength(&self) -> usize {
        self.config.keylength
    }

    pub fn order(&self) -> KeyOrder {
        self.config.order
    }

    /// Merge `a` and `b` into `target`
    ///
    /// Returns `None` when both inputs are empty (both are deleted). On
    /// failure the inputs stay untouched and partial output is removed.
    pub fn merge(
        &self,
        a: &Path,
        b: &Path,
        target: &Path,
        merger: &dyn ContainerMerge,
    ) -> Result<Option<PathBuf>> {
        let ra = HeapReader::with_config(a, &self.config)?;
        let rb = match HeapReader::with_config(b, &self.config) {
            Ok(rb) => rb,
            Err(e) => {
                ra.close(false)?;
                return Err(e);
            }
        };

        // Step 1: degenerate inputs need no copying
        match (ra.size() == 0, rb.size() == 0) {
            (true, true) => {
                ra.close(false)?;
                rb.close(false)?;
                delete_heap(a)?;
                delete_heap(b)?;
                info!(a = %a.display(), b = %b.display(), "merged two empty heaps");
                return Ok(None);
            }
            (true, false) => {
                ra.close(false)?;
                rb.close(false)?;
                delete_heap(a)?;
                return adopt(b, target).map(Some);
            }
            (false, true) => {
                ra.close(false)?;
                rb.close(false)?;
                delete_heap(b)?;
                return adopt(a, target).map(Some);
            }
            (false, false) => {}
        }

        // Step 2: walk both key streams
        let written = self.write_target(target, |writer| {
            self.merge_streams(&ra, &rb, writer, merger)
        });
        ra.close(false)?;
        rb.close(false)?;
        let (path, records) = written?;

        // Step 3: inputs are no longer needed
        delete_heap(a)?;
        delete_heap(b)?;
        info!(
            a = %a.display(),
            b = %b.display(),
            target = %path.display(),
            records,
            "heaps merged"
        );
        Ok(Some(path))
    }

    /// Copy the live records of `a` into `target`, dropping free space
    ///
    /// Returns `None` (and deletes `a`) when `a` holds no records.
    pub fn rewrite(&self, a: &Path, target: &Path) -> Result<Option<PathBuf>> {
        let ra = HeapReader::with_config(a, &self.config)?;
        if ra.size() == 0 {
            ra.close(false)?;
            delete_heap(a)?;
            return Ok(None);
        }

        let written = self.write_target(target, |writer| {
            let mut keys = ra.keys(true, None)?;
            let mut last = None;
            let mut count = 0;
            while let Some(key) = next_checked(&mut keys, &mut last, self.config.order)? {
                let payload = payload_of(&ra, &key)?;
                writer.add(&key, &payload)?;
                count += 1;
            }
            Ok(count)
        });
        ra.close(false)?;
        let (path, records) = written?;

        if path != a {
            delete_heap(a)?;
        }
        info!(source = %a.display(), target = %path.display(), records, "heap rewritten");
        Ok(Some(path))
    }

    /// Run `fill` against a writer for `target`, cleaning up on failure
    fn write_target<F>(&self, target: &Path, fill: F) -> Result<(PathBuf, usize)>
    where
        F: FnOnce(&mut HeapWriter) -> Result<usize>,
    {
        let mut writer = HeapWriter::open(target, self.config.keylength, self.config.order)?;
        let records = match fill(&mut writer) {
            Ok(n) => n,
            Err(e) => {
                error!(target = %target.display(), error = %e, "merge failed, removing partial output");
                writer.abort()?;
                remove_if_exists(target)?;
                return Err(e);
            }
        };
        match writer.close(true) {
            Ok(path) => Ok((path, records)),
            Err(e) => {
                error!(target = %target.display(), error = %e, "closing merge output failed");
                remove_if_exists(&partial_path(target))?;
                remove_if_exists(target)?;
                delete_dumps(target, &[])?;
                Err(e)
            }
        }
    }

    fn merge_streams(
        &self,
        ra: &HeapReader,
        rb: &HeapReader,
        writer: &mut HeapWriter,
        merger: &dyn ContainerMerge,
    ) -> Result<usize> {
        let order = self.config.order;
        let mut ia = ra.keys(true, None)?;
        let mut ib = rb.keys(true, None)?;
        let (mut last_a, mut last_b) = (None, None);
        let mut ka = next_checked(&mut ia, &mut last_a, order)?;
        let mut kb = next_checked(&mut ib, &mut last_b, order)?;
        let mut count = 0;

        loop {
            match (ka.take(), kb.take()) {
                (Some(a), Some(b)) => match order.compare(&a, &b) {
                    std::cmp::Ordering::Less => {
                        writer.add(&a, &payload_of(ra, &a)?)?;
                        ka = next_checked(&mut ia, &mut last_a, order)?;
                        kb = Some(b);
                    }
                    std::cmp::Ordering::Greater => {
                        writer.add(&b, &payload_of(rb, &b)?)?;
                        ka = Some(a);
                        kb = next_checked(&mut ib, &mut last_b, order)?;
                    }
                    std::cmp::Ordering::Equal => {
                        let merged = merger.merge(&a, &payload_of(ra, &a)?, &payload_of(rb, &b)?)?;
                        writer.add(&a, &merged)?;
                        ka = next_checked(&mut ia, &mut last_a, order)?;
                        kb = next_checked(&mut ib, &mut last_b, order)?;
                    }
                },
                (Some(a), None) => {
                    writer.add(&a, &payload_of(ra, &a)?)?;
                    ka = next_checked(&mut ia, &mut last_a, order)?;
                }
                (None, Some(b)) => {
                    writer.add(&b, &payload_of(rb, &b)?)?;
                    kb = next_checked(&mut ib, &mut last_b, order)?;
                }
                (None, None) => break,
            }
            count += 1;
        }
        Ok(count)
    }
}

/// Next key of a stream that must be strictly ascending
fn next_checked(
    keys: &mut KeyIter,
    last: &mut Option<Vec<u8>>,
    order: KeyOrder,
) -> Result<Option<Vec<u8>>> {
    let key = match keys.next() {
        Some(key) => key,
        None => return Ok(None),
    };
    if let Some(prev) = last.as_ref() {
        if order.compare(prev, &key) != std::cmp::Ordering::Less {
            return Err(HeapError::Precondition(format!(
                "merge input not in key order: {} after {}",
                display_key(&key),
                display_key(prev)
            )));
        }
    }
    *last = Some(key.clone());
    Ok(Some(key))
}

fn payload_of(reader: &HeapReader, key: &[u8]) -> Result<Vec<u8>> {
    reader.get(key)?.ok_or_else(|| {
        HeapError::Corruption(format!(
            "{} listed but not readable in {}",
            display_key(key),
            reader.name()
        ))
    })
}

/// Move a finished heap file to `target`
fn adopt(source: &Path, target: &Path) -> Result<PathBuf> {
    delete_dumps(source, &[])?;
    if source != target {
        fs::rename(source, target)?;
    }
    info!(source = %source.display(), target = %target.display(), "heap adopted without merge");
    Ok(target.to_path_buf())
}

/// Delete a heap file and its dumps
pub(crate) fn delete_heap(path: &Path) -> Result<()> {
    remove_if_exists(path)?;
    delete_dumps(path, &[])?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
