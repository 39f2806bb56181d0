//! Heap Writer
//!
//! Builds a new heap file in one sequential pass.
//!
//! Records go to `{path}.prt` through a buffered writer. `close` syncs the
//! temp file and renames it to `path`, so a crash never leaves a half-written
//! file under the final name.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{HeapError, Result};
use crate::order::{display_key, KeyOrder};

use super::dump::{delete_dumps, fingerprint, gap_dump_path, index_dump_path};
use super::gap::Gap;
use super::index::RecordIndex;
use super::record::encode_reclen;
use super::{DUMP_THRESHOLD, LENGTH_PREFIX};

/// Extension of files still being written
pub const PARTIAL_EXT: &str = "prt";

/// Temp file used while writing `path`
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}", PARTIAL_EXT));
    path.with_file_name(name)
}

/// Sequential writer for new heap files
pub struct HeapWriter {
    /// Final file path
    path: PathBuf,
    /// Temp file path
    temp: PathBuf,
    writer: BufWriter<File>,
    keylength: usize,
    order: KeyOrder,
    /// Offset of the next record
    offset: u64,
    index: RecordIndex,
}

impl HeapWriter {
    /// Start a new heap file at `path`
    pub fn open(path: impl AsRef<Path>, keylength: usize, order: KeyOrder) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if keylength == 0 {
            return Err(HeapError::Config("keylength must be at least 1".to_string()));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp = partial_path(&path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp)?;

        debug!(path = %path.display(), "heap writer opened");
        Ok(Self {
            path,
            temp,
            writer: BufWriter::with_capacity(1024 * 1024, file),
            keylength,
            order,
            offset: 0,
            index: RecordIndex::new(keylength, order),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records written so far
    pub fn size(&self) -> usize {
        self.index.len()
    }

    /// Bytes written so far
    pub fn length_bytes(&self) -> u64 {
        self.offset
    }

    pub fn has(&self, key: &[u8]) -> bool {
        match self.order.normalize(key, self.keylength) {
            Ok(key) => self.index.contains(&key),
            Err(_) => false,
        }
    }

    /// Append a record
    pub fn add(&mut self, key: &[u8], payload: &[u8]) -> Result<()> {
        let key = self.order.normalize(key, self.keylength)?;
        if self.index.contains(&key) {
            return Err(HeapError::DuplicateKey(display_key(&key)));
        }
        let reclen = encode_reclen(self.keylength + payload.len())?;

        // Index first: it also rejects malformed keys before anything is written
        self.index.put(&key, self.offset)?;
        self.writer.write_all(&reclen)?;
        self.writer.write_all(&key)?;
        self.writer.write_all(payload)?;
        self.offset += LENGTH_PREFIX + (self.keylength + payload.len()) as u64;
        Ok(())
    }

    /// Finish the file and move it to its final name
    ///
    /// With `write_dump`, the index is dumped next to the file so the next
    /// open skips the scan.
    pub fn close(mut self, write_dump: bool) -> Result<PathBuf> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        fs::rename(&self.temp, &self.path)?;

        if write_dump && self.index.len() > DUMP_THRESHOLD {
            let fp = fingerprint(&self.path)?;
            let idx = index_dump_path(&self.path, &fp);
            let gap = gap_dump_path(&self.path, &fp);
            self.index.dump(&idx)?;
            Gap::new().dump(&gap)?;
            delete_dumps(&self.path, &[idx.as_path(), gap.as_path()])?;
        } else {
            delete_dumps(&self.path, &[])?;
        }

        info!(
            path = %self.path.display(),
            entries = self.index.len(),
            bytes = self.offset,
            "heap file written"
        );
        Ok(self.path)
    }

    /// Drop everything written and remove the temp file
    pub fn abort(self) -> Result<()> {
        let temp = self.temp.clone();
        drop(self.writer);
        match fs::remove_file(&temp) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
