//! Record File
//!
//! Positioned reads and writes of length-prefixed records.
//!
//! All offset arithmetic on heap files happens here: callers pass record
//! offsets and get keys, payloads and lengths back.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{HeapError, Result};

use super::{EMPTY_MARKER, LENGTH_PREFIX};

/// Largest `reclen` the 4-byte signed length field can hold
pub(crate) const MAX_RECLEN: usize = i32::MAX as usize;

/// Encode a record length prefix
pub(crate) fn encode_reclen(reclen: usize) -> Result<[u8; 4]> {
    if reclen > MAX_RECLEN {
        return Err(HeapError::RecordTooLarge(reclen));
    }
    Ok((reclen as i32).to_be_bytes())
}

/// Random-access handle on one heap file
pub(crate) struct RecordFile {
    path: PathBuf,
    file: File,
    /// Current file length (tracked, not re-read on every append)
    len: u64,
}

impl RecordFile {
    /// Open a heap file read/write, creating it and its directory if needed
    pub(crate) fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    /// Read the `reclen` field of the record at `pos`
    pub(crate) fn read_reclen(&mut self, pos: u64) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Read the key of the record at `pos`
    pub(crate) fn read_key(&mut self, pos: u64, keylength: usize) -> Result<Vec<u8>> {
        let mut key = vec![0u8; keylength];
        self.file.seek(SeekFrom::Start(pos + LENGTH_PREFIX))?;
        self.file.read_exact(&mut key)?;
        Ok(key)
    }

    /// Read `len` payload bytes of the record at `pos`
    pub(crate) fn read_payload(&mut self, pos: u64, keylength: usize, len: usize) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; len];
        self.file
            .seek(SeekFrom::Start(pos + LENGTH_PREFIX + keylength as u64))?;
        self.file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Write a full record at `pos` with the given declared `reclen`
    ///
    /// `reclen` may exceed `key.len() + payload.len()`; the difference is
    /// zero-filled so the slot keeps its size.
    pub(crate) fn write_record(
        &mut self,
        pos: u64,
        reclen: usize,
        key: &[u8],
        payload: &[u8],
    ) -> Result<()> {
        let used = key.len() + payload.len();
        if used > reclen {
            return Err(HeapError::Precondition(format!(
                "record of {} bytes does not fit a slot of {} bytes",
                used, reclen
            )));
        }
        let mut record = Vec::with_capacity(LENGTH_PREFIX as usize + reclen);
        record.extend_from_slice(&encode_reclen(reclen)?);
        record.extend_from_slice(key);
        record.extend_from_slice(payload);
        record.resize(LENGTH_PREFIX as usize + reclen, 0);
        self.write_at(pos, &record)
    }

    /// Overwrite the payload area of the record at `pos`, zero-filling up to
    /// `slot_len` payload bytes
    pub(crate) fn overwrite_payload(
        &mut self,
        pos: u64,
        keylength: usize,
        payload: &[u8],
        slot_len: usize,
    ) -> Result<()> {
        let mut area = payload.to_vec();
        area.resize(slot_len, 0);
        self.write_at(pos + LENGTH_PREFIX + keylength as u64, &area)
    }

    /// Write a free record header: `reclen` and a zero first key byte
    pub(crate) fn write_free(&mut self, pos: u64, reclen: usize) -> Result<()> {
        let mut header = Vec::with_capacity(5);
        header.extend_from_slice(&encode_reclen(reclen)?);
        header.push(EMPTY_MARKER);
        self.write_at(pos, &header)
    }

    /// Rewrite only the `reclen` field at `pos`
    pub(crate) fn write_reclen(&mut self, pos: u64, reclen: usize) -> Result<()> {
        self.write_at(pos, &encode_reclen(reclen)?)
    }

    /// Mark the record at `pos` as free by zeroing its first key byte
    pub(crate) fn tombstone(&mut self, pos: u64) -> Result<()> {
        self.write_at(pos + LENGTH_PREFIX, &[EMPTY_MARKER])
    }

    /// Write raw bytes at the end of the file, returning their offset
    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let pos = self.len;
        self.write_at(pos, bytes)?;
        Ok(pos)
    }

    fn write_at(&mut self, pos: u64, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.write_all(bytes)?;
        self.len = self.len.max(pos + bytes.len() as u64);
        Ok(())
    }

    /// Cut the file at `len`
    pub(crate) fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Sequential scanner over all records, for index rebuilds
    pub(crate) fn scan(&self, keylength: usize) -> Result<RecordScan> {
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        Ok(RecordScan {
            reader: BufReader::with_capacity(256 * 1024, file),
            keylength,
            pos: 0,
            end: self.len,
            done: false,
        })
    }
}

/// One step of a linear scan
#[derive(Debug)]
pub(crate) enum ScanItem {
    /// A record header: offset, declared `reclen`, and up to `keylength`
    /// leading bytes (fewer if the record is shorter than a key)
    Record { pos: u64, reclen: usize, key: Vec<u8> },
    /// A `reclen <= 0` at `pos`; nothing after it can be trusted
    BadLength { pos: u64, reclen: i32 },
    /// The record at `pos` runs past the end of the file
    Truncated { pos: u64 },
}

/// Linear scanner over a heap file
pub(crate) struct RecordScan {
    reader: BufReader<File>,
    keylength: usize,
    pos: u64,
    end: u64,
    done: bool,
}

impl Iterator for RecordScan {
    type Item = Result<ScanItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.end {
            return None;
        }
        let pos = self.pos;

        // Length prefix must be complete
        if pos + LENGTH_PREFIX > self.end {
            self.done = true;
            return Some(Ok(ScanItem::Truncated { pos }));
        }
        let mut len_buf = [0u8; 4];
        if let Err(e) = self.reader.read_exact(&mut len_buf) {
            self.done = true;
            return Some(Err(HeapError::Io(e)));
        }
        let reclen = i32::from_be_bytes(len_buf);
        if reclen <= 0 {
            self.done = true;
            return Some(Ok(ScanItem::BadLength { pos, reclen }));
        }
        let reclen = reclen as usize;

        // Whole record must fit in the file
        let next = pos + LENGTH_PREFIX + reclen as u64;
        if next > self.end {
            self.done = true;
            return Some(Ok(ScanItem::Truncated { pos }));
        }

        let key_bytes = reclen.min(self.keylength);
        let mut key = vec![0u8; key_bytes];
        if let Err(e) = self.reader.read_exact(&mut key) {
            self.done = true;
            return Some(Err(HeapError::Io(e)));
        }
        let skip = (reclen - key_bytes) as i64;
        if skip > 0 {
            if let Err(e) = self.reader.seek_relative(skip) {
                self.done = true;
                return Some(Err(HeapError::Io(e)));
            }
        }

        self.pos = next;
        Some(Ok(ScanItem::Record { pos, reclen, key }))
    }
}
