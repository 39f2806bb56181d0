//! Heap Iterators
//!
//! - [`RotatingKeys`]: ordered keys starting anywhere, wrapping around once
//! - [`HeapEntries`]: raw sequential scan of a heap file, no index needed

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use tracing::warn;

use crate::error::Result;
use crate::order::KeyOrder;

use super::{KeyIter, EMPTY_MARKER};

// =============================================================================
// Rotating Keys
// =============================================================================

/// Key iterator that starts at a key, runs to the end, restarts from the
/// beginning and stops before reaching the start key again
pub struct RotatingKeys {
    head: KeyIter,
    wrapped: KeyIter,
    in_wrap: bool,
    start: Vec<u8>,
    order: KeyOrder,
    up: bool,
}

impl RotatingKeys {
    /// `head` yields the keys from `start` onwards, `all` every key, both in
    /// the same direction `up`
    pub fn new(head: KeyIter, all: KeyIter, start: Vec<u8>, order: KeyOrder, up: bool) -> Self {
        Self {
            head,
            wrapped: all,
            in_wrap: false,
            start,
            order,
            up,
        }
    }
}

impl Iterator for RotatingKeys {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.in_wrap {
            if let Some(key) = self.head.next() {
                return Some(key);
            }
            self.in_wrap = true;
        }
        let key = self.wrapped.next()?;
        let before_start = if self.up {
            Ordering::Less
        } else {
            Ordering::Greater
        };
        if self.order.compare(&key, &self.start) == before_start {
            Some(key)
        } else {
            None
        }
    }
}

// =============================================================================
// Raw Entries
// =============================================================================

/// Sequential `(key, payload)` reader over a heap file
///
/// Free records are skipped. The scan ends quietly at the first damaged
/// length or truncated record.
pub struct HeapEntries {
    reader: BufReader<File>,
    keylength: usize,
    done: bool,
}

impl HeapEntries {
    pub fn open(path: impl AsRef<Path>, keylength: usize) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self {
            reader: BufReader::with_capacity(1024 * 1024, file),
            keylength,
            done: false,
        })
    }

    /// Read the next record of any kind; `None` at a clean end of file
    fn read_record(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let reclen = i32::from_be_bytes(len_buf);
        if reclen <= 0 {
            warn!(reclen, "invalid record length, heap scan stopped");
            return Ok(None);
        }

        let mut record = vec![0u8; reclen as usize];
        match self.reader.read_exact(&mut record) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                warn!(reclen, "truncated record, heap scan stopped");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        let split = self.keylength.min(record.len());
        let payload = record.split_off(split);
        Ok(Some((record, payload)))
    }
}

impl Iterator for HeapEntries {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.read_record() {
                Ok(Some((key, payload))) => {
                    if key.first() == Some(&EMPTY_MARKER) || key.len() < self.keylength {
                        continue;
                    }
                    return Some(Ok((key, payload)));
                }
                Ok(None) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
