//! Fingerprint Dumps
//!
//! Side files that let a heap reopen without scanning.
//!
//! ## Naming
//! ```text
//! {heapfile}.{fingerprint}.idx    index dump
//! {heapfile}.{fingerprint}.gap    gap dump
//! ```
//! The fingerprint is a 12-digit hex hash over the heap file's length and a
//! few sampled blocks. A dump is only trusted when its fingerprint matches
//! the heap file it sits next to.
//!
//! ## Dump Format
//! ```text
//! ┌──────────┬──────────────────────────┬───────────┐
//! │Magic (4) │ bincode payload          │ CRC32 (4) │
//! └──────────┴──────────────────────────┴───────────┘
//! ```

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{HeapError, Result};

/// Magic bytes identifying a dump file
const DUMP_MAGIC: &[u8; 4] = b"HPDX";

/// Length of the fingerprint in file names
pub const FINGERPRINT_LEN: usize = 12;

/// Bytes sampled from each of the head, middle and tail of a heap file
const SAMPLE_SIZE: u64 = 16 * 1024;

/// Extension of index dumps
pub const INDEX_DUMP_EXT: &str = "idx";

/// Extension of gap dumps
pub const GAP_DUMP_EXT: &str = "gap";

// =============================================================================
// Fingerprints
// =============================================================================

/// Fast content hash of a heap file, as 12 hex digits
///
/// Only the length and three sampled blocks are hashed, so the value is
/// cheap for large files but not a full content checksum.
pub fn fingerprint(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    let mut head = crc32fast::Hasher::new();
    let mut tail = crc32fast::Hasher::new();
    head.update(&len.to_be_bytes());
    tail.update(&len.to_le_bytes());

    let mut sample = |hasher: &mut crc32fast::Hasher, start: u64| -> Result<()> {
        let n = SAMPLE_SIZE.min(len.saturating_sub(start));
        let mut buf = vec![0u8; n as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf)?;
        hasher.update(&buf);
        Ok(())
    };
    sample(&mut head, 0)?;
    sample(&mut head, len / 2)?;
    sample(&mut tail, len.saturating_sub(SAMPLE_SIZE))?;

    let mut hex = format!("{:08x}{:08x}", head.finalize(), tail.finalize());
    hex.truncate(FINGERPRINT_LEN);
    Ok(hex)
}

/// Path of the index dump for `heap` with the given fingerprint
pub fn index_dump_path(heap: &Path, fingerprint: &str) -> PathBuf {
    side_path(heap, fingerprint, INDEX_DUMP_EXT)
}

/// Path of the gap dump for `heap` with the given fingerprint
pub fn gap_dump_path(heap: &Path, fingerprint: &str) -> PathBuf {
    side_path(heap, fingerprint, GAP_DUMP_EXT)
}

fn side_path(heap: &Path, fingerprint: &str, ext: &str) -> PathBuf {
    let mut name = heap
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.{}", fingerprint, ext));
    heap.with_file_name(name)
}

/// Name of the heap file a dump belongs to, if `name` looks like a dump
pub fn dump_owner(name: &str) -> Option<&str> {
    let stem = name
        .strip_suffix(".idx")
        .or_else(|| name.strip_suffix(".gap"))?;
    let dot = stem.len().checked_sub(FINGERPRINT_LEN + 1)?;
    if stem.as_bytes().get(dot) != Some(&b'.') {
        return None;
    }
    Some(&stem[..dot])
}

/// Delete every dump of `heap` except the listed paths
pub fn delete_dumps(heap: &Path, keep: &[&Path]) -> Result<usize> {
    let dir = match heap.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let heap_name = match heap.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return Ok(0),
    };
    if !dir.is_dir() {
        return Ok(0);
    }

    let mut deleted = 0;
    for entry in fs::read_dir(&dir)? {
        let path = entry?.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if dump_owner(name) != Some(heap_name) || keep.iter().any(|k| *k == path.as_path()) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => deleted += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(deleted)
}

// =============================================================================
// Dump Framing
// =============================================================================

/// Serialize `value` to `path` with magic and checksum
pub(crate) fn write_dump<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = bincode::serialize(value)?;
    let crc = crc32fast::hash(&body);

    let mut file = File::create(path)?;
    file.write_all(DUMP_MAGIC)?;
    file.write_all(&body)?;
    file.write_all(&crc.to_le_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Read a value written by [`write_dump`], verifying magic and checksum
pub(crate) fn read_dump<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    if bytes.len() < DUMP_MAGIC.len() + 4 || &bytes[..4] != DUMP_MAGIC {
        return Err(HeapError::Dump(format!(
            "{} is not a dump file",
            path.display()
        )));
    }
    let (body, trailer) = bytes[4..].split_at(bytes.len() - 8);
    let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = crc32fast::hash(body);
    if stored != actual {
        return Err(HeapError::Dump(format!(
            "checksum mismatch in {}: stored {:08x}, computed {:08x}",
            path.display(),
            stored,
            actual
        )));
    }
    Ok(bincode::deserialize(body)?)
}
