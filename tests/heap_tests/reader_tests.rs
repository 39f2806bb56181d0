//! Tests for HeapReader, HeapModifier and the raw record scanner
//!
//! These tests verify:
//! - Reopening from a scan and from a dump gives the same index
//! - Stale dumps are ignored after the file changed
//! - Bad lengths cut the file; malformed and duplicate records are freed
//! - Index/file disagreement is reported and repaired
//! - Payload reads respect the memory budget
//! - Remove and replace through a modifier

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use heapstore::heap::{HeapEntries, HeapModifier, HeapReader, HeapWriter};
use heapstore::{HeapConfig, HeapError, KeyOrder, MemoryBudget};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_heap() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("reader.blob");
    (temp_dir, path)
}

/// Heap with keys `k0000000`.. and payloads `value-{i}` of growing length
fn write_heap(path: &Path, count: usize, write_dump: bool) {
    let mut writer = HeapWriter::open(path, 8, KeyOrder::Natural).unwrap();
    for i in 0..count {
        let key = format!("k{:07}", i);
        let payload = format!("value-{}-{}", i, "x".repeat(i));
        writer.add(key.as_bytes(), payload.as_bytes()).unwrap();
    }
    writer.close(write_dump).unwrap();
}

fn patch_file(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

fn all_keys(reader: &HeapReader) -> Vec<Vec<u8>> {
    reader.keys(true, None).unwrap().collect()
}

// =============================================================================
// Open Tests
// =============================================================================

#[test]
fn test_scan_and_dump_open_agree() {
    let (temp, path) = setup_temp_heap();
    write_heap(&path, 50, false);

    // Free a few records so the gap list is not empty
    let modifier = HeapModifier::open(&path, 8, KeyOrder::Natural).unwrap();
    for i in [3, 17, 31] {
        modifier.remove(format!("k{:07}", i).as_bytes()).unwrap();
    }
    modifier.close(true).unwrap();

    let copy = temp.path().join("copy.blob");
    fs::copy(&path, &copy).unwrap();

    let from_dump = HeapReader::open(&path, 8, KeyOrder::Natural).unwrap();
    let from_scan = HeapReader::open(&copy, 8, KeyOrder::Natural).unwrap();

    assert_eq!(from_dump.size(), 47);
    assert_eq!(all_keys(&from_dump), all_keys(&from_scan));
    for key in all_keys(&from_scan) {
        assert_eq!(from_dump.get(&key).unwrap(), from_scan.get(&key).unwrap());
    }
    assert_eq!(from_dump.mem(), from_scan.mem());
}

#[test]
fn test_stale_dump_is_ignored() {
    let (temp, path) = setup_temp_heap();
    write_heap(&path, 10, true);

    // Append one more record behind the dump's back
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"\x00\x00\x00\x0bk9999999new").unwrap();
    drop(file);

    let reader = HeapReader::open(&path, 8, KeyOrder::Natural).unwrap();
    assert_eq!(reader.size(), 11);
    assert_eq!(reader.get(b"k9999999").unwrap(), Some(b"new".to_vec()));

    let leftovers = fs::read_dir(temp.path())
        .unwrap()
        .filter(|e| {
            let name = e.as_ref().unwrap().file_name().to_string_lossy().into_owned();
            name.ends_with(".idx") || name.ends_with(".gap")
        })
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn test_truncated_tail_is_cut() {
    let (_temp, path) = setup_temp_heap();
    write_heap(&path, 5, false);
    let full_len = fs::metadata(&path).unwrap().len();

    // A record header promising more bytes than the file has
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"\x00\x00\x01\x00k1234567partial").unwrap();
    drop(file);

    let reader = HeapReader::open(&path, 8, KeyOrder::Natural).unwrap();
    assert_eq!(reader.size(), 5);
    assert_eq!(reader.length_bytes(), full_len);
    assert_eq!(fs::metadata(&path).unwrap().len(), full_len);
}

#[test]
fn test_zero_reclen_truncates_heap() {
    let (_temp, path) = setup_temp_heap();
    let mut writer = HeapWriter::open(&path, 4, KeyOrder::Natural).unwrap();
    writer.add(b"aaaa", b"xyz").unwrap();
    writer.close(false).unwrap();

    // A zero length prefix followed by an otherwise valid record
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0, 0, 0, 0]).unwrap();
    file.write_all(b"\x00\x00\x00\x07bbbbxyz").unwrap();
    drop(file);

    let reader = HeapReader::open(&path, 4, KeyOrder::Natural).unwrap();
    assert_eq!(reader.size(), 1);
    assert_eq!(fs::metadata(&path).unwrap().len(), 11);
    assert_eq!(reader.get(b"aaaa").unwrap(), Some(b"xyz".to_vec()));
    assert_eq!(reader.get(b"bbbb").unwrap(), None);
}

#[test]
fn test_malformed_record_is_freed() {
    let (_temp, path) = setup_temp_heap();
    fs::write(
        &path,
        b"\x00\x00\x00\x05AAAA1\x00\x00\x00\x05++++2\x00\x00\x00\x05BBBB3",
    )
    .unwrap();

    let reader = HeapReader::open(&path, 4, KeyOrder::Base64).unwrap();

    assert_eq!(reader.size(), 2);
    assert_eq!(reader.get(b"AAAA").unwrap(), Some(b"1".to_vec()));
    assert_eq!(reader.get(b"BBBB").unwrap(), Some(b"3".to_vec()));
    let bytes = fs::read(&path).unwrap();
    assert_eq!(bytes.len(), 27);
    assert_eq!(bytes[13], 0);
}

#[test]
fn test_duplicate_record_is_freed() {
    let (_temp, path) = setup_temp_heap();
    fs::write(&path, b"\x00\x00\x00\x05AAAA1\x00\x00\x00\x05AAAA2").unwrap();

    let reader = HeapReader::open(&path, 4, KeyOrder::Natural).unwrap();

    // The first copy wins; the second becomes a free record
    assert_eq!(reader.size(), 1);
    assert_eq!(reader.get(b"AAAA").unwrap(), Some(b"1".to_vec()));
    assert_eq!(fs::read(&path).unwrap()[13], 0);
}

#[test]
fn test_empty_file() {
    let (_temp, path) = setup_temp_heap();

    let reader = HeapReader::open(&path, 8, KeyOrder::Natural).unwrap();

    assert_eq!(reader.size(), 0);
    assert_eq!(reader.first_key().unwrap(), None);
    assert_eq!(reader.get(b"anything").unwrap(), None);
    assert_eq!(reader.length(b"anything").unwrap(), -1);
}

// =============================================================================
// Read Tests
// =============================================================================

#[test]
fn test_first_and_last_key() {
    let (_temp, path) = setup_temp_heap();
    write_heap(&path, 4, false);

    let reader = HeapReader::open(&path, 8, KeyOrder::Natural).unwrap();

    assert_eq!(reader.first_key().unwrap(), Some(b"k0000000".to_vec()));
    assert_eq!(reader.last_key().unwrap(), Some(b"k0000003".to_vec()));
}

#[test]
fn test_keys_rotating_wraps_once() {
    let (_temp, path) = setup_temp_heap();
    write_heap(&path, 5, false);
    let reader = HeapReader::open(&path, 8, KeyOrder::Natural).unwrap();

    let keys: Vec<Vec<u8>> = reader.keys_rotating(true, b"k0000003").unwrap().collect();

    let expected: Vec<Vec<u8>> = [3, 4, 0, 1, 2]
        .iter()
        .map(|i| format!("k{:07}", i).into_bytes())
        .collect();
    assert_eq!(keys, expected);
}

#[test]
fn test_keys_descending_from() {
    let (_temp, path) = setup_temp_heap();
    write_heap(&path, 5, false);
    let reader = HeapReader::open(&path, 8, KeyOrder::Natural).unwrap();

    let keys: Vec<Vec<u8>> = reader.keys(false, Some(b"k0000002")).unwrap().collect();

    assert_eq!(keys, vec![b"k0000002".to_vec(), b"k0000001".to_vec(), b"k0000000".to_vec()]);
}

#[test]
fn test_corruption_is_reported_and_repaired() {
    let (_temp, path) = setup_temp_heap();
    write_heap(&path, 3, false);
    let reader = HeapReader::open(&path, 8, KeyOrder::Natural).unwrap();

    // Rename the first record's key on disk
    patch_file(&path, 4, b"kXXXXXXX");

    let err = reader.get(b"k0000000").unwrap_err();
    assert!(matches!(err, HeapError::Corruption(_)));

    // The rebuilt index follows the file
    assert!(!reader.has(b"k0000000").unwrap());
    assert_eq!(reader.get(b"kXXXXXXX").unwrap(), Some(b"value-0-".to_vec()));
    assert_eq!(reader.size(), 3);
}

#[test]
fn test_budget_refuses_large_reads() {
    let (_temp, path) = setup_temp_heap();
    let mut writer = HeapWriter::open(&path, 8, KeyOrder::Natural).unwrap();
    writer.add(b"smallkey", b"tiny").unwrap();
    writer.add(b"largekey", &vec![7u8; 4096]).unwrap();
    writer.close(false).unwrap();

    let config = HeapConfig::builder()
        .keylength(8)
        .budget(Arc::new(MemoryBudget::new(1024)))
        .build();
    let reader = HeapReader::with_config(&path, &config).unwrap();

    assert_eq!(reader.get(b"smallkey").unwrap(), Some(b"tiny".to_vec()));
    let err = reader.get(b"largekey").unwrap_err();
    assert!(matches!(err, HeapError::ResourceExhausted { .. }));
    assert!(err.is_transient());

    // Length needs no payload read
    assert_eq!(reader.length(b"largekey").unwrap(), 4096);
}

#[test]
fn test_closed_reader() {
    let (_temp, path) = setup_temp_heap();
    write_heap(&path, 2, false);
    let reader = HeapReader::open(&path, 8, KeyOrder::Natural).unwrap();

    reader.close(false).unwrap();
    reader.close(false).unwrap();

    assert!(reader.is_closed());
    assert_eq!(reader.size(), 0);
    assert!(matches!(reader.get(b"k0000000"), Err(HeapError::Closed(_))));
}

// =============================================================================
// Modifier Tests
// =============================================================================

#[test]
fn test_remove_is_idempotent() {
    let (_temp, path) = setup_temp_heap();
    write_heap(&path, 3, false);
    let modifier = HeapModifier::open(&path, 8, KeyOrder::Natural).unwrap();

    modifier.remove(b"k0000001").unwrap();
    modifier.remove(b"k0000001").unwrap();
    modifier.remove(b"notthere").unwrap();

    assert_eq!(modifier.size(), 2);
    assert_eq!(modifier.get(b"k0000001").unwrap(), None);
    modifier.close(false).unwrap();

    // The tombstone survives a reopen
    let reader = HeapReader::open(&path, 8, KeyOrder::Natural).unwrap();
    assert!(!reader.has(b"k0000001").unwrap());
    assert_eq!(reader.size(), 2);
}

#[test]
fn test_replace_shrinks_in_place() {
    let (_temp, path) = setup_temp_heap();
    write_heap(&path, 6, false);
    let before = fs::metadata(&path).unwrap().len();
    let modifier = HeapModifier::open(&path, 8, KeyOrder::Natural).unwrap();

    // k0000005 holds "value-5-xxxxx" (13 bytes)
    let saved = modifier
        .replace(b"k0000005", |old: &[u8]| Ok(old[..7].to_vec()))
        .unwrap();

    assert_eq!(saved, 6);
    let mut expected = b"value-5".to_vec();
    expected.resize(13, 0);
    assert_eq!(modifier.get(b"k0000005").unwrap(), Some(expected));
    assert_eq!(modifier.length(b"k0000005").unwrap(), 13);
    assert_eq!(fs::metadata(&path).unwrap().len(), before);
}

#[test]
fn test_replace_rejects_growth() {
    let (_temp, path) = setup_temp_heap();
    write_heap(&path, 2, false);
    let modifier = HeapModifier::open(&path, 8, KeyOrder::Natural).unwrap();

    let err = modifier
        .replace(b"k0000001", |old: &[u8]| {
            let mut grown = old.to_vec();
            grown.push(b'!');
            Ok(grown)
        })
        .unwrap_err();

    assert!(matches!(err, HeapError::PayloadGrowth { old: 9, new: 10 }));
    assert_eq!(modifier.get(b"k0000001").unwrap(), Some(b"value-1-x".to_vec()));
}

#[test]
fn test_replace_absent_key() {
    let (_temp, path) = setup_temp_heap();
    write_heap(&path, 1, false);
    let modifier = HeapModifier::open(&path, 8, KeyOrder::Natural).unwrap();

    let saved = modifier
        .replace(b"k9999999", |_: &[u8]| -> heapstore::Result<Vec<u8>> {
            panic!("rewriter called for an absent key")
        })
        .unwrap();

    assert_eq!(saved, 0);
}

// =============================================================================
// Raw Scanner Tests
// =============================================================================

#[test]
fn test_entries_skip_free_records() {
    let (_temp, path) = setup_temp_heap();
    write_heap(&path, 4, false);
    let modifier = HeapModifier::open(&path, 8, KeyOrder::Natural).unwrap();
    modifier.remove(b"k0000002").unwrap();
    modifier.close(false).unwrap();

    let keys: Vec<Vec<u8>> = HeapEntries::open(&path, 8)
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();

    assert_eq!(keys, vec![b"k0000000".to_vec(), b"k0000001".to_vec(), b"k0000003".to_vec()]);
}

#[test]
fn test_entries_stop_at_damaged_length() {
    let (_temp, path) = setup_temp_heap();
    write_heap(&path, 3, false);
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&(-5i32).to_be_bytes()).unwrap();
    file.write_all(b"garbage").unwrap();
    drop(file);

    let count = HeapEntries::open(&path, 8).unwrap().filter(|e| e.is_ok()).count();

    assert_eq!(count, 3);
}
