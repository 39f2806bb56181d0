//! Tests for HeapArray
//!
//! These tests verify:
//! - Directory discovery, cleanup and legacy name migration
//! - Rotation into new shards by age and by size
//! - Eviction of old shards by age and by total size
//! - Lookups across shards, including duplicates pending compaction
//! - Mount / unmount and the compaction candidate policies

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use heapstore::array::{parse_shard_name, BLOB_EXT};
use heapstore::heap::HeapWriter;
use heapstore::{ArrayConfig, BlobStore, HeapArray, HeapError, KeyOrder};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_array() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("array");
    (temp_dir, path)
}

fn config(dir: &Path) -> ArrayConfig {
    ArrayConfig::builder()
        .dir(dir)
        .prefix("test")
        .keylength(8)
        .lookup_workers(2)
        .build()
}

/// Config where every put beyond the first starts a new shard
fn one_record_per_shard(dir: &Path) -> ArrayConfig {
    ArrayConfig::builder()
        .dir(dir)
        .prefix("test")
        .keylength(8)
        .buffer_size(0)
        .file_size_limit(1)
        .lookup_workers(2)
        .build()
}

fn key(i: usize) -> Vec<u8> {
    format!("key{:05}", i).into_bytes()
}

fn blob_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(&format!(".{}", BLOB_EXT)))
        .collect();
    names.sort();
    names
}

fn write_shard(path: &Path, records: &[(&[u8], &[u8])]) {
    let mut writer = HeapWriter::open(path, 8, KeyOrder::Natural).unwrap();
    for (k, v) in records {
        writer.add(k, v).unwrap();
    }
    writer.close(false).unwrap();
}

// =============================================================================
// Open / Discovery Tests
// =============================================================================

#[test]
fn test_open_creates_directory() {
    let (_temp, dir) = setup_temp_array();
    assert!(!dir.exists());

    let array = HeapArray::open(config(&dir)).unwrap();

    assert!(dir.is_dir());
    assert_eq!(array.entries(), 0);
    assert!(array.is_empty());
    assert_eq!(array.name(), "array");
    assert_eq!(array.get(b"key00001").unwrap(), None);
}

#[test]
fn test_open_rejects_file_as_directory() {
    let (_temp, dir) = setup_temp_array();
    fs::write(&dir, b"not a directory").unwrap();

    let err = HeapArray::open(config(&dir)).unwrap_err();

    assert!(matches!(err, HeapError::Config(_)));
}

#[test]
fn test_discovery_cleans_up_and_migrates() {
    let (_temp, dir) = setup_temp_array();
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("test.20240101000000000.blob.tmp"), b"junk").unwrap();
    fs::write(dir.join("test.20240101000000000.blob.prt"), b"junk").unwrap();
    fs::write(dir.join("gone.blob.0123456789ab.idx"), b"junk").unwrap();
    fs::write(dir.join("test.20240202000000000.blob"), b"").unwrap();
    fs::write(dir.join("test.garbage.blob"), b"junk").unwrap();
    write_shard(&dir.join("20230102030405.blob"), &[(b"legacy01", b"old")]);

    let array = HeapArray::open(config(&dir)).unwrap();

    assert_eq!(array.entries(), 1);
    assert_eq!(array.get(b"legacy01").unwrap(), Some(b"old".to_vec()));
    assert_eq!(
        blob_names(&dir),
        vec!["test.20230102030405000.blob".to_string(), "test.garbage.blob".to_string()]
    );
    let leftovers: Vec<String> = fs::read_dir(&dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| !n.ends_with(".blob"))
        .collect();
    assert!(leftovers.is_empty(), "unexpected files: {:?}", leftovers);
}

#[test]
fn test_reopen_finds_all_shards() {
    let (_temp, dir) = setup_temp_array();
    {
        let array = HeapArray::open(one_record_per_shard(&dir)).unwrap();
        for i in 0..4 {
            array.put(&key(i), format!("value-{}", i).as_bytes()).unwrap();
        }
        assert_eq!(array.entries(), 4);
        array.close(true).unwrap();
    }

    let array = HeapArray::open(config(&dir)).unwrap();
    let shards = array.snapshot();

    assert_eq!(shards.len(), 4);
    assert!(shards[3].shard.is_writable());
    assert!(shards[..3].iter().all(|s| !s.shard.is_writable()));
    assert!(shards.windows(2).all(|w| w[0].created < w[1].created));
    for i in 0..4 {
        assert_eq!(array.get(&key(i)).unwrap(), Some(format!("value-{}", i).into_bytes()));
    }
}

#[test]
fn test_trim_all_opens_everything_read_only() {
    let (_temp, dir) = setup_temp_array();
    {
        let array = HeapArray::open(one_record_per_shard(&dir)).unwrap();
        array.put(&key(1), b"one").unwrap();
        array.put(&key(2), b"two").unwrap();
        array.close(false).unwrap();
    }

    let mut cfg = config(&dir);
    cfg.trim_all = true;
    let array = HeapArray::open(cfg).unwrap();

    assert!(array.snapshot().iter().all(|s| !s.shard.is_writable()));

    // A write starts a fresh shard
    array.put(&key(3), b"three").unwrap();
    assert_eq!(array.entries(), 3);
    assert!(array.snapshot()[2].shard.is_writable());
}

// =============================================================================
// Rotation Tests
// =============================================================================

#[test]
fn test_rotation_by_age() {
    let (_temp, dir) = setup_temp_array();
    let mut cfg = config(&dir);
    cfg.file_age_limit = Duration::from_millis(50);
    let array = HeapArray::open(cfg).unwrap();

    array.put(&key(1), b"first").unwrap();
    thread::sleep(Duration::from_millis(120));
    array.put(&key(2), b"second").unwrap();

    let shards = array.snapshot();
    assert_eq!(shards.len(), 2);
    assert!(!shards[0].shard.is_writable());
    assert!(shards[1].shard.is_writable());
    assert!(shards[0].shard.has(&key(1)).unwrap());
    assert!(!shards[0].shard.has(&key(2)).unwrap());
    assert!(shards[1].shard.has(&key(2)).unwrap());
    assert_eq!(array.get(&key(1)).unwrap(), Some(b"first".to_vec()));
}

#[test]
fn test_rotation_by_size() {
    let (_temp, dir) = setup_temp_array();
    let mut cfg = config(&dir);
    cfg.heap.buffer_size = 0;
    cfg.file_size_limit = 50;
    let array = HeapArray::open(cfg).unwrap();

    // Each record takes 4 + 8 + 30 bytes; the second one still fits
    array.put(&key(1), &[1u8; 30]).unwrap();
    array.put(&key(2), &[2u8; 30]).unwrap();
    assert_eq!(array.entries(), 1);

    array.put(&key(3), &[3u8; 30]).unwrap();
    assert_eq!(array.entries(), 2);
    assert_eq!(array.sizes(), vec![2, 1]);
    assert_eq!(array.size(), 3);
}

#[test]
fn test_shard_names_follow_prefix() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(one_record_per_shard(&dir)).unwrap();
    array.put(&key(1), b"a").unwrap();
    array.put(&key(2), b"b").unwrap();

    let names = blob_names(&dir);
    assert_eq!(names.len(), 2);
    assert!(names.iter().all(|n| parse_shard_name("test", n).is_some()));
    assert_ne!(names[0], names[1]);
}

// =============================================================================
// Eviction Tests
// =============================================================================

#[test]
fn test_eviction_by_total_size() {
    let (_temp, dir) = setup_temp_array();
    let mut cfg = one_record_per_shard(&dir);
    cfg.repository_size_max = 100;
    let array = HeapArray::open(cfg).unwrap();

    // 40 bytes per shard: at most two fit under 100
    for i in 0..5 {
        array.put(&key(i), &[i as u8; 28]).unwrap();
        assert!(array.length_bytes() <= 100);
    }

    assert_eq!(array.entries(), 2);
    assert_eq!(array.get(&key(0)).unwrap(), None);
    assert_eq!(array.get(&key(2)).unwrap(), None);
    assert_eq!(array.get(&key(4)).unwrap(), Some(vec![4u8; 28]));
    assert_eq!(blob_names(&dir).len(), 2);
}

#[test]
fn test_eviction_by_age() {
    let (_temp, dir) = setup_temp_array();
    let mut cfg = config(&dir);
    cfg.file_age_limit = Duration::from_millis(10);
    cfg.repository_age_max = Duration::from_millis(10);
    let array = HeapArray::open(cfg).unwrap();

    array.put(&key(1), b"old").unwrap();
    thread::sleep(Duration::from_millis(80));
    array.put(&key(2), b"new").unwrap();

    assert_eq!(array.entries(), 1);
    assert_eq!(array.get(&key(1)).unwrap(), None);
    assert_eq!(array.get(&key(2)).unwrap(), Some(b"new".to_vec()));
}

#[test]
fn test_newest_shard_survives_eviction() {
    let (_temp, dir) = setup_temp_array();
    let mut cfg = one_record_per_shard(&dir);
    cfg.repository_size_max = 10;
    let array = HeapArray::open(cfg).unwrap();

    array.put(&key(1), &[0u8; 100]).unwrap();

    assert_eq!(array.entries(), 1);
    assert_eq!(array.get(&key(1)).unwrap(), Some(vec![0u8; 100]));
}

#[test]
fn test_set_max_size_evicts_now() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(one_record_per_shard(&dir)).unwrap();
    for i in 0..3 {
        array.put(&key(i), &[0u8; 28]).unwrap();
    }
    assert_eq!(array.entries(), 3);

    array.set_max_size(100).unwrap();

    assert_eq!(array.entries(), 2);
    assert_eq!(array.get(&key(0)).unwrap(), None);
}

#[test]
fn test_set_max_age_derives_rotation_period() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(config(&dir)).unwrap();
    array.set_max_age(Duration::from_millis(200));

    array.put(&key(1), b"a").unwrap();
    thread::sleep(Duration::from_millis(60));
    array.put(&key(2), b"b").unwrap();

    // Rotation after 20ms; eviction only after 20ms + 200ms
    assert_eq!(array.entries(), 2);
}

// =============================================================================
// Read / Write Tests
// =============================================================================

#[test]
fn test_put_replaces_key_in_newest_shard() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(config(&dir)).unwrap();

    array.put(&key(1), b"v1").unwrap();
    array.put(&key(1), b"v2").unwrap();

    assert_eq!(array.size(), 1);
    assert_eq!(array.get(&key(1)).unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn test_duplicates_across_shards() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(one_record_per_shard(&dir)).unwrap();
    array.put(&key(1), b"old").unwrap();
    array.put(&key(2), b"other").unwrap();
    array.put(&key(1), b"newer").unwrap();

    // The newest shard answers first
    assert_eq!(array.get(&key(1)).unwrap(), Some(b"newer".to_vec()));
    assert_eq!(array.length(&key(1)).unwrap(), 5);

    let all: Vec<Vec<u8>> = array.get_all(&key(1)).unwrap().map(|p| p.unwrap()).collect();
    assert_eq!(all, vec![b"old".to_vec(), b"newer".to_vec()]);
    let lengths: Vec<i64> = array.length_all(&key(1)).unwrap().map(|l| l.unwrap()).collect();
    assert_eq!(lengths, vec![3, 5]);

    // Keys are reported once
    let keys: Vec<Vec<u8>> = array.keys(true, false).unwrap().collect();
    assert_eq!(keys, vec![key(1), key(2)]);

    array.remove(&key(1)).unwrap();
    assert!(!array.has(&key(1)).unwrap());
    assert_eq!(array.get_all(&key(1)).unwrap().count(), 0);
    assert_eq!(array.length(&key(1)).unwrap(), -1);
}

#[test]
fn test_lookup_across_many_shards() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(one_record_per_shard(&dir)).unwrap();
    for i in 0..9 {
        array.put(&key(i), format!("payload-{}", i).as_bytes()).unwrap();
    }
    assert_eq!(array.entries(), 9);

    for i in 0..9 {
        assert!(array.has(&key(i)).unwrap());
        assert_eq!(array.get(&key(i)).unwrap(), Some(format!("payload-{}", i).into_bytes()));
    }
    assert!(!array.has(&key(99)).unwrap());
    assert_eq!(array.get(&key(99)).unwrap(), None);
}

#[test]
fn test_keys_merged_in_order() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(one_record_per_shard(&dir)).unwrap();
    for i in [5, 1, 4, 2, 3] {
        array.put(&key(i), b"x").unwrap();
    }

    let up: Vec<Vec<u8>> = array.keys(true, false).unwrap().collect();
    let down: Vec<Vec<u8>> = array.keys(false, false).unwrap().collect();
    let from: Vec<Vec<u8>> = array.keys_from(true, Some(&key(3)[..])).unwrap().collect();

    assert_eq!(up, (1..=5).map(key).collect::<Vec<_>>());
    assert_eq!(down, (1..=5).rev().map(key).collect::<Vec<_>>());
    assert_eq!(from, vec![key(3), key(4), key(5)]);
}

#[test]
fn test_keys_are_a_snapshot() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(one_record_per_shard(&dir)).unwrap();
    for i in 1..=3 {
        array.put(&key(i), b"x").unwrap();
    }

    let keys = array.keys(true, false).unwrap();
    array.put(&key(4), b"x").unwrap();
    array.remove(&key(2)).unwrap();

    assert_eq!(keys.collect::<Vec<_>>(), vec![key(1), key(2), key(3)]);
    let now: Vec<Vec<u8>> = array.keys(true, false).unwrap().collect();
    assert_eq!(now, vec![key(1), key(3), key(4)]);
}

#[test]
fn test_put_rejects_free_marker_key() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(one_record_per_shard(&dir)).unwrap();
    array.put(&key(1), b"x").unwrap();

    let err = array.put(b"\0ey00002", b"x").unwrap_err();
    assert!(matches!(err, HeapError::InvalidKey(_)));
    assert_eq!(array.size(), 1);
    assert_eq!(array.entries(), 1);
}

#[test]
fn test_rotating_keys_unsupported() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(config(&dir)).unwrap();

    assert!(matches!(array.keys(true, true), Err(HeapError::Unsupported(_))));
}

#[test]
fn test_replace_across_shards() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(one_record_per_shard(&dir)).unwrap();
    array.put(&key(1), b"aaaa").unwrap();
    array.put(&key(2), b"b").unwrap();
    array.put(&key(1), b"cccccc").unwrap();

    let saved = array.replace(&key(1), |old: &[u8]| Ok(old[..1].to_vec())).unwrap();

    assert_eq!(saved, 3 + 5);
}

#[test]
fn test_concurrent_readers_during_rotation() {
    let (_temp, dir) = setup_temp_array();
    let array = Arc::new(HeapArray::open(one_record_per_shard(&dir)).unwrap());
    array.put(&key(0), b"anchor").unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let array = Arc::clone(&array);
            thread::spawn(move || {
                for _ in 0..200 {
                    assert_eq!(array.get(&key(0)).unwrap(), Some(b"anchor".to_vec()));
                }
            })
        })
        .collect();
    for i in 1..20 {
        array.put(&key(i), b"filler").unwrap();
    }
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(array.entries(), 20);
}

// =============================================================================
// Mount / Unmount Tests
// =============================================================================

#[test]
fn test_unmount_and_mount() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(one_record_per_shard(&dir)).unwrap();
    array.put(&key(1), b"one").unwrap();
    array.put(&key(2), b"two").unwrap();
    let first = array.shard_paths()[0].clone();

    assert!(array.unmount(&first, false).unwrap());
    assert!(!array.unmount(&first, false).unwrap());
    assert_eq!(array.entries(), 1);
    assert_eq!(array.get(&key(1)).unwrap(), None);
    assert!(first.exists());

    array.mount(&first, false).unwrap();
    assert_eq!(array.shard_paths()[0], first);
    assert_eq!(array.get(&key(1)).unwrap(), Some(b"one".to_vec()));
}

#[test]
fn test_mount_rejects_foreign_names() {
    let (temp, dir) = setup_temp_array();
    let array = HeapArray::open(config(&dir)).unwrap();
    let foreign = temp.path().join("foreign.blob");
    write_shard(&foreign, &[(b"key00001", b"x")]);

    assert!(matches!(array.mount(&foreign, false), Err(HeapError::Precondition(_))));
}

#[test]
fn test_unmount_oldest_respects_age() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(one_record_per_shard(&dir)).unwrap();
    array.put(&key(1), b"one").unwrap();
    array.put(&key(2), b"two").unwrap();

    // Default rotation period is a month
    assert_eq!(array.unmount_oldest().unwrap(), None);

    array.set_max_age(Duration::from_millis(100));
    thread::sleep(Duration::from_millis(30));
    let oldest = array.shard_paths()[0].clone();
    assert_eq!(array.unmount_oldest().unwrap(), Some(oldest));
    assert_eq!(array.entries(), 1);
}

#[test]
fn test_unmount_oldest_blob_picks_smaller() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(one_record_per_shard(&dir)).unwrap();
    array.put(&key(1), &[0u8; 100]).unwrap();
    array.put(&key(2), &[0u8; 10]).unwrap();
    array.put(&key(3), &[0u8; 10]).unwrap();
    let paths = array.shard_paths();

    assert_eq!(array.unmount_oldest_blob(true).unwrap(), Some(paths[1].clone()));
    assert_eq!(array.unmount_oldest_blob(false).unwrap(), Some(paths[0].clone()));
    assert_eq!(array.entries(), 1);
}

#[test]
fn test_unmount_smallest() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(one_record_per_shard(&dir)).unwrap();
    for (i, size) in [300, 20, 500, 10].iter().enumerate() {
        array.put(&key(i), &vec![0u8; *size]).unwrap();
    }
    let paths = array.shard_paths();

    // Too small a budget for even the two smallest
    assert_eq!(array.unmount_smallest(40).unwrap(), None);

    let (a, b) = array.unmount_smallest(100).unwrap().unwrap();
    assert_eq!(a, paths[3]);
    assert_eq!(b, paths[1]);
    assert_eq!(array.entries(), 2);
}

#[test]
fn test_unmount_best_match() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(one_record_per_shard(&dir)).unwrap();
    for (i, size) in [10, 100, 12, 500].iter().enumerate() {
        array.put(&key(i), &vec![0u8; *size]).unwrap();
    }
    let paths = array.shard_paths();

    assert_eq!(array.unmount_best_match(1.01, u64::MAX).unwrap(), None);
    assert_eq!(array.entries(), 4);

    let pair = array.unmount_best_match(2.0, u64::MAX).unwrap();
    assert_eq!(pair, Some((paths[0].clone(), paths[2].clone())));
    assert_eq!(array.entries(), 2);
}

#[test]
fn test_unmount_best_match_respects_ceiling() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(one_record_per_shard(&dir)).unwrap();
    array.put(&key(1), &[0u8; 100]).unwrap();
    array.put(&key(2), &[0u8; 100]).unwrap();

    assert_eq!(array.unmount_best_match(2.0, 100).unwrap(), None);
    assert!(array.unmount_best_match(2.0, 1000).unwrap().is_some());
}

// =============================================================================
// Clear / Close Tests
// =============================================================================

#[test]
fn test_clear_deletes_shards() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(one_record_per_shard(&dir)).unwrap();
    array.put(&key(1), b"one").unwrap();
    array.put(&key(2), b"two").unwrap();

    array.clear().unwrap();

    assert_eq!(array.entries(), 0);
    assert!(blob_names(&dir).is_empty());
    array.put(&key(3), b"three").unwrap();
    assert_eq!(array.entries(), 1);
}

#[test]
fn test_put_after_close_fails() {
    let (_temp, dir) = setup_temp_array();
    let array = HeapArray::open(config(&dir)).unwrap();
    array.put(&key(1), b"one").unwrap();

    array.close(true).unwrap();
    array.close(true).unwrap();

    assert!(matches!(array.put(&key(2), b"two"), Err(HeapError::Closed(_))));
}

#[test]
fn test_blob_store_surface() {
    let (_temp, dir) = setup_temp_array();
    let store: Box<dyn BlobStore> = Box::new(HeapArray::open(config(&dir)).unwrap());

    store.put(b"key00001", b"payload").unwrap();

    assert_eq!(store.name(), "array");
    assert_eq!(store.keylength(), 8);
    assert_eq!(store.order(), KeyOrder::Natural);
    assert_eq!(store.size(), 1);
    assert_eq!(store.get(b"key00001").unwrap(), Some(b"payload".to_vec()));
    store.remove(b"key00001").unwrap();
    assert!(!store.has(b"key00001").unwrap());
    store.close(false).unwrap();
}
