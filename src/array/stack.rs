//! Heap Array
//!
//! A directory of time-stamped heap shards that behaves like one store.
//!
//! ## Responsibilities
//! - Discover, clean up and open existing shards on startup
//! - Route writes to the newest shard, starting a new one by age or size
//! - Evict the oldest shards beyond the retention limits
//! - Answer reads across all shards, concurrently for three or more
//! - Hand shards out for compaction and mount the results
//!
//! ## Locking
//! - `structure`: serialises every mutation of the array (writes, rotation,
//!   mount, unmount, clear, close) and holds the live limits
//! - `shards`: the ordered shard list; readers clone a snapshot of `Arc`s
//!   and never hold array locks while touching files

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::channel;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{ArrayConfig, HeapConfig, MAX_FILE_SIZE, ONE_MONTH};
use crate::error::{HeapError, Result};
use crate::heap::dump::dump_owner;
use crate::heap::writer::PARTIAL_EXT;
use crate::heap::{BlobStore, KeyIter};
use crate::order::{display_key, KeyOrder};

use super::keys::MergedKeys;
use super::merge::{delete_heap, ContainerMerge, MergeCompactor};
use super::naming::{parse_legacy_name, parse_shard_name, unique_shard_path, BLOB_EXT, TEMP_EXT};
use super::shard::{Shard, ShardItem};

/// Pair comparisons after which `unmount_best_match` settles for a good
/// enough candidate
const BEST_MATCH_PATIENCE: usize = 1000;

/// Shards inspected by `unmount_smallest` before settling
const SMALLEST_PATIENCE: usize = 70;

/// Limits that can change while the array is open
#[derive(Debug, Clone)]
struct Limits {
    file_age_limit: Duration,
    file_size_limit: u64,
    repository_age_max: Duration,
    repository_size_max: u64,
    closed: bool,
}

/// Directory of heap shards
pub struct HeapArray {
    dir: PathBuf,
    prefix: String,
    heap: HeapConfig,
    trim_all: bool,
    lookup_workers: usize,

    /// Held for every structural change
    structure: Mutex<Limits>,

    /// Shards ordered oldest → newest
    shards: RwLock<Vec<Arc<ShardItem>>>,
}

impl HeapArray {
    // =========================================================================
    // Open
    // =========================================================================

    /// Open the array in `config.dir`, creating the directory if needed
    ///
    /// On startup:
    /// 1. Delete temp files and dumps whose heap file is gone
    /// 2. Delete empty shard files and rename legacy shard names
    /// 3. Open the newest shard writable, every other one read-only
    pub fn open(config: ArrayConfig) -> Result<Self> {
        config.validate()?;
        let dir = config.dir.clone();
        if dir.exists() && !dir.is_dir() {
            return Err(HeapError::Config(format!(
                "{} exists and is not a directory",
                dir.display()
            )));
        }
        fs::create_dir_all(&dir)?;

        // Step 1: leftovers of interrupted writes and orphaned dumps
        let names = list_names(&dir)?;
        for name in &names {
            let orphan_dump = dump_owner(name).is_some_and(|owner| !names.contains(&owner.to_string()));
            let temp = name.ends_with(&format!(".{}", TEMP_EXT))
                || name.ends_with(&format!(".{}", PARTIAL_EXT));
            if temp || orphan_dump {
                debug!(file = %name, "deleting leftover file");
                remove_file(&dir.join(name))?;
            }
        }

        // Step 2: empty shards and legacy names
        let blob_suffix = format!(".{}", BLOB_EXT);
        for name in list_names(&dir)? {
            if !name.ends_with(&blob_suffix) {
                continue;
            }
            let path = dir.join(&name);
            if fs::metadata(&path)?.len() == 0 {
                debug!(file = %name, "deleting empty shard");
                remove_file(&path)?;
                continue;
            }
            if parse_shard_name(&config.prefix, &name).is_none() {
                if let Some(created) = parse_legacy_name(&name) {
                    let (target, _) = unique_shard_path(&dir, &config.prefix, created);
                    info!(from = %name, to = %target.display(), "migrating legacy shard name");
                    fs::rename(&path, &target)?;
                }
            }
        }

        // Step 3: open shards oldest first
        let mut found: Vec<(DateTime<Utc>, PathBuf)> = Vec::new();
        for name in list_names(&dir)? {
            if !name.ends_with(&blob_suffix) {
                continue;
            }
            match parse_shard_name(&config.prefix, &name) {
                Some(created) => found.push((created, dir.join(&name))),
                None => warn!(file = %name, "skipping file with unparseable shard name"),
            }
        }
        found.sort();

        let newest = found.last().map(|(created, _)| *created);
        let mut shards = Vec::with_capacity(found.len());
        for (created, path) in found {
            let writable = Some(created) == newest && !config.trim_all;
            match Shard::open(&path, &config.heap, writable) {
                Ok(shard) => shards.push(Arc::new(ShardItem {
                    created,
                    path,
                    shard,
                })),
                Err(e) if config.delete_on_fail => {
                    warn!(path = %path.display(), error = %e, "cannot open shard, deleting it");
                    delete_heap(&path)?;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            dir = %dir.display(),
            prefix = %config.prefix,
            shards = shards.len(),
            "heap array opened"
        );
        Ok(Self {
            dir,
            prefix: config.prefix,
            heap: config.heap,
            trim_all: config.trim_all,
            lookup_workers: config.lookup_workers,
            structure: Mutex::new(Limits {
                file_age_limit: config.file_age_limit,
                file_size_limit: config.file_size_limit,
                repository_age_max: config.repository_age_max,
                repository_size_max: config.repository_size_max,
                closed: false,
            }),
            shards: RwLock::new(shards),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Directory name of the array
    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.dir.display().to_string())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn keylength(&self) -> usize {
        self.heap.keylength
    }

    pub fn order(&self) -> KeyOrder {
        self.heap.order
    }

    /// Current shard list, oldest first
    pub fn snapshot(&self) -> Vec<Arc<ShardItem>> {
        self.shards.read().clone()
    }

    /// Paths of all mounted shards, oldest first
    pub fn shard_paths(&self) -> Vec<PathBuf> {
        self.shards.read().iter().map(|s| s.path.clone()).collect()
    }

    /// Number of mounted shards
    pub fn entries(&self) -> usize {
        self.shards.read().len()
    }

    /// Total number of keys over all shards (duplicates counted per shard)
    pub fn size(&self) -> usize {
        self.shards.read().iter().map(|s| s.shard.size()).sum()
    }

    /// Number of keys of each shard, oldest first
    pub fn sizes(&self) -> Vec<usize> {
        self.shards.read().iter().map(|s| s.shard.size()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.read().iter().all(|s| s.shard.size() == 0)
    }

    /// Total bytes of all shard files
    pub fn length_bytes(&self) -> u64 {
        self.shards.read().iter().map(|s| s.shard.length_bytes()).sum()
    }

    /// Estimated memory held by all shard indexes
    pub fn mem(&self) -> usize {
        self.shards.read().iter().map(|s| s.shard.mem()).sum()
    }

    /// Path for a new shard created at `created`, unique in the directory
    pub fn new_blob_path(&self, created: DateTime<Utc>) -> PathBuf {
        unique_shard_path(&self.dir, &self.prefix, created).0
    }

    fn normalize(&self, key: &[u8]) -> Result<Vec<u8>> {
        Ok(self.heap.order.normalize(key, self.heap.keylength)?.into_owned())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Run a lookup on a snapshot, once more if a shard was swapped out
    /// underneath it
    fn lookup<T>(&self, f: impl Fn(&[Arc<ShardItem>]) -> Result<T>) -> Result<T> {
        match f(&self.snapshot()) {
            Err(HeapError::Closed(name)) => {
                debug!(shard = %name, "shard replaced during lookup, retrying");
                f(&self.snapshot())
            }
            other => other,
        }
    }

    /// Shard holding `key`
    ///
    /// The newest shard is asked first, then the oldest of two. With three
    /// or more shards the remaining ones are asked concurrently.
    fn keeper_of(&self, shards: &[Arc<ShardItem>], key: &[u8]) -> Result<Option<Arc<ShardItem>>> {
        let (newest, rest) = match shards.split_last() {
            Some(split) => split,
            None => return Ok(None),
        };
        if newest.shard.has(key)? {
            return Ok(Some(Arc::clone(newest)));
        }
        match rest.len() {
            0 => Ok(None),
            1 => Ok(rest[0].shard.has(key)?.then(|| Arc::clone(&rest[0]))),
            _ => self.fan_out_has(rest, key),
        }
    }

    /// Concurrent `has` over `shards` with at most `lookup_workers` threads
    fn fan_out_has(&self, shards: &[Arc<ShardItem>], key: &[u8]) -> Result<Option<Arc<ShardItem>>> {
        let workers = self.lookup_workers.min(shards.len()).max(1);
        let found = AtomicBool::new(false);
        let (tx, rx) = channel::unbounded::<Result<Arc<ShardItem>>>();

        // Worker `w` checks shards w, w + workers, w + 2 * workers, ...
        let search_from = |w: usize, tx: &channel::Sender<Result<Arc<ShardItem>>>| {
            for item in shards.iter().skip(w).step_by(workers) {
                if found.load(Ordering::Acquire) {
                    return;
                }
                match item.shard.has(key) {
                    Ok(true) => {
                        found.store(true, Ordering::Release);
                        let _ = tx.send(Ok(Arc::clone(item)));
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                }
            }
        };

        let outcome = crossbeam::thread::scope(|scope| {
            for w in 0..workers {
                let worker_tx = tx.clone();
                let search_from = &search_from;
                let spawned = scope
                    .builder()
                    .name(format!("{}-lookup-{}", self.prefix, w))
                    .spawn(move |_| search_from(w, &worker_tx));
                if let Err(e) = spawned {
                    debug!(worker = w, error = %e, "lookup worker not spawned, checking inline");
                    search_from(w, &tx);
                }
            }
            drop(tx);

            let mut keeper = None;
            for message in rx.iter() {
                match message {
                    Ok(item) => {
                        keeper = Some(item);
                        break;
                    }
                    Err(e) => {
                        found.store(true, Ordering::Release);
                        return Err(e);
                    }
                }
            }
            Ok(keeper)
        });

        match outcome {
            Ok(result) => result,
            Err(_) => Err(HeapError::LookupInterrupted(format!(
                "a lookup worker of {} panicked",
                self.name()
            ))),
        }
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        let key = self.normalize(key)?;
        self.lookup(|shards| Ok(self.keeper_of(shards, &key)?.is_some()))
    }

    /// Payload of `key` from the shard that holds it
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = self.normalize(key)?;
        self.lookup(|shards| match self.keeper_of(shards, &key)? {
            Some(item) => item.shard.get(&key),
            None => Ok(None),
        })
    }

    /// Payload length of `key`, -1 if absent
    pub fn length(&self, key: &[u8]) -> Result<i64> {
        let key = self.normalize(key)?;
        self.lookup(|shards| match self.keeper_of(shards, &key)? {
            Some(item) => item.shard.length(&key),
            None => Ok(-1),
        })
    }

    /// Payloads of `key` in every shard, oldest first
    ///
    /// Lazy: each shard is read when the iterator reaches it.
    pub fn get_all(&self, key: &[u8]) -> Result<Box<dyn Iterator<Item = Result<Vec<u8>>> + Send>> {
        let key = self.normalize(key)?;
        let shards = self.snapshot();
        Ok(Box::new(shards.into_iter().filter_map(move |item| {
            item.shard.get(&key).transpose()
        })))
    }

    /// Payload lengths of `key` in every shard, oldest first
    pub fn length_all(&self, key: &[u8]) -> Result<Box<dyn Iterator<Item = Result<i64>> + Send>> {
        let key = self.normalize(key)?;
        let shards = self.snapshot();
        Ok(Box::new(shards.into_iter().filter_map(move |item| {
            match item.shard.length(&key) {
                Ok(len) if len < 0 => None,
                other => Some(other),
            }
        })))
    }

    /// Keys of all shards, merged and deduplicated
    ///
    /// Rotating iteration is not available across shards.
    pub fn keys(&self, up: bool, rotating: bool) -> Result<KeyIter> {
        if rotating {
            return Err(HeapError::Unsupported(
                "rotating key iteration over a heap array".to_string(),
            ));
        }
        self.keys_from(up, None)
    }

    /// Merged keys starting at `from`
    ///
    /// Each shard contributes a snapshot of its keys as of this call, so
    /// memory grows with the total key count of the array.
    pub fn keys_from(&self, up: bool, from: Option<&[u8]>) -> Result<KeyIter> {
        let from = from.map(|k| self.normalize(k)).transpose()?;
        self.lookup(|shards| {
            let sources = shards
                .iter()
                .map(|s| s.shard.keys(up, from.as_deref()))
                .collect::<Result<Vec<_>>>()?;
            Ok(Box::new(MergedKeys::new(sources, self.heap.order, up)) as KeyIter)
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store `payload` under `key` in the newest shard
    ///
    /// A copy of the key already in that shard is replaced. Copies in older
    /// shards stay until compaction.
    pub fn put(&self, key: &[u8], payload: &[u8]) -> Result<()> {
        let key = self.normalize(key)?;
        if !self.heap.order.wellformed(&key) {
            return Err(HeapError::InvalidKey(format!(
                "{} is not a {} key",
                display_key(&key),
                self.heap.order.name()
            )));
        }
        let limits = self.structure.lock();
        if limits.closed {
            return Err(HeapError::Closed(self.name()));
        }

        let now = Utc::now();
        let current = self.shards.read().last().cloned();
        let target = match current {
            Some(item)
                if item.shard.is_writable()
                    && item.age(now) <= limits.file_age_limit
                    && item.shard.length_bytes() <= limits.file_size_limit =>
            {
                item
            }
            _ => self.rotate(now)?,
        };

        target.shard.remove(&key)?;
        target.shard.put(&key, payload)?;
        self.execute_limits(&limits, Some(&target.path))
    }

    /// Start a new writable shard; the previous newest becomes read-only
    fn rotate(&self, now: DateTime<Utc>) -> Result<Arc<ShardItem>> {
        let mut shards = self.shards.write();

        if let Some(last) = shards.last_mut() {
            if last.shard.is_writable() {
                last.shard.close(true)?;
                let shard = Shard::open(&last.path, &self.heap, false)?;
                *last = Arc::new(ShardItem {
                    created: last.created,
                    path: last.path.clone(),
                    shard,
                });
            }
        }

        let (path, created) = unique_shard_path(&self.dir, &self.prefix, now);
        let item = Arc::new(ShardItem {
            shard: Shard::open(&path, &self.heap, true)?,
            created,
            path,
        });
        shards.push(Arc::clone(&item));
        info!(path = %item.path.display(), shards = shards.len(), "started new shard");
        Ok(item)
    }

    /// Delete the oldest shards beyond the age and size limits, never `keep`
    fn execute_limits(&self, limits: &Limits, keep: Option<&Path>) -> Result<()> {
        let now = Utc::now();
        loop {
            let evict = {
                let shards = self.shards.read();
                let oldest = match shards.first() {
                    Some(oldest) => oldest,
                    None => return Ok(()),
                };
                if Some(oldest.path.as_path()) == keep {
                    return Ok(());
                }
                let too_old = oldest
                    .age(now)
                    .checked_sub(limits.file_age_limit)
                    .is_some_and(|over| over > limits.repository_age_max);
                let total: u64 = shards.iter().map(|s| s.shard.length_bytes()).sum();
                let too_big = total > limits.repository_size_max;
                if !too_old && !too_big {
                    return Ok(());
                }
                Arc::clone(oldest)
            };

            self.shards.write().retain(|s| !Arc::ptr_eq(s, &evict));
            evict.shard.close(false)?;
            delete_heap(&evict.path)?;
            info!(path = %evict.path.display(), "evicted shard beyond retention limits");
        }
    }

    /// Free `key` in every shard
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let key = self.normalize(key)?;
        let _limits = self.structure.lock();
        let shards = self.snapshot();
        match shards.len() {
            0 => Ok(()),
            1 => shards[0].shard.remove(&key),
            _ => self.fan_out_remove(&shards, &key),
        }
    }

    /// Concurrent `remove` over `shards`; the newest is handled inline
    fn fan_out_remove(&self, shards: &[Arc<ShardItem>], key: &[u8]) -> Result<()> {
        let (newest, rest) = match shards.split_last() {
            Some(split) => split,
            None => return Ok(()),
        };
        let workers = self.lookup_workers.min(rest.len()).max(1);
        let remove = |w: usize| -> Result<()> {
            for item in rest.iter().skip(w).step_by(workers) {
                item.shard.remove(key)?;
            }
            Ok(())
        };

        let outcome = crossbeam::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            let mut results = Vec::with_capacity(workers + 1);
            for w in 0..workers {
                let remove = &remove;
                match scope
                    .builder()
                    .name(format!("{}-remove-{}", self.prefix, w))
                    .spawn(move |_| remove(w))
                {
                    Ok(handle) => handles.push(handle),
                    Err(_) => results.push(remove(w)),
                }
            }
            results.push(newest.shard.remove(key));
            for handle in handles {
                match handle.join() {
                    Ok(result) => results.push(result),
                    Err(_) => {
                        results.push(Err(HeapError::LookupInterrupted(format!(
                            "a remove worker of {} panicked",
                            self.name()
                        ))))
                    }
                }
            }
            results.into_iter().collect::<Result<Vec<()>>>()
        });

        match outcome {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(HeapError::LookupInterrupted(format!(
                "a remove worker of {} panicked",
                self.name()
            ))),
        }
    }

    /// Rewrite `key` in every shard; returns the total bytes saved
    pub fn replace<F>(&self, key: &[u8], mut rewriter: F) -> Result<usize>
    where
        F: FnMut(&[u8]) -> Result<Vec<u8>>,
    {
        let key = self.normalize(key)?;
        let _limits = self.structure.lock();
        let mut saved = 0;
        for item in self.snapshot() {
            saved += item.shard.replace(&key, &mut rewriter)?;
        }
        Ok(saved)
    }

    /// Delete every shard
    pub fn clear(&self) -> Result<()> {
        let _limits = self.structure.lock();
        let shards: Vec<Arc<ShardItem>> = self.shards.write().drain(..).collect();
        for item in &shards {
            item.shard.clear()?;
            item.shard.close(false)?;
            delete_heap(&item.path)?;
        }
        info!(dir = %self.dir.display(), shards = shards.len(), "heap array cleared");
        Ok(())
    }

    /// Close every shard; the array takes no more writes afterwards
    pub fn close(&self, write_dump: bool) -> Result<()> {
        let mut limits = self.structure.lock();
        if limits.closed {
            return Ok(());
        }
        limits.closed = true;
        let shards: Vec<Arc<ShardItem>> = self.shards.write().drain(..).collect();
        let mut first_error = None;
        for item in &shards {
            if let Err(e) = item.shard.close(write_dump) {
                warn!(path = %item.path.display(), error = %e, "closing shard failed");
                first_error.get_or_insert(e);
            }
        }
        info!(dir = %self.dir.display(), shards = shards.len(), "heap array closed");
        first_error.map_or(Ok(()), Err)
    }

    // =========================================================================
    // Limits
    // =========================================================================

    /// Keep shards for at most `max_age` beyond their write period
    ///
    /// Also derives the write period of a shard: a tenth of `max_age`, at
    /// most one month.
    pub fn set_max_age(&self, max_age: Duration) {
        let mut limits = self.structure.lock();
        limits.repository_age_max = max_age;
        limits.file_age_limit = ONE_MONTH.min(max_age / 10);
    }

    /// Keep at most `max_size` bytes of shards, evicting the oldest now
    ///
    /// Also derives the shard size limit: a hundredth of `max_size`.
    pub fn set_max_size(&self, max_size: u64) -> Result<()> {
        let mut limits = self.structure.lock();
        limits.repository_size_max = max_size;
        limits.file_size_limit = MAX_FILE_SIZE.min(max_size / 100);
        self.execute_limits(&limits, None)
    }

    // =========================================================================
    // Mount / Unmount
    // =========================================================================

    /// Add an existing shard file, named by [`HeapArray::new_blob_path`]
    ///
    /// With `full`, the shard is opened writable (unless the array trims all
    /// shards or runs unbuffered).
    pub fn mount(&self, path: &Path, full: bool) -> Result<()> {
        let _limits = self.structure.lock();
        self.mount_locked(path, full)
    }

    fn mount_locked(&self, path: &Path, full: bool) -> Result<()> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let created = parse_shard_name(&self.prefix, &name).ok_or_else(|| {
            HeapError::Precondition(format!("{} is not a shard of this array", path.display()))
        })?;
        let writable = full && self.heap.buffer_size > 0 && !self.trim_all;
        let item = Arc::new(ShardItem {
            created,
            path: path.to_path_buf(),
            shard: Shard::open(path, &self.heap, writable)?,
        });

        let mut shards = self.shards.write();
        let at = shards.partition_point(|s| s.created <= created);
        shards.insert(at, item);
        info!(path = %path.display(), writable, "shard mounted");
        Ok(())
    }

    /// Remove a shard from the array without deleting its file
    ///
    /// Returns false if no shard has that path.
    pub fn unmount(&self, path: &Path, write_dump: bool) -> Result<bool> {
        let _limits = self.structure.lock();
        let idx = self.shards.read().iter().position(|s| s.path == path);
        match idx {
            Some(idx) => self.unmount_at(idx, write_dump).map(|_| true),
            None => {
                warn!(path = %path.display(), exists = path.exists(), "cannot unmount unknown shard");
                Ok(false)
            }
        }
    }

    fn unmount_at(&self, idx: usize, write_dump: bool) -> Result<PathBuf> {
        let item = self.shards.write().remove(idx);
        item.shard.close(write_dump)?;
        debug!(path = %item.path.display(), "shard unmounted");
        Ok(item.path.clone())
    }

    fn unmount_paths(&self, a: &Path, b: &Path) -> Result<(PathBuf, PathBuf)> {
        for path in [b, a] {
            let idx = self.shards.read().iter().position(|s| s.path == path);
            if let Some(idx) = idx {
                self.unmount_at(idx, false)?;
            }
        }
        Ok((a.to_path_buf(), b.to_path_buf()))
    }

    /// Unmount the pair of shards with the most similar sizes
    ///
    /// Pairs whose combined half sizes exceed half of `max_combined`, or
    /// whose indexes the memory budget cannot hold, are skipped. Returns
    /// `None` if the best size ratio is above `max_ratio`.
    pub fn unmount_best_match(&self, max_ratio: f32, max_combined: u64) -> Result<Option<(PathBuf, PathBuf)>> {
        let _limits = self.structure.lock();
        let shards = self.snapshot();
        if shards.len() < 2 {
            return Ok(None);
        }
        let ceiling = max_combined >> 1;
        let mut best: Option<(usize, usize)> = None;
        let mut min = f32::MAX;
        let mut comparisons = 0;

        'outer: for i in 0..shards.len() - 1 {
            for j in i + 1..shards.len() {
                comparisons += 1;
                let l = 1 + (shards[i].shard.length_bytes() >> 1);
                let r = 1 + (shards[j].shard.length_bytes() >> 1);
                if l + r > ceiling {
                    continue;
                }
                let mem = shards[i].shard.mem() + shards[j].shard.mem();
                if !self.heap.budget.can_allocate(mem) {
                    continue;
                }
                let q = l.max(r) as f32 / l.min(r) as f32;
                if q < min {
                    min = q;
                    best = Some((i, j));
                }
                if comparisons > BEST_MATCH_PATIENCE && min <= max_ratio && best.is_some() {
                    break 'outer;
                }
            }
        }

        match best {
            Some((i, j)) if min <= max_ratio => {
                let pair = self.unmount_paths(&shards[i].path, &shards[j].path)?;
                info!(a = %pair.0.display(), b = %pair.1.display(), ratio = min, "unmounted best match");
                Ok(Some(pair))
            }
            _ => Ok(None),
        }
    }

    /// Unmount the two smallest shards if together they fit `max_result`
    pub fn unmount_smallest(&self, max_result: u64) -> Result<Option<(PathBuf, PathBuf)>> {
        let _limits = self.structure.lock();
        let shards = self.snapshot();
        if shards.len() < 2 {
            return Ok(None);
        }
        let first = match smallest(&shards, None, max_result) {
            Some(i) => i,
            None => return Ok(None),
        };
        let rest = max_result.saturating_sub(shards[first].shard.length_bytes());
        let second = match smallest(&shards, Some(first), rest) {
            Some(i) => i,
            None => return Ok(None),
        };
        self.unmount_paths(&shards[first].path, &shards[second].path)
            .map(Some)
    }

    /// Unmount the oldest shard once it is past the write period
    pub fn unmount_oldest(&self) -> Result<Option<PathBuf>> {
        let limits = self.structure.lock();
        let oldest = match self.shards.read().first() {
            Some(oldest) => oldest.age(Utc::now()) >= limits.file_age_limit,
            None => return Ok(None),
        };
        if !oldest {
            return Ok(None);
        }
        self.unmount_at(0, false).map(Some)
    }

    /// Unmount the oldest shard, or the smaller of the two oldest
    pub fn unmount_oldest_blob(&self, smallest_of_first_two: bool) -> Result<Option<PathBuf>> {
        let _limits = self.structure.lock();
        let idx = {
            let shards = self.shards.read();
            if shards.is_empty() {
                return Ok(None);
            }
            if smallest_of_first_two
                && shards.len() > 1
                && shards[1].shard.length_bytes() < shards[0].shard.length_bytes()
            {
                1
            } else {
                0
            }
        };
        self.unmount_at(idx, false).map(Some)
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Merge two unmounted shard files and mount the result
    ///
    /// The result is named after the newer input. Returns `None` when both
    /// inputs were empty.
    pub fn merge_mount(&self, a: &Path, b: &Path, merger: &dyn ContainerMerge) -> Result<Option<PathBuf>> {
        let created = self.created_of(a)?.max(self.created_of(b)?);
        let target = self.new_blob_path(created);
        info!(a = %a.display(), b = %b.display(), target = %target.display(), "merging shards");

        let compactor = MergeCompactor::new(self.heap.clone());
        match compactor.merge(a, b, &target, merger)? {
            Some(path) => {
                self.mount(&path, false)?;
                Ok(Some(path))
            }
            None => Ok(None),
        }
    }

    /// Rewrite one unmounted shard file without free space and mount it
    pub fn rewrite_mount(&self, a: &Path) -> Result<Option<PathBuf>> {
        let target = self.new_blob_path(self.created_of(a)?);
        info!(source = %a.display(), target = %target.display(), "rewriting shard");

        let compactor = MergeCompactor::new(self.heap.clone());
        match compactor.rewrite(a, &target)? {
            Some(path) => {
                self.mount(&path, false)?;
                Ok(Some(path))
            }
            None => Ok(None),
        }
    }

    fn created_of(&self, path: &Path) -> Result<DateTime<Utc>> {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| parse_shard_name(&self.prefix, n))
            .ok_or_else(|| {
                HeapError::Precondition(format!("{} is not a shard of this array", path.display()))
            })
    }
}

impl BlobStore for HeapArray {
    fn name(&self) -> String {
        HeapArray::name(self)
    }

    fn keylength(&self) -> usize {
        self.heap.keylength
    }

    fn order(&self) -> KeyOrder {
        self.heap.order
    }

    fn clear(&self) -> Result<()> {
        HeapArray::clear(self)
    }

    fn size(&self) -> usize {
        HeapArray::size(self)
    }

    fn keys(&self, up: bool, from: Option<&[u8]>) -> Result<KeyIter> {
        self.keys_from(up, from)
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        HeapArray::has(self, key)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        HeapArray::get(self, key)
    }

    fn length(&self, key: &[u8]) -> Result<i64> {
        HeapArray::length(self, key)
    }

    fn put(&self, key: &[u8], payload: &[u8]) -> Result<()> {
        HeapArray::put(self, key, payload)
    }

    fn replace(
        &self,
        key: &[u8],
        rewriter: &mut dyn FnMut(&[u8]) -> Result<Vec<u8>>,
    ) -> Result<usize> {
        HeapArray::replace(self, key, rewriter)
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        HeapArray::remove(self, key)
    }

    fn close(&self, write_dump: bool) -> Result<()> {
        HeapArray::close(self, write_dump)
    }
}

// =============================================================================
// Private Helpers
// =============================================================================

/// Index of the smallest shard not larger than `max_size`
fn smallest(shards: &[Arc<ShardItem>], excluding: Option<usize>, max_size: u64) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (i, item) in shards.iter().enumerate() {
        if Some(i) == excluding {
            continue;
        }
        let len = item.shard.length_bytes();
        if best.map_or(true, |(_, smallest)| len < smallest) {
            best = Some((i, len));
        }
        if i > SMALLEST_PATIENCE && best.is_some_and(|(_, smallest)| smallest <= max_size) {
            break;
        }
    }
    best.filter(|&(_, len)| len <= max_size).map(|(i, _)| i)
}

/// File names in `dir`
fn list_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl std::fmt::Debug for HeapArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapArray")
            .field("dir", &self.dir)
            .field("prefix", &self.prefix)
            .field("shards", &self.entries())
            .finish()
    }
}

