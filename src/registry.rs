//! Heap Registry
//!
//! Tracks open heap files for statistics. One registry is created by the
//! embedding process and handed to every heap through `HeapConfig`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// Registry of currently open heaps
#[derive(Debug, Default)]
pub struct HeapRegistry {
    /// Open heap file → number of indexed records at registration time
    open: Mutex<BTreeMap<PathBuf, usize>>,
}

impl HeapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a heap file was opened
    pub fn register(&self, path: &Path, entries: usize) {
        self.open.lock().insert(path.to_path_buf(), entries);
    }

    /// Update the record count of an open heap
    pub fn update(&self, path: &Path, entries: usize) {
        if let Some(count) = self.open.lock().get_mut(path) {
            *count = entries;
        }
    }

    /// Record that a heap file was closed
    pub fn unregister(&self, path: &Path) {
        self.open.lock().remove(path);
    }

    /// Paths of all open heaps, sorted
    pub fn open_heaps(&self) -> Vec<PathBuf> {
        self.open.lock().keys().cloned().collect()
    }

    /// Number of open heaps
    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.lock().is_empty()
    }

    /// Sum of last known record counts
    pub fn total_entries(&self) -> usize {
        self.open.lock().values().sum()
    }
}
