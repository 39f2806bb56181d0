//! Configuration for heapstore
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{HeapError, Result};
use crate::memory::MemoryBudget;
use crate::order::KeyOrder;
use crate::registry::HeapRegistry;

/// One month, the default age at which a shard stops taking writes
pub const ONE_MONTH: Duration = Duration::from_millis(1000 * 60 * 60 * 24 * 365 / 12);

/// Largest shard file size the record format can address comfortably
pub const MAX_FILE_SIZE: u64 = i32::MAX as u64;

/// Configuration for a single heap file
#[derive(Debug, Clone)]
pub struct HeapConfig {
    // -------------------------------------------------------------------------
    // Record Layout
    // -------------------------------------------------------------------------
    /// Fixed key length of every record
    pub keylength: usize,

    /// Order of keys in the index
    pub order: KeyOrder,

    // -------------------------------------------------------------------------
    // Write Buffer
    // -------------------------------------------------------------------------
    /// Bytes of payload buffered before one sequential append (0 = unbuffered)
    pub buffer_size: usize,

    // -------------------------------------------------------------------------
    // Shared Services
    // -------------------------------------------------------------------------
    /// Budget consulted before payload reads
    pub budget: Arc<MemoryBudget>,

    /// Registry of open heaps, if the process keeps one
    pub registry: Option<Arc<HeapRegistry>>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            keylength: 12,
            order: KeyOrder::Natural,
            buffer_size: 512 * 1024, // 512 KB
            budget: Arc::new(MemoryBudget::unlimited()),
            registry: None,
        }
    }
}

impl HeapConfig {
    /// Create a new config builder
    pub fn builder() -> HeapConfigBuilder {
        HeapConfigBuilder::default()
    }

    /// Config with the given key layout and defaults otherwise
    pub fn with_key(keylength: usize, order: KeyOrder) -> Self {
        Self {
            keylength,
            order,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.keylength == 0 {
            return Err(HeapError::Config("keylength must be at least 1".to_string()));
        }
        if self.keylength > i32::MAX as usize {
            return Err(HeapError::Config(format!(
                "keylength {} exceeds the record length field",
                self.keylength
            )));
        }
        Ok(())
    }
}

/// Builder for HeapConfig
#[derive(Default)]
pub struct HeapConfigBuilder {
    config: HeapConfig,
}

impl HeapConfigBuilder {
    /// Set the fixed key length
    pub fn keylength(mut self, keylength: usize) -> Self {
        self.config.keylength = keylength;
        self
    }

    /// Set the key order
    pub fn order(mut self, order: KeyOrder) -> Self {
        self.config.order = order;
        self
    }

    /// Set the write buffer size (in bytes)
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Share a memory budget
    pub fn budget(mut self, budget: Arc<MemoryBudget>) -> Self {
        self.config.budget = budget;
        self
    }

    /// Share a registry of open heaps
    pub fn registry(mut self, registry: Arc<HeapRegistry>) -> Self {
        self.config.registry = Some(registry);
        self
    }

    pub fn build(self) -> HeapConfig {
        self.config
    }
}

/// Configuration for a directory of heap shards
#[derive(Debug, Clone)]
pub struct ArrayConfig {
    // -------------------------------------------------------------------------
    // Location
    // -------------------------------------------------------------------------
    /// Directory holding all shard files of the array
    /// Internal structure:
    ///   {dir}/
    ///     ├── {prefix}.{yyyyMMddHHmmssSSS}.blob         (shard)
    ///     └── {shard}.{fingerprint}.idx / .gap          (transient dumps)
    pub dir: PathBuf,

    /// File name prefix of every shard
    pub prefix: String,

    // -------------------------------------------------------------------------
    // Shard Configuration
    // -------------------------------------------------------------------------
    /// Settings passed to every shard heap
    pub heap: HeapConfig,

    /// Age after which the newest shard stops taking writes
    pub file_age_limit: Duration,

    /// Size after which the newest shard stops taking writes
    pub file_size_limit: u64,

    // -------------------------------------------------------------------------
    // Retention
    // -------------------------------------------------------------------------
    /// Shards older than this (beyond `file_age_limit`) are deleted
    pub repository_age_max: Duration,

    /// Oldest shards are deleted while the array is larger than this
    pub repository_size_max: u64,

    // -------------------------------------------------------------------------
    // Open Behaviour
    // -------------------------------------------------------------------------
    /// Open every shard read-only, even the newest
    pub trim_all: bool,

    /// Delete shard files that cannot be opened instead of failing
    pub delete_on_fail: bool,

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------
    /// Maximum worker threads for concurrent shard lookups
    pub lookup_workers: usize,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./heapstore_data"),
            prefix: "blob".to_string(),
            heap: HeapConfig::default(),
            file_age_limit: ONE_MONTH,
            file_size_limit: MAX_FILE_SIZE,
            repository_age_max: Duration::MAX,
            repository_size_max: u64::MAX,
            trim_all: false,
            delete_on_fail: true,
            lookup_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

impl ArrayConfig {
    /// Create a new config builder
    pub fn builder() -> ArrayConfigBuilder {
        ArrayConfigBuilder::default()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.heap.validate()?;
        if self.prefix.is_empty() || self.prefix.contains(['/', '\\']) {
            return Err(HeapError::Config(format!(
                "invalid shard prefix {:?}",
                self.prefix
            )));
        }
        if self.lookup_workers == 0 {
            return Err(HeapError::Config(
                "lookup_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for ArrayConfig
#[derive(Default)]
pub struct ArrayConfigBuilder {
    config: ArrayConfig,
}

impl ArrayConfigBuilder {
    /// Set the array directory
    pub fn dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.dir = path.into();
        self
    }

    /// Set the shard file prefix
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    /// Set the per-shard heap configuration
    pub fn heap(mut self, heap: HeapConfig) -> Self {
        self.config.heap = heap;
        self
    }

    /// Set the fixed key length of every shard
    pub fn keylength(mut self, keylength: usize) -> Self {
        self.config.heap.keylength = keylength;
        self
    }

    /// Set the key order of every shard
    pub fn order(mut self, order: KeyOrder) -> Self {
        self.config.heap.order = order;
        self
    }

    /// Set the write buffer size of the writable shard
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.heap.buffer_size = size;
        self
    }

    /// Set the age at which a new shard is started
    pub fn file_age_limit(mut self, limit: Duration) -> Self {
        self.config.file_age_limit = limit;
        self
    }

    /// Set the size at which a new shard is started
    pub fn file_size_limit(mut self, limit: u64) -> Self {
        self.config.file_size_limit = limit;
        self
    }

    /// Set the maximum age of retained shards
    pub fn repository_age_max(mut self, max: Duration) -> Self {
        self.config.repository_age_max = max;
        self
    }

    /// Set the maximum total size of retained shards
    pub fn repository_size_max(mut self, max: u64) -> Self {
        self.config.repository_size_max = max;
        self
    }

    /// Open every shard read-only
    pub fn trim_all(mut self, trim_all: bool) -> Self {
        self.config.trim_all = trim_all;
        self
    }

    /// Delete unreadable shards at open
    pub fn delete_on_fail(mut self, delete: bool) -> Self {
        self.config.delete_on_fail = delete;
        self
    }

    /// Set the lookup worker limit
    pub fn lookup_workers(mut self, workers: usize) -> Self {
        self.config.lookup_workers = workers;
        self
    }

    pub fn build(self) -> ArrayConfig {
        self.config
    }
}
