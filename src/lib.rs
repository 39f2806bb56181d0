//! # heapstore
//!
//! Append-mostly BLOB storage for fixed-length keys:
//! - Single-file heaps with an in-memory key index and free-space reuse
//! - Fingerprinted index dumps for fast reopening
//! - Time-rotated shard arrays with retention limits
//! - Merge compaction of shards with pluggable payload merging
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        HeapArray                             │
//! │        (rotation, eviction, fan-out lookups, mount)          │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ one per shard
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌──────────────┐
//!   │    Heap     │          │ HeapModifier │
//!   │ (writable)  │          │ (read-only)  │
//!   └──────┬──────┘          └──────┬───────┘
//!          └────────────┬───────────┘
//!                       ▼
//!   ┌──────────────────────────────────────────────┐
//!   │ HeapCore: RecordIndex + Gap + record file     │
//!   └──────────────────────────────────────────────┘
//!
//!   MergeCompactor: HeapReader × 2 ──► HeapWriter ──► mounted shard
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod memory;
pub mod order;
pub mod registry;

pub mod array;
pub mod heap;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use array::{ContainerMerge, HeapArray, MergeCompactor, PostingsMerge, PreferNewer};
pub use config::{ArrayConfig, HeapConfig};
pub use error::{HeapError, Result};
pub use heap::{BlobStore, Heap, HeapModifier, HeapReader, HeapWriter};
pub use memory::MemoryBudget;
pub use order::KeyOrder;
pub use registry::HeapRegistry;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of heapstore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
