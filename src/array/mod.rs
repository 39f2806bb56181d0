//! Array Module
//!
//! A directory of heap shards named by creation time, used as one store.
//!
//! ## Responsibilities
//! - Rotate writes into a new shard by age or file size
//! - Evict the oldest shards beyond the retention limits
//! - Look keys up across shards, newest first
//! - Pick shards for compaction and mount the merged results
//!
//! ## Directory Layout
//! ```text
//! {dir}/
//! ├── {prefix}.20240101000000000.blob          read-only shard
//! ├── {prefix}.20240101000000000.blob.{fp}.idx  index dump (closed shards)
//! ├── {prefix}.20240101000000000.blob.{fp}.gap  gap dump
//! └── {prefix}.20240201000000000.blob          newest, writable shard
//! ```

mod keys;
mod merge;
mod naming;
mod shard;
mod stack;

pub use keys::MergedKeys;
pub use merge::{ContainerMerge, MergeCompactor, PostingsMerge, PreferNewer};
pub use naming::{format_timestamp, parse_shard_name, shard_file_name, BLOB_EXT};
pub use shard::{Shard, ShardItem};
pub use stack::HeapArray;
