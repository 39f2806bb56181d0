//! Heap Module
//!
//! Single-file BLOB stores with an in-memory key index.
//!
//! ## File Format
//! A heap file is a plain sequence of records, no header, no footer:
//! ```text
//! ┌──────────────┬──────────────────────┬─────────────────────────────┐
//! │ reclen (4)   │ key (keylength)      │ payload (reclen - keylength)│
//! │ i32 BE       │ first byte 0 = free  │                             │
//! └──────────────┴──────────────────────┴─────────────────────────────┘
//! ```
//! `reclen` does not count its own four bytes. Free records keep their
//! length so the file can still be walked, and their ranges are handed out
//! again by the gap allocator.
//!
//! ## Types
//! - [`HeapWriter`]: builds a new heap file from keys in ascending order
//! - [`HeapReader`]: read access through the index
//! - [`HeapModifier`]: reader plus `remove` and `replace`
//! - [`Heap`]: modifier plus `put` and a write buffer
//!
//! The index and the gap list are rebuilt by scanning the file at open,
//! unless a fingerprinted dump written at the last close matches the file.

mod core;
pub mod dump;
pub mod gap;
#[allow(clippy::module_inception)]
pub mod heap;
pub mod index;
pub mod iterator;
pub mod modifier;
pub mod reader;
pub(crate) mod record;
pub mod writer;

pub use dump::fingerprint;
pub use gap::Gap;
pub use heap::Heap;
pub use index::RecordIndex;
pub use iterator::{HeapEntries, RotatingKeys};
pub use modifier::HeapModifier;
pub use reader::HeapReader;
pub use writer::HeapWriter;

use crate::error::Result;
use crate::order::KeyOrder;

/// Size of the record length prefix
pub(crate) const LENGTH_PREFIX: u64 = 4;

/// First key byte of a free record
pub(crate) const EMPTY_MARKER: u8 = 0;

/// Index and gap dumps are only written above this many entries
pub(crate) const DUMP_THRESHOLD: usize = 3;

/// Owned key iterator returned by `keys` operations
pub type KeyIter = Box<dyn Iterator<Item = Vec<u8>> + Send>;

/// Common surface of single heaps and heap arrays
pub trait BlobStore: Send + Sync {
    /// Display name (file or directory name)
    fn name(&self) -> String;

    /// Fixed key length
    fn keylength(&self) -> usize;

    /// Key order of the index
    fn order(&self) -> KeyOrder;

    /// Remove every record
    fn clear(&self) -> Result<()>;

    /// Number of stored keys
    fn size(&self) -> usize;

    /// Keys in ascending (`up`) or descending order, starting at `from`
    ///
    /// The iterator is a snapshot taken at call time. Keys put or removed
    /// afterwards are not reflected, and the whole key range is held in
    /// memory until the iterator is dropped.
    fn keys(&self, up: bool, from: Option<&[u8]>) -> Result<KeyIter>;

    fn has(&self, key: &[u8]) -> Result<bool>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Payload length, or -1 if the key is absent
    fn length(&self, key: &[u8]) -> Result<i64>;

    fn put(&self, key: &[u8], payload: &[u8]) -> Result<()>;

    /// Rewrite a payload in place; returns the number of bytes saved
    fn replace(
        &self,
        key: &[u8],
        rewriter: &mut dyn FnMut(&[u8]) -> Result<Vec<u8>>,
    ) -> Result<usize>;

    fn remove(&self, key: &[u8]) -> Result<()>;

    /// Flush and release the store, optionally dumping its index
    fn close(&self, write_dump: bool) -> Result<()>;
}
