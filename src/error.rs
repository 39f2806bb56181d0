//! Error types for heapstore
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using HeapError
pub type Result<T> = std::result::Result<T, HeapError>;

/// Unified error type for heapstore operations
#[derive(Debug, Error)]
pub enum HeapError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Structural Errors
    // -------------------------------------------------------------------------
    /// Index and file disagreed; the index has been rebuilt
    #[error("Heap corruption detected: {0}")]
    Corruption(String),

    /// Index or gap dump could not be decoded or failed its checksum
    #[error("Dump error: {0}")]
    Dump(String),

    // -------------------------------------------------------------------------
    // Resource Errors
    // -------------------------------------------------------------------------
    /// Not enough memory budget to materialize a payload (transient)
    #[error("Resource exhausted: {requested} bytes requested")]
    ResourceExhausted { requested: usize },

    // -------------------------------------------------------------------------
    // Precondition Violations
    // -------------------------------------------------------------------------
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Rewritten payload grew from {old} to {new} bytes")]
    PayloadGrowth { old: usize, new: usize },

    #[error("Precondition violated: {0}")]
    Precondition(String),

    // -------------------------------------------------------------------------
    // Input Errors
    // -------------------------------------------------------------------------
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Record too large: {0} bytes")]
    RecordTooLarge(usize),

    // -------------------------------------------------------------------------
    // State Errors
    // -------------------------------------------------------------------------
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Heap is closed: {0}")]
    Closed(String),

    #[error("Lookup interrupted: {0}")]
    LookupInterrupted(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for HeapError {
    fn from(e: bincode::Error) -> Self {
        HeapError::Dump(e.to_string())
    }
}

impl HeapError {
    /// True for failures that may succeed when retried later
    pub fn is_transient(&self) -> bool {
        matches!(self, HeapError::ResourceExhausted { .. })
    }
}
