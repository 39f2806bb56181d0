//! Memory Budget
//!
//! Guards large payload allocations.
//!
//! Heaps reserve the size of a payload from a shared budget before reading
//! it. When the budget cannot hold the request the read is refused with
//! `ResourceExhausted` instead of risking an out-of-memory abort; callers
//! treat that as a transient miss.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{HeapError, Result};

/// Shared budget for in-flight payload reads
#[derive(Debug)]
pub struct MemoryBudget {
    /// Maximum bytes reserved at the same time
    limit: usize,
    /// Bytes currently reserved
    in_use: AtomicUsize,
}

impl MemoryBudget {
    /// Budget that refuses requests once `limit` bytes are reserved
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Budget that never refuses
    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    /// Bytes that can still be reserved
    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.in_use.load(Ordering::Acquire))
    }

    /// Whether a request of `bytes` would currently succeed
    pub fn can_allocate(&self, bytes: usize) -> bool {
        bytes <= self.available()
    }

    /// Reserve `bytes` until the returned guard is dropped
    pub fn reserve(&self, bytes: usize) -> Result<Reservation<'_>> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let next = current
                .checked_add(bytes)
                .filter(|&n| n <= self.limit)
                .ok_or(HeapError::ResourceExhausted { requested: bytes })?;
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(Reservation {
                        budget: self,
                        bytes,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Reserved bytes, released on drop
#[derive(Debug)]
pub struct Reservation<'a> {
    budget: &'a MemoryBudget,
    bytes: usize,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.budget.in_use.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}
