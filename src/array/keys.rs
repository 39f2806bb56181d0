//! Merged Keys
//!
//! K-way merge of per-shard key iterators into one ordered stream.
//!
//! Every source is already ordered. The next key of each source sits in a
//! binary heap keyed by its sort key; keys present in several shards are
//! emitted once.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::heap::KeyIter;
use crate::order::KeyOrder;

/// Pending key from one source
struct Pending {
    sort_key: Vec<u8>,
    key: Vec<u8>,
    source: usize,
    up: bool,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest: ascending merges reverse the key order
        let by_key = if self.up {
            other.sort_key.cmp(&self.sort_key)
        } else {
            self.sort_key.cmp(&other.sort_key)
        };
        by_key.then_with(|| other.source.cmp(&self.source))
    }
}

/// Ordered, duplicate-free union of several key iterators
pub struct MergedKeys {
    sources: Vec<KeyIter>,
    heap: BinaryHeap<Pending>,
    order: KeyOrder,
    up: bool,
}

impl MergedKeys {
    /// Merge `sources`, each ordered by `order` in direction `up`
    pub fn new(sources: Vec<KeyIter>, order: KeyOrder, up: bool) -> Self {
        let mut merged = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            order,
            up,
        };
        for source in 0..merged.sources.len() {
            merged.advance(source);
        }
        merged
    }

    /// Pull the next key of `source` into the heap
    fn advance(&mut self, source: usize) {
        if let Some(key) = self.sources[source].next() {
            self.heap.push(Pending {
                sort_key: self.order.sort_key(&key).into_owned(),
                key,
                source,
                up: self.up,
            });
        }
    }
}

impl Iterator for MergedKeys {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        let top = self.heap.pop()?;
        self.advance(top.source);

        // Drop the same key from other shards
        while let Some(peek) = self.heap.peek() {
            if peek.sort_key != top.sort_key {
                break;
            }
            if let Some(dup) = self.heap.pop() {
                self.advance(dup.source);
            }
        }
        Some(top.key)
    }
}
