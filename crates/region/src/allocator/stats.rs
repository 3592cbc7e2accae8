//! Allocator counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of an allocator's activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Blocks obtained from the system heap
    pub heap_allocs: u64,
    /// Blocks returned to the system heap
    pub heap_frees: u64,
    /// Requests served from the free lists
    pub recycled: u64,
    /// Sum of the size classes sitting in the free lists
    pub retained_units: u64,
    /// Number of nodes sitting in the free lists
    pub retained_nodes: usize,
}

impl AllocatorStats {
    /// Blocks currently out of the heap, retained or in use
    pub fn live_blocks(&self) -> u64 {
        self.heap_allocs.saturating_sub(self.heap_frees)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    heap_allocs: AtomicU64,
    heap_frees: AtomicU64,
    recycled: AtomicU64,
}

impl Counters {
    pub(crate) fn heap_alloc(&self) {
        self.heap_allocs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn heap_free(&self) {
        self.heap_frees.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn recycle(&self) {
        self.recycled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, retained_units: u64, retained_nodes: usize) -> AllocatorStats {
        AllocatorStats {
            heap_allocs: self.heap_allocs.load(Ordering::Relaxed),
            heap_frees: self.heap_frees.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            retained_units,
            retained_nodes,
        }
    }
}
