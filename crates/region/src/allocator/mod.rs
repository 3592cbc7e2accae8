//! Size-classed block allocator
//!
//! Hands out [`MemoryNode`]s whose size is a whole number of boundary units
//! and keeps released nodes in per-class free lists for reuse.
//!
//! ## Free lists
//!
//! Buckets `1..MAX_INDEX` hold nodes of exactly that size class. Bucket 0 is
//! the overflow sink for every class `>= MAX_INDEX`. `max_index` is the
//! highest non-empty indexed bucket, or 0 when there is none.
//!
//! ## Invariants
//!
//! - `retained_units` equals the sum of size classes across all buckets
//! - With a retention cap set, `retained_units <= cap` at all times
//!
//! ## Locking
//!
//! Free-list state sits behind an internal mutex. An optional caller-supplied
//! re-entrant mutex is additionally held for the whole of each acquire and
//! release, and while pools link or unlink children that share the allocator.

mod heap;
mod node;
mod stats;

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::{debug, trace, warn};

pub use heap::{BoundedHeap, GlobalHeap, SystemHeap};
pub use node::MemoryNode;
pub use stats::AllocatorStats;

use crate::core::AllocatorConfig;
use crate::core::boundary::{self, BOUNDARY_SIZE, MAX_INDEX};
use crate::error::{MemoryError, MemoryResult};
use crate::pool::{Pool, PoolInner};
use crate::utils::checked_align_up;
use stats::Counters;

/// Re-entrant mutex a caller can attach to an allocator or a pool
pub type PoolMutex = Arc<ReentrantMutex<()>>;

/// Unique identifier for allocators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocatorId(usize);

impl AllocatorId {
    fn next() -> Self {
        static COUNTER: AtomicUsize = AtomicUsize::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for AllocatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocator#{}", self.0)
    }
}

// ============================================================================
// Free Lists
// ============================================================================

struct FreeLists {
    buckets: [Vec<MemoryNode>; MAX_INDEX],
    max_index: usize,
    cap_units: Option<u64>,
    retained_units: u64,
}

impl FreeLists {
    fn new(cap_units: Option<u64>) -> Self {
        Self {
            buckets: std::array::from_fn(|_| Vec::new()),
            max_index: 0,
            cap_units,
            retained_units: 0,
        }
    }

    /// Most recently released node that can hold `class` units
    fn take(&mut self, class: u32) -> Option<MemoryNode> {
        let index = class as usize;
        let node = if index <= self.max_index {
            let found = (index..=self.max_index).find(|&i| !self.buckets[i].is_empty())?;
            let node = self.buckets[found].pop()?;
            if found == self.max_index {
                self.shrink_max_index();
            }
            node
        } else {
            let sink = &mut self.buckets[0];
            let position = sink.iter().rposition(|node| node.size_class() >= class)?;
            sink.remove(position)
        };
        self.retained_units -= u64::from(node.size_class());
        Some(node)
    }

    fn shrink_max_index(&mut self) {
        while self.max_index > 0 && self.buckets[self.max_index].is_empty() {
            self.max_index -= 1;
        }
    }

    fn admits(&self, class: u32) -> bool {
        self.cap_units
            .is_none_or(|cap| self.retained_units + u64::from(class) <= cap)
    }

    fn store(&mut self, node: MemoryNode) {
        let class = node.size_class();
        let index = class as usize;
        if index < MAX_INDEX {
            self.buckets[index].push(node);
            self.max_index = self.max_index.max(index);
        } else {
            self.buckets[0].push(node);
        }
        self.retained_units += u64::from(class);
    }

    /// Evict nodes, largest first, until the cap holds again
    fn trim(&mut self) -> Vec<MemoryNode> {
        let mut excess = Vec::new();
        let Some(cap) = self.cap_units else {
            return excess;
        };
        while self.retained_units > cap {
            let node = if let Some(node) = self.buckets[0].pop() {
                node
            } else if let Some(node) = self.buckets[self.max_index].pop() {
                self.shrink_max_index();
                node
            } else {
                break;
            };
            self.retained_units -= u64::from(node.size_class());
            excess.push(node);
        }
        excess
    }

    fn drain(&mut self) -> Vec<MemoryNode> {
        self.max_index = 0;
        self.retained_units = 0;
        self.buckets.iter_mut().flat_map(|bucket| bucket.drain(..)).collect()
    }

    fn node_count(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}

fn cap_units(bytes: usize) -> u64 {
    checked_align_up(bytes, BOUNDARY_SIZE)
        .map_or(u64::MAX, |aligned| boundary::units(aligned) as u64)
}

// ============================================================================
// Allocator
// ============================================================================

/// Recycles fixed-granularity blocks for pools
///
/// Shared between pools through `Arc`. One pool may be registered as the
/// owner; destroying that pool destroys the allocator.
pub struct Allocator {
    id: AllocatorId,
    heap: Arc<dyn SystemHeap>,
    min_block_size: usize,
    lists: Mutex<FreeLists>,
    mutex: RwLock<Option<PoolMutex>>,
    owner: Mutex<Weak<PoolInner>>,
    destroyed: AtomicBool,
    counters: Counters,
}

impl Allocator {
    /// Allocator with default config on the global heap
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(AllocatorConfig::default(), Arc::new(GlobalHeap)))
    }

    /// Allocator with the given config on the global heap
    pub fn with_config(config: AllocatorConfig) -> MemoryResult<Arc<Self>> {
        Self::with_heap(config, Arc::new(GlobalHeap))
    }

    /// Allocator drawing blocks from `heap`
    pub fn with_heap(config: AllocatorConfig, heap: Arc<dyn SystemHeap>) -> MemoryResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self::build(config, heap)))
    }

    fn build(config: AllocatorConfig, heap: Arc<dyn SystemHeap>) -> Self {
        let min_block_size = config.min_block_size;
        let allocator = Self {
            id: AllocatorId::next(),
            heap,
            min_block_size,
            lists: Mutex::new(FreeLists::new(config.retention_cap.map(cap_units))),
            mutex: RwLock::new(None),
            owner: Mutex::new(Weak::new()),
            destroyed: AtomicBool::new(false),
            counters: Counters::default(),
        };
        debug!(
            allocator = %allocator.id,
            min_block_size,
            retention_cap = ?config.retention_cap,
            "allocator created"
        );
        allocator
    }

    pub fn id(&self) -> AllocatorId {
        self.id
    }

    /// Smallest block this allocator hands out
    pub fn min_block_size(&self) -> usize {
        self.min_block_size
    }

    /// Block size and size class for a request of `size` usable bytes
    pub fn block_size_for(&self, size: usize) -> MemoryResult<(usize, u32)> {
        let size = checked_align_up(size, BOUNDARY_SIZE)
            .ok_or_else(|| MemoryError::size_overflow("block size"))?
            .max(self.min_block_size);
        let class = u32::try_from(boundary::units(size))
            .map_err(|_| MemoryError::size_overflow("size class"))?;
        Ok((size, class))
    }

    /// Get a node with at least `size` usable bytes
    ///
    /// Reuses the most recently released node of a sufficient class when
    /// there is one; otherwise asks the system heap.
    pub fn acquire(&self, size: usize) -> MemoryResult<MemoryNode> {
        if self.is_destroyed() {
            return Err(MemoryError::logic("allocator has been destroyed"));
        }
        let (size, class) = self.block_size_for(size)?;

        let mutex = self.mutex();
        let _serial = mutex.as_ref().map(|m| m.lock());

        let recycled = self.lists.lock().take(class);
        if let Some(mut node) = recycled {
            node.reset();
            node.set_free_index(0);
            self.counters.recycle();
            trace!(allocator = %self.id, class, got = node.size_class(), "node recycled");
            return Ok(node);
        }

        let block = self.heap.alloc(size)?;
        self.counters.heap_alloc();
        trace!(allocator = %self.id, class, size, "node allocated");
        Ok(MemoryNode::new(block, class, size))
    }

    /// Hand nodes back as one batch
    ///
    /// Nodes that would push the retained total past the cap go straight
    /// back to the system heap, after the free lists are unlocked.
    pub fn release<I>(&self, nodes: I)
    where
        I: IntoIterator<Item = MemoryNode>,
    {
        let mutex = self.mutex();
        let _serial = mutex.as_ref().map(|m| m.lock());

        let mut overflow = Vec::new();
        {
            let mut lists = self.lists.lock();
            let destroyed = self.is_destroyed();
            for node in nodes {
                if destroyed || !lists.admits(node.size_class()) {
                    overflow.push(node);
                } else {
                    lists.store(node);
                }
            }
        }
        self.free_nodes(overflow);
    }

    /// Change the retention cap; `None` retains everything
    ///
    /// Lowering the cap evicts retained nodes until the new cap holds.
    pub fn set_retention_cap(&self, bytes: Option<usize>) {
        let excess = {
            let mut lists = self.lists.lock();
            lists.cap_units = bytes.map(cap_units);
            lists.trim()
        };
        if excess.is_empty() {
            debug!(allocator = %self.id, cap = ?bytes, "retention cap changed");
        } else {
            warn!(allocator = %self.id, cap = ?bytes, evicted = excess.len(), "retention cap lowered below retained memory");
        }
        self.free_nodes(excess);
    }

    /// Current cap, in bytes
    pub fn retention_cap(&self) -> Option<u64> {
        self.lists
            .lock()
            .cap_units
            .map(|units| units.saturating_mul(BOUNDARY_SIZE as u64))
    }

    /// Attach or detach the caller-supplied mutex
    pub fn set_mutex(&self, mutex: Option<PoolMutex>) {
        *self.mutex.write() = mutex;
    }

    pub fn mutex(&self) -> Option<PoolMutex> {
        self.mutex.read().clone()
    }

    /// Register the pool whose destruction also destroys this allocator
    pub fn set_owner(&self, pool: Option<&Pool>) {
        *self.owner.lock() = pool.map_or_else(Weak::new, Pool::downgrade_inner);
    }

    pub fn owner(&self) -> Option<Pool> {
        self.owner.lock().upgrade().map(Pool::from_inner)
    }

    pub(crate) fn is_owned_by(&self, pool: &PoolInner) -> bool {
        std::ptr::eq(self.owner.lock().as_ptr(), pool)
    }

    /// Free every retained node; later acquisitions fail
    pub fn destroy(&self) {
        let retained = {
            let mut lists = self.lists.lock();
            self.destroyed.store(true, Ordering::Release);
            lists.drain()
        };
        debug!(allocator = %self.id, freed = retained.len(), "allocator destroyed");
        self.free_nodes(retained);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> AllocatorStats {
        let lists = self.lists.lock();
        self.counters.snapshot(lists.retained_units, lists.node_count())
    }

    /// One block straight from the system heap, bypassing the free lists
    pub(crate) fn heap_alloc(&self, size: usize) -> MemoryResult<NonNull<u8>> {
        let block = self.heap.alloc(size)?;
        self.counters.heap_alloc();
        Ok(block)
    }

    /// # Safety
    ///
    /// `ptr` and `size` must come from [`Self::heap_alloc`] on this allocator.
    pub(crate) unsafe fn heap_free(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: forwarded caller contract
        unsafe { self.heap.free(ptr, size) };
        self.counters.heap_free();
    }

    fn free_nodes(&self, nodes: Vec<MemoryNode>) {
        for node in nodes {
            trace!(allocator = %self.id, class = node.size_class(), "node freed");
            // SAFETY: every node was built in `acquire` from a block of
            // exactly `node.size()` bytes obtained from `self.heap`
            unsafe { self.heap_free(node.start(), node.size()) };
        }
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        let retained = self.lists.get_mut().drain();
        self.free_nodes(retained);
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("id", &self.id)
            .field("min_block_size", &self.min_block_size)
            .field("destroyed", &self.is_destroyed())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;

    fn counted(cap: Option<usize>) -> (Arc<Allocator>, Arc<BoundedHeap>) {
        let heap = Arc::new(BoundedHeap::unbounded());
        let config = AllocatorConfig {
            retention_cap: cap,
            ..AllocatorConfig::default()
        };
        let allocator = Allocator::with_heap(config, heap.clone()).unwrap();
        (allocator, heap)
    }

    #[test]
    fn requests_round_to_boundary_and_minimum() {
        let allocator = Allocator::new();
        assert_eq!(allocator.block_size_for(0).unwrap(), (8192, 2));
        assert_eq!(allocator.block_size_for(100).unwrap(), (8192, 2));
        assert_eq!(allocator.block_size_for(9000).unwrap(), (12288, 3));

        let node = allocator.acquire(9000).unwrap();
        assert_eq!(node.size(), 12288);
        assert!(node.remaining() >= 9000);
        allocator.release([node]);
    }

    #[test]
    fn oversized_request_is_out_of_memory() {
        let allocator = Allocator::new();
        let err = allocator.acquire(usize::MAX).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    }

    #[test]
    fn released_node_is_reused() {
        let (allocator, heap) = counted(None);
        let node = allocator.acquire(100).unwrap();
        let start = node.start();
        allocator.release([node]);

        let again = allocator.acquire(200).unwrap();
        assert_eq!(again.start(), start);
        assert_eq!(again.used(), 0);
        assert_eq!(heap.allocations(), 1);
        assert_eq!(allocator.stats().recycled, 1);
        allocator.release([again]);
    }

    #[test]
    fn larger_bucket_serves_smaller_request() {
        let (allocator, _heap) = counted(None);
        let big = allocator.acquire(4 * BOUNDARY_SIZE).unwrap();
        assert_eq!(big.size_class(), 4);
        allocator.release([big]);

        let node = allocator.acquire(100).unwrap();
        assert_eq!(node.size_class(), 4);
        assert_eq!(allocator.lists.lock().max_index, 0);
        allocator.release([node]);
    }

    #[test]
    fn max_index_tracks_highest_bucket() {
        let (allocator, _heap) = counted(None);
        let small = allocator.acquire(BOUNDARY_SIZE).unwrap();
        let large = allocator.acquire(3 * BOUNDARY_SIZE).unwrap();
        allocator.release([small, large]);
        assert_eq!(allocator.lists.lock().max_index, 3);

        let taken = allocator.acquire(3 * BOUNDARY_SIZE).unwrap();
        assert_eq!(allocator.lists.lock().max_index, 2);
        allocator.release([taken]);
    }

    #[test]
    fn huge_nodes_go_through_the_sink() {
        let (allocator, heap) = counted(None);
        let huge = allocator.acquire(MAX_INDEX * BOUNDARY_SIZE + 1).unwrap();
        assert_eq!(huge.size_class() as usize, MAX_INDEX + 1);
        allocator.release([huge]);
        assert_eq!(allocator.lists.lock().buckets[0].len(), 1);

        let reused = allocator.acquire(MAX_INDEX * BOUNDARY_SIZE).unwrap();
        assert_eq!(reused.size_class() as usize, MAX_INDEX + 1);
        assert_eq!(heap.allocations(), 1);
        allocator.release([reused]);
    }

    #[test]
    fn retention_cap_frees_excess() {
        let (allocator, heap) = counted(Some(16384));
        let nodes: Vec<_> = (0..3).map(|_| allocator.acquire(0).unwrap()).collect();
        allocator.release(nodes);

        let stats = allocator.stats();
        assert_eq!(stats.retained_nodes, 2);
        assert_eq!(stats.retained_units, 4);
        assert_eq!(heap.frees(), 1);
    }

    #[test]
    fn lowering_cap_evicts_immediately() {
        let (allocator, heap) = counted(None);
        let nodes: Vec<_> = (0..4).map(|_| allocator.acquire(0).unwrap()).collect();
        allocator.release(nodes);
        assert_eq!(allocator.stats().retained_units, 8);

        allocator.set_retention_cap(Some(BOUNDARY_SIZE * 3));
        let stats = allocator.stats();
        assert!(stats.retained_units <= 3);
        assert_eq!(stats.retained_nodes, 1);
        assert_eq!(heap.frees(), 3);
    }

    #[test]
    fn zero_cap_retains_nothing() {
        let (allocator, heap) = counted(Some(0));
        let node = allocator.acquire(0).unwrap();
        allocator.release([node]);
        assert_eq!(allocator.stats().retained_nodes, 0);
        assert_eq!(heap.in_use(), 0);
    }

    #[test]
    fn destroyed_allocator_refuses_and_frees() {
        let (allocator, heap) = counted(None);
        let kept = allocator.acquire(0).unwrap();
        let retained = allocator.acquire(0).unwrap();
        allocator.release([retained]);

        allocator.destroy();
        assert_eq!(heap.in_use(), 8192);
        assert_eq!(
            allocator.acquire(0).unwrap_err().kind(),
            ErrorKind::LogicError
        );

        allocator.release([kept]);
        assert_eq!(heap.in_use(), 0);
    }

    #[test]
    fn drop_returns_retained_blocks() {
        let heap = Arc::new(BoundedHeap::unbounded());
        {
            let allocator = Allocator::with_heap(AllocatorConfig::default(), heap.clone()).unwrap();
            let nodes: Vec<_> = (0..3).map(|_| allocator.acquire(0).unwrap()).collect();
            allocator.release(nodes);
        }
        assert_eq!(heap.in_use(), 0);
        assert_eq!(heap.frees(), 3);
    }

    #[test]
    fn caller_mutex_is_reentrant_around_calls() {
        let allocator = Allocator::new();
        let mutex: PoolMutex = Arc::new(ReentrantMutex::new(()));
        allocator.set_mutex(Some(mutex.clone()));

        let _held = mutex.lock();
        let node = allocator.acquire(0).unwrap();
        allocator.release([node]);
        assert!(allocator.mutex().is_some());
    }
}
