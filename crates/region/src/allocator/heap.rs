//! System heap seam
//!
//! The allocator never calls the global allocator directly; it goes through
//! a [`SystemHeap`], so tests and embedders can count, cap or fail block
//! requests.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::core::alignment::BLOCK_ALIGN;
use crate::error::{MemoryError, MemoryResult};

/// Source of raw blocks
pub trait SystemHeap: Send + Sync {
    /// Obtain `size` bytes aligned to [`BLOCK_ALIGN`]
    fn alloc(&self, size: usize) -> MemoryResult<NonNull<u8>>;

    /// Return a block to the heap
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc` on this heap with the same `size`, and
    /// must not have been freed already.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize);
}

fn block_layout(size: usize) -> MemoryResult<Layout> {
    if size == 0 {
        return Err(MemoryError::invalid_argument("zero-sized block"));
    }
    Layout::from_size_align(size, BLOCK_ALIGN)
        .map_err(|_| MemoryError::size_overflow("block layout"))
}

/// The process global allocator
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalHeap;

impl SystemHeap for GlobalHeap {
    fn alloc(&self, size: usize) -> MemoryResult<NonNull<u8>> {
        let layout = block_layout(size)?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr).ok_or_else(|| MemoryError::out_of_memory(size))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: the caller guarantees ptr/size came from `alloc` above,
        // which only succeeds for layouts that `block_layout` accepted
        unsafe { alloc::dealloc(ptr.as_ptr(), Layout::from_size_align_unchecked(size, BLOCK_ALIGN)) }
    }
}

/// Heap with a byte budget on top of [`GlobalHeap`]
///
/// Requests that would push the outstanding total past the limit fail with
/// `OutOfMemory`. Also counts calls, which makes it handy for observing
/// allocator recycling.
#[derive(Debug)]
pub struct BoundedHeap {
    limit: usize,
    in_use: AtomicUsize,
    allocations: AtomicU64,
    frees: AtomicU64,
}

impl BoundedHeap {
    /// Heap that refuses to hold more than `limit` bytes at once
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_use: AtomicUsize::new(0),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        }
    }

    /// Heap that only counts
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes currently handed out
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Successful `alloc` calls so far
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// `free` calls so far
    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }
}

impl SystemHeap for BoundedHeap {
    fn alloc(&self, size: usize) -> MemoryResult<NonNull<u8>> {
        let reserved = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(size).filter(|&total| total <= self.limit)
            });
        if reserved.is_err() {
            return Err(MemoryError::out_of_memory(size));
        }

        match GlobalHeap.alloc(size) {
            Ok(ptr) => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                Ok(ptr)
            }
            Err(err) => {
                self.in_use.fetch_sub(size, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: forwarded caller contract; blocks come from GlobalHeap
        unsafe { GlobalHeap.free(ptr, size) };
        self.in_use.fetch_sub(size, Ordering::AcqRel);
        self.frees.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_heap_rejects_zero() {
        assert!(GlobalHeap.alloc(0).is_err());
    }

    #[test]
    fn global_heap_blocks_are_aligned() {
        let ptr = GlobalHeap.alloc(4096).unwrap();
        assert_eq!(ptr.as_ptr() as usize % BLOCK_ALIGN, 0);
        unsafe { GlobalHeap.free(ptr, 4096) };
    }

    #[test]
    fn bounded_heap_enforces_limit() {
        let heap = BoundedHeap::new(8192);
        let first = heap.alloc(8192).unwrap();
        let err = heap.alloc(4096).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(heap.in_use(), 8192);

        unsafe { heap.free(first, 8192) };
        assert_eq!(heap.in_use(), 0);
        assert_eq!(heap.allocations(), 1);
        assert_eq!(heap.frees(), 1);
    }
}
