//! Instrumented backend
//!
//! Every allocation is its own heap block, recorded by start address so that
//! ownership lookups are exact. On clear each block is overwritten with the
//! poison byte before it is freed, which turns use-after-clear into visibly
//! corrupt data instead of silently valid data.

use std::collections::BTreeMap;
use std::fmt;
use std::ptr::{self, NonNull};

use super::format::{self, PoolStr};
use super::storage::{BlockStore, aligned_size};
use crate::allocator::Allocator;
use crate::core::alignment::DEFAULT_ALIGN;
use crate::error::MemoryResult;

struct TrackedBlock {
    ptr: NonNull<u8>,
    size: usize,
}

pub(crate) struct TrackedStore {
    blocks: BTreeMap<usize, TrackedBlock>,
    poison: Option<u8>,
}

// SAFETY: the store exclusively owns every recorded block
unsafe impl Send for TrackedStore {}

impl TrackedStore {
    pub(crate) fn new(poison: Option<u8>) -> Self {
        Self {
            blocks: BTreeMap::new(),
            poison,
        }
    }

    fn free_all(&mut self, allocator: &Allocator) {
        for block in std::mem::take(&mut self.blocks).into_values() {
            if let Some(byte) = self.poison {
                // SAFETY: the block is live and `size` bytes long
                unsafe { ptr::write_bytes(block.ptr.as_ptr(), byte, block.size) };
            }
            // SAFETY: recorded blocks come from `heap_alloc` with this size
            unsafe { allocator.heap_free(block.ptr, block.size) };
        }
    }
}

impl BlockStore for TrackedStore {
    fn allocate(&mut self, allocator: &Allocator, size: usize) -> MemoryResult<NonNull<u8>> {
        let size = aligned_size(size)?.max(DEFAULT_ALIGN);
        let ptr = allocator.heap_alloc(size)?;
        self.blocks.insert(ptr.as_ptr().addr(), TrackedBlock { ptr, size });
        Ok(ptr)
    }

    fn format(&mut self, allocator: &Allocator, args: fmt::Arguments<'_>) -> MemoryResult<PoolStr> {
        let text = format::render(args)?;
        let ptr = self.allocate(allocator, text.len() + 1)?;
        // SAFETY: the block holds len + 1 bytes
        unsafe {
            ptr::copy_nonoverlapping(text.as_ptr(), ptr.as_ptr(), text.len());
            ptr.as_ptr().add(text.len()).write(0);
        }
        Ok(PoolStr::new(ptr, text.len()))
    }

    fn reset(&mut self, allocator: &Allocator) {
        self.free_all(allocator);
    }

    fn release(mut self: Box<Self>, allocator: &Allocator) {
        self.free_all(allocator);
    }

    fn bytes_in_use(&self) -> usize {
        self.blocks.values().map(|block| block.size).sum()
    }

    fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr.addr();
        self.blocks
            .range(..=addr)
            .next_back()
            .is_some_and(|(start, block)| addr < start + block.size)
    }

    fn block_count(&self) -> usize {
        self.blocks.len()
    }
}
