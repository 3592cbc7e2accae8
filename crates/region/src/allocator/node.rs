//! Memory nodes: one block plus its bump cursor
//!
//! The header lives outside the block, so the whole block is usable space
//! and the node can move between free lists and pool chains by value.
//!
//! ## Invariants
//!
//! - `first_avail <= end`, and `end == size_class * BOUNDARY_SIZE`
//! - Bytes in `[0, first_avail)` belong to whoever owns the node

use std::fmt;
use std::ptr::NonNull;

use crate::core::boundary::BOUNDARY_INDEX;

/// A block obtained from the system heap
pub struct MemoryNode {
    block: NonNull<u8>,
    size_class: u32,
    free_index: u32,
    first_avail: usize,
    end: usize,
}

// SAFETY: a node is the unique owner of its block; moving it between
// threads moves that ownership
unsafe impl Send for MemoryNode {}

impl MemoryNode {
    pub(crate) fn new(block: NonNull<u8>, size_class: u32, size: usize) -> Self {
        Self {
            block,
            size_class,
            free_index: 0,
            first_avail: 0,
            end: size,
        }
    }

    /// Block size in boundary units
    #[inline]
    pub fn size_class(&self) -> u32 {
        self.size_class
    }

    /// Whole boundary units still free, as of the last time the node left
    /// the active position
    #[inline]
    pub fn free_index(&self) -> u32 {
        self.free_index
    }

    pub(crate) fn set_free_index(&mut self, free_index: u32) {
        self.free_index = free_index;
    }

    /// Recompute `free_index` from the remaining space
    pub(crate) fn refresh_free_index(&mut self) -> u32 {
        self.free_index = u32::try_from(self.remaining() >> BOUNDARY_INDEX).unwrap_or(u32::MAX);
        self.free_index
    }

    /// Total block size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.end
    }

    /// Bytes handed out so far
    #[inline]
    pub fn used(&self) -> usize {
        self.first_avail
    }

    /// Bytes between the cursor and the end of the block
    #[inline]
    pub fn remaining(&self) -> usize {
        self.end - self.first_avail
    }

    /// Start of the block
    #[inline]
    pub fn start(&self) -> NonNull<u8> {
        self.block
    }

    /// Next free byte
    #[inline]
    pub fn first_avail(&self) -> NonNull<u8> {
        // SAFETY: first_avail <= end, so the result is in bounds or one past the end
        unsafe { self.block.add(self.first_avail) }
    }

    /// Hand out `size` bytes from the cursor
    ///
    /// The caller checked `size <= remaining()`.
    #[inline]
    pub(crate) fn bump(&mut self, size: usize) -> NonNull<u8> {
        debug_assert!(size <= self.remaining());
        let ptr = self.first_avail();
        self.first_avail += size;
        ptr
    }

    /// Forget everything handed out
    #[inline]
    pub(crate) fn reset(&mut self) {
        self.first_avail = 0;
    }

    /// Whether `ptr` points into the used part of the block
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.block.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.first_avail
    }
}

impl fmt::Debug for MemoryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNode")
            .field("start", &self.block)
            .field("size_class", &self.size_class)
            .field("free_index", &self.free_index)
            .field("used", &self.first_avail)
            .field("size", &self.end)
            .finish()
    }
}
