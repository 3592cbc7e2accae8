//! Pool allocation backends
//!
//! A pool keeps its memory in a [`BlockStore`]. [`NodeStore`] bump-allocates
//! from nodes borrowed from the allocator; the instrumented store in
//! [`super::tracked`] makes one heap call per allocation.

use std::fmt;
use std::ptr::NonNull;

use super::chain::NodeChain;
use super::format::{self, PoolStr};
use super::tracked::TrackedStore;
use crate::allocator::Allocator;
use crate::core::PoolMode;
use crate::core::alignment::DEFAULT_ALIGN;
use crate::error::{MemoryError, MemoryResult};
use crate::utils::checked_align_up;

pub(crate) trait BlockStore: Send {
    /// `size` bytes, rounded up to [`DEFAULT_ALIGN`]
    fn allocate(&mut self, allocator: &Allocator, size: usize) -> MemoryResult<NonNull<u8>>;

    fn format(&mut self, allocator: &Allocator, args: fmt::Arguments<'_>) -> MemoryResult<PoolStr>;

    /// Give back everything but the initial capacity
    fn reset(&mut self, allocator: &Allocator);

    /// Give back everything
    fn release(self: Box<Self>, allocator: &Allocator);

    fn bytes_in_use(&self) -> usize;

    fn contains(&self, ptr: *const u8) -> bool;

    /// Blocks currently held
    fn block_count(&self) -> usize;
}

pub(crate) fn open_store(
    mode: PoolMode,
    allocator: &Allocator,
    poison: Option<u8>,
) -> MemoryResult<Box<dyn BlockStore>> {
    Ok(match mode {
        PoolMode::Bump => Box::new(NodeStore::new(allocator)?),
        PoolMode::Debug => Box::new(TrackedStore::new(poison)),
    })
}

pub(crate) fn aligned_size(size: usize) -> MemoryResult<usize> {
    checked_align_up(size, DEFAULT_ALIGN).ok_or_else(|| MemoryError::size_overflow("allocation size"))
}

/// Bump allocation over a chain of allocator nodes
pub(crate) struct NodeStore {
    chain: NodeChain,
}

impl NodeStore {
    /// Starts with one minimum-size node, kept across clears
    pub(crate) fn new(allocator: &Allocator) -> MemoryResult<Self> {
        Ok(Self {
            chain: NodeChain::new(allocator.acquire(0)?),
        })
    }
}

impl BlockStore for NodeStore {
    fn allocate(&mut self, allocator: &Allocator, size: usize) -> MemoryResult<NonNull<u8>> {
        let size = aligned_size(size)?;

        if size < self.chain.active().remaining() {
            return Ok(self.chain.active_mut().bump(size));
        }

        match self.chain.take_next_if_fits(size) {
            Some(slot) => self.chain.install_active(slot),
            None => {
                let node = allocator.acquire(size)?;
                self.chain.push_active(node);
            }
        }
        Ok(self.chain.active_mut().bump(size))
    }

    fn format(&mut self, allocator: &Allocator, args: fmt::Arguments<'_>) -> MemoryResult<PoolStr> {
        format::format_into(&mut self.chain, allocator, args)
    }

    fn reset(&mut self, allocator: &Allocator) {
        let released = self.chain.reset();
        if !released.is_empty() {
            allocator.release(released);
        }
    }

    fn release(self: Box<Self>, allocator: &Allocator) {
        allocator.release(self.chain.into_nodes());
    }

    fn bytes_in_use(&self) -> usize {
        self.chain.used_bytes()
    }

    fn contains(&self, ptr: *const u8) -> bool {
        self.chain.contains(ptr)
    }

    fn block_count(&self) -> usize {
        self.chain.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::boundary::BOUNDARY_SIZE;

    #[test]
    fn allocations_are_aligned_and_sequential() {
        let allocator = Allocator::new();
        let mut store = NodeStore::new(&allocator).unwrap();
        let a = store.allocate(&allocator, 3).unwrap();
        let b = store.allocate(&allocator, 13).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 8);
        assert_eq!(store.bytes_in_use(), 24);
        assert!(store.contains(a.as_ptr()));
        Box::new(store).release(&allocator);
    }

    #[test]
    fn exact_fit_takes_a_new_node() {
        let allocator = Allocator::new();
        let mut store = NodeStore::new(&allocator).unwrap();
        let remaining = store.chain.active().remaining();
        store.allocate(&allocator, remaining).unwrap();
        assert_eq!(store.block_count(), 2);
        Box::new(store).release(&allocator);
    }

    #[test]
    fn large_request_gets_a_large_node() {
        let allocator = Allocator::new();
        let mut store = NodeStore::new(&allocator).unwrap();
        let ptr = store.allocate(&allocator, 5 * BOUNDARY_SIZE).unwrap();
        assert_eq!(store.chain.active().size_class(), 5);
        assert!(store.contains(ptr.as_ptr()));

        store.reset(&allocator);
        assert_eq!(store.block_count(), 1);
        assert_eq!(store.bytes_in_use(), 0);
        assert_eq!(allocator.stats().retained_nodes, 1);
        Box::new(store).release(&allocator);
    }

    #[test]
    fn reset_keeps_the_initial_node() {
        let allocator = Allocator::new();
        let mut store = NodeStore::new(&allocator).unwrap();
        let first = store.allocate(&allocator, 8).unwrap();
        store.reset(&allocator);
        let again = store.allocate(&allocator, 8).unwrap();
        assert_eq!(first, again);
        Box::new(store).release(&allocator);
    }
}
