//! Formatting straight into pool memory
//!
//! The builder writes at the active node's cursor without reserving space
//! first. When the node runs out it moves the partial string to a bigger
//! buffer: the next node in the chain once, if that node has room for twice
//! the current length, and otherwise a fresh node from the allocator. Fresh
//! nodes abandoned by later growth are returned in one batch at the end.

use std::ffi::CStr;
use std::fmt::{self, Write as _};
use std::mem;
use std::ptr::{self, NonNull};

use super::chain::NodeChain;
use crate::allocator::{Allocator, MemoryNode};
use crate::core::alignment::DEFAULT_ALIGN;
use crate::core::types::MIN_STRING_SIZE;
use crate::error::{MemoryError, MemoryResult};
use crate::utils::align_up;

/// NUL-terminated string living in pool memory
///
/// Valid until the pool that produced it is cleared or destroyed.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PoolStr {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: a PoolStr is an address and a length; reading through it is
// already unsafe and governed by the pool's lifetime
unsafe impl Send for PoolStr {}
// SAFETY: see above
unsafe impl Sync for PoolStr {}

impl PoolStr {
    pub(crate) fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Length in bytes, without the terminator
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// # Safety
    ///
    /// The pool that produced this string must not have been cleared or
    /// destroyed since.
    pub unsafe fn as_str<'a>(&self) -> &'a str {
        // SAFETY: the bytes were written from `&str` fragments and are still
        // live per the caller's contract
        unsafe { std::str::from_utf8_unchecked(std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)) }
    }

    /// # Safety
    ///
    /// Same contract as [`Self::as_str`]. Stops at the first NUL if the
    /// formatted text contained one.
    pub unsafe fn as_c_str<'a>(&self) -> &'a CStr {
        // SAFETY: a terminator is always written after the text
        unsafe { CStr::from_ptr(self.ptr.as_ptr().cast()) }
    }
}

impl fmt::Debug for PoolStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolStr")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

enum Target {
    Chain(usize),
    Fresh(MemoryNode),
}

struct Builder<'a> {
    chain: &'a mut NodeChain,
    allocator: &'a Allocator,
    target: Target,
    written: usize,
    replaced: bool,
    spare: Vec<MemoryNode>,
    error: Option<MemoryError>,
}

impl Builder<'_> {
    fn node(&self) -> &MemoryNode {
        match &self.target {
            Target::Chain(slot) => self.chain.node(*slot),
            Target::Fresh(node) => node,
        }
    }

    fn node_mut(&mut self) -> &mut MemoryNode {
        match &mut self.target {
            Target::Chain(slot) => self.chain.node_mut(*slot),
            Target::Fresh(node) => node,
        }
    }

    /// Writable bytes left, keeping one for the terminator
    fn room(&self) -> usize {
        self.node()
            .remaining()
            .saturating_sub(1)
            .saturating_sub(self.written)
    }

    fn cursor(&self) -> *mut u8 {
        // SAFETY: written < remaining, so the offset stays inside the block
        unsafe { self.node().first_avail().as_ptr().add(self.written) }
    }

    fn grow(&mut self) -> MemoryResult<()> {
        let size = self
            .written
            .checked_mul(2)
            .ok_or_else(|| MemoryError::size_overflow("formatted string"))?
            .max(MIN_STRING_SIZE);
        let source = self.node().first_avail().as_ptr();

        if !self.replaced
            && let Some(slot) = self.chain.take_next_if_fits(size)
        {
            self.chain.install_active(slot);
            let dest = self.chain.node(slot).first_avail().as_ptr();
            // SAFETY: distinct blocks; the next node has more than `size` >= written bytes free
            unsafe { ptr::copy_nonoverlapping(source, dest, self.written) };
            self.target = Target::Chain(slot);
            self.replaced = true;
            return Ok(());
        }

        let node = self.allocator.acquire(size)?;
        // SAFETY: fresh block of at least `size` >= written bytes
        unsafe { ptr::copy_nonoverlapping(source, node.first_avail().as_ptr(), self.written) };
        if let Target::Fresh(previous) = mem::replace(&mut self.target, Target::Fresh(node)) {
            self.spare.push(previous);
        }
        self.replaced = true;
        Ok(())
    }

    /// Write the terminator and commit the bytes
    fn terminate(&mut self) -> MemoryResult<PoolStr> {
        if self.node().remaining() <= self.written {
            self.grow()?;
        }
        let len = self.written;
        // SAFETY: remaining > written, so the terminator fits
        unsafe { self.cursor().write(0) };
        let reserved = align_up(len + 1, DEFAULT_ALIGN);
        let ptr = self.node_mut().bump(reserved);
        Ok(PoolStr::new(ptr, len))
    }

    /// Link the final buffer into the chain (on success) and return spare nodes
    fn settle(self, committed: bool) {
        let Builder {
            chain,
            allocator,
            target,
            mut spare,
            ..
        } = self;
        if let Target::Fresh(node) = target {
            if committed {
                chain.push_active(node);
            } else {
                spare.push(node);
            }
        }
        if !spare.is_empty() {
            allocator.release(spare);
        }
    }
}

impl fmt::Write for Builder<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();
        while !bytes.is_empty() {
            let room = self.room();
            if room == 0 {
                if let Err(err) = self.grow() {
                    self.error = Some(err);
                    return Err(fmt::Error);
                }
                continue;
            }
            let count = room.min(bytes.len());
            // SAFETY: `count` bytes fit between the cursor and the terminator slot
            unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.cursor(), count) };
            self.written += count;
            bytes = &bytes[count..];
        }
        Ok(())
    }
}

/// Format `args` into the chain's memory
pub(crate) fn format_into(
    chain: &mut NodeChain,
    allocator: &Allocator,
    args: fmt::Arguments<'_>,
) -> MemoryResult<PoolStr> {
    let active = chain.active_slot();
    let mut builder = Builder {
        chain,
        allocator,
        target: Target::Chain(active),
        written: 0,
        replaced: false,
        spare: Vec::new(),
        error: None,
    };

    let outcome = match builder.write_fmt(args) {
        Ok(()) => builder.terminate(),
        Err(fmt::Error) => Err(builder.error.take().unwrap_or_else(|| {
            MemoryError::invalid_argument("a formatting trait implementation returned an error")
        })),
    };
    builder.settle(outcome.is_ok());
    outcome
}

/// Format `args` into an owned buffer, for backends that copy
pub(crate) fn render(args: fmt::Arguments<'_>) -> MemoryResult<String> {
    let mut text = String::new();
    text.write_fmt(args).map_err(|_| {
        MemoryError::invalid_argument("a formatting trait implementation returned an error")
    })?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::boundary::BOUNDARY_SIZE;
    use std::sync::Arc;

    fn setup() -> (Arc<Allocator>, NodeChain) {
        let allocator = Allocator::new();
        let chain = NodeChain::new(allocator.acquire(0).unwrap());
        (allocator, chain)
    }

    #[test]
    fn short_string_stays_in_active_node() {
        let (allocator, mut chain) = setup();
        let text = format_into(&mut chain, &allocator, format_args!("id={} name={}", 7, "seven")).unwrap();
        assert_eq!(unsafe { text.as_str() }, "id=7 name=seven");
        assert_eq!(unsafe { text.as_c_str() }.to_bytes(), b"id=7 name=seven");
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.used_bytes(), 16);
        allocator.release(chain.into_nodes());
    }

    #[test]
    fn empty_string_is_just_a_terminator() {
        let (allocator, mut chain) = setup();
        let text = format_into(&mut chain, &allocator, format_args!("")).unwrap();
        assert!(text.is_empty());
        assert_eq!(unsafe { *text.as_ptr() }, 0);
        allocator.release(chain.into_nodes());
    }

    #[test]
    fn overflow_moves_to_a_fresh_node() {
        let (allocator, mut chain) = setup();
        let long = "x".repeat(3 * BOUNDARY_SIZE);
        let text = format_into(&mut chain, &allocator, format_args!("{long}")).unwrap();
        assert_eq!(text.len(), long.len());
        assert_eq!(unsafe { text.as_str() }, long);
        assert!(chain.len() >= 2);
        assert!(chain.active().contains(text.as_ptr()));
        allocator.release(chain.into_nodes());
    }

    #[test]
    fn growth_returns_abandoned_buffers() {
        let (allocator, mut chain) = setup();
        let long = "y".repeat(40 * BOUNDARY_SIZE);
        let text = format_into(&mut chain, &allocator, format_args!("{long}")).unwrap();
        assert_eq!(unsafe { text.as_str() }.len(), long.len());
        // Self node plus the final buffer; intermediates went back to the allocator
        assert_eq!(chain.len(), 2);
        assert!(allocator.stats().retained_nodes >= 1);
        allocator.release(chain.into_nodes());
    }

    #[test]
    fn next_node_is_reused_when_roomy() {
        let (allocator, mut chain) = setup();
        // Fill the self node, then retire it behind an almost empty node
        let filler = chain.active().remaining() - 8;
        chain.active_mut().bump(filler);
        let roomy = chain.push_active(allocator.acquire(0).unwrap());
        let roomy_start = chain.node(roomy).start();
        // Make the self node active again with a tiny gap left
        let self_slot = chain.next_of(roomy);
        let _ = chain.take_next_if_fits(0);
        chain.install_active(self_slot);
        assert_eq!(chain.next_of(chain.active_slot()), roomy);

        let text = format_into(&mut chain, &allocator, format_args!("{}", "z".repeat(100))).unwrap();
        assert_eq!(chain.active().start(), roomy_start);
        assert!(chain.active().contains(text.as_ptr()));
        assert_eq!(chain.len(), 2);
        allocator.release(chain.into_nodes());
    }

    struct Failing;

    impl fmt::Display for Failing {
        fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
            Err(fmt::Error)
        }
    }

    #[test]
    fn display_errors_are_reported() {
        let (allocator, mut chain) = setup();
        let err = format_into(&mut chain, &allocator, format_args!("{}", Failing)).unwrap_err();
        assert!(matches!(err, MemoryError::InvalidArgument { .. }));
        assert_eq!(chain.used_bytes(), 0);
        allocator.release(chain.into_nodes());
    }
}
