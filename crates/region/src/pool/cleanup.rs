//! Cleanup registry
//!
//! Callbacks registered against a pool run when the pool is cleared or
//! destroyed, most recently registered first. Each entry also carries a
//! second callback for the child side of a process fork.
//!
//! An entry is identified by the address of its data and of its normal
//! callback, so cancelling needs the same `Arc` and the same function that
//! were registered. Cancelled slots are kept for reuse until the next
//! clear.

use std::sync::Arc;

use crate::error::MemoryResult;

/// Signature of cleanup callbacks
pub type CleanupFn<T> = fn(&T) -> MemoryResult<()>;

/// Callback that does nothing, for when only one side of the fork needs work
pub fn noop_cleanup<T>(_data: &T) -> MemoryResult<()> {
    Ok(())
}

type Callback = Box<dyn Fn() -> MemoryResult<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CleanupKey {
    data: usize,
    function: usize,
}

impl CleanupKey {
    pub(crate) fn new<T>(data: &Arc<T>, function: CleanupFn<T>) -> Self {
        Self {
            data: Arc::as_ptr(data).addr(),
            function: function as usize,
        }
    }
}

pub(crate) fn bind<T: Send + Sync + 'static>(data: &Arc<T>, function: CleanupFn<T>) -> Callback {
    let data = Arc::clone(data);
    Box::new(move || function(&data))
}

pub(crate) struct CleanupEntry {
    key: CleanupKey,
    normal: Callback,
    fork_child: Callback,
}

impl CleanupEntry {
    pub(crate) fn new(key: CleanupKey, normal: Callback, fork_child: Callback) -> Self {
        Self {
            key,
            normal,
            fork_child,
        }
    }

    pub(crate) fn run(&self) -> MemoryResult<()> {
        (self.normal)()
    }

    pub(crate) fn run_fork_child(&self) -> MemoryResult<()> {
        (self.fork_child)()
    }
}

struct Slot {
    entry: Option<CleanupEntry>,
    next: Option<usize>,
}

#[derive(Default)]
pub(crate) struct CleanupRegistry {
    slots: Vec<Slot>,
    head: Option<usize>,
    free: Option<usize>,
}

impl CleanupRegistry {
    /// Add an entry in front of the others, reusing a cancelled slot if any
    pub(crate) fn register(&mut self, entry: CleanupEntry) {
        let slot = match self.free {
            Some(slot) => {
                self.free = self.slots[slot].next;
                self.slots[slot] = Slot {
                    entry: Some(entry),
                    next: self.head,
                };
                slot
            }
            None => {
                self.slots.push(Slot {
                    entry: Some(entry),
                    next: self.head,
                });
                self.slots.len() - 1
            }
        };
        self.head = Some(slot);
    }

    fn recycle(&mut self, slot: usize) -> Option<CleanupEntry> {
        let entry = self.slots[slot].entry.take();
        self.slots[slot].next = self.free;
        self.free = Some(slot);
        entry
    }

    /// Unlink the first entry matching `key`
    pub(crate) fn remove(&mut self, key: CleanupKey) -> Option<CleanupEntry> {
        let mut previous: Option<usize> = None;
        let mut current = self.head;
        while let Some(slot) = current {
            let next = self.slots[slot].next;
            let hit = self.slots[slot]
                .entry
                .as_ref()
                .is_some_and(|entry| entry.key == key);
            if hit {
                match previous {
                    Some(previous) => self.slots[previous].next = next,
                    None => self.head = next,
                }
                return self.recycle(slot);
            }
            previous = Some(slot);
            current = next;
        }
        None
    }

    /// Swap the fork-child callback of the entry matching `key`
    pub(crate) fn replace_fork_child(&mut self, key: CleanupKey, fork_child: Callback) -> bool {
        let mut current = self.head;
        while let Some(slot) = current {
            let entry = &mut self.slots[slot];
            current = entry.next;
            if let Some(entry) = entry.entry.as_mut()
                && entry.key == key
            {
                entry.fork_child = fork_child;
                return true;
            }
        }
        false
    }

    /// Detach the most recently registered entry
    pub(crate) fn pop_front(&mut self) -> Option<CleanupEntry> {
        let slot = self.head?;
        self.head = self.slots[slot].next;
        self.recycle(slot)
    }

    /// Forget every entry and every recycled slot
    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.head = None;
        self.free = None;
    }

    /// Live entries
    pub(crate) fn len(&self) -> usize {
        let mut count = 0;
        let mut current = self.head;
        while let Some(slot) = current {
            count += 1;
            current = self.slots[slot].next;
        }
        count
    }

    /// Slots waiting for reuse
    #[cfg(test)]
    pub(crate) fn recycled(&self) -> usize {
        let mut count = 0;
        let mut current = self.free;
        while let Some(slot) = current {
            count += 1;
            current = self.slots[slot].next;
        }
        count
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }
}
