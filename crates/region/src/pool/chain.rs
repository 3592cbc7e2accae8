//! Ring of nodes owned by a bump pool
//!
//! Nodes live in a slab and are linked into a circular doubly-linked list by
//! slot index. The active node is the one allocations come from; the rest
//! follow it ordered by descending `free_index`, except that the order is
//! only repaired locally when the active node changes.
//!
//! ## Invariants
//!
//! - The ring is never empty; the self node is always in it
//! - `active` and `self_slot` are occupied slots

use crate::allocator::MemoryNode;

struct Link {
    node: MemoryNode,
    next: usize,
    prev: usize,
}

pub(crate) struct NodeChain {
    slots: Vec<Option<Link>>,
    vacant: Vec<usize>,
    active: usize,
    self_slot: usize,
}

impl NodeChain {
    /// Chain holding only the pool's self node, which is also active
    pub(crate) fn new(self_node: MemoryNode) -> Self {
        Self {
            slots: vec![Some(Link {
                node: self_node,
                next: 0,
                prev: 0,
            })],
            vacant: Vec::new(),
            active: 0,
            self_slot: 0,
        }
    }

    fn link(&self, slot: usize) -> &Link {
        match self.slots.get(slot) {
            Some(Some(link)) => link,
            _ => unreachable!("node chain slot {slot} is vacant"),
        }
    }

    fn link_mut(&mut self, slot: usize) -> &mut Link {
        match self.slots.get_mut(slot) {
            Some(Some(link)) => link,
            _ => unreachable!("node chain slot {slot} is vacant"),
        }
    }

    pub(crate) fn active_slot(&self) -> usize {
        self.active
    }

    pub(crate) fn node(&self, slot: usize) -> &MemoryNode {
        &self.link(slot).node
    }

    pub(crate) fn node_mut(&mut self, slot: usize) -> &mut MemoryNode {
        &mut self.link_mut(slot).node
    }

    pub(crate) fn active(&self) -> &MemoryNode {
        self.node(self.active)
    }

    pub(crate) fn active_mut(&mut self) -> &mut MemoryNode {
        let active = self.active;
        self.node_mut(active)
    }

    pub(crate) fn next_of(&self, slot: usize) -> usize {
        self.link(slot).next
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }

    /// Detach `slot` from the ring; the slot stays occupied
    fn unlink(&mut self, slot: usize) {
        let Link { next, prev, .. } = *self.link(slot);
        self.link_mut(prev).next = next;
        self.link_mut(next).prev = prev;
    }

    /// Attach a detached `slot` immediately before `point`
    fn link_before(&mut self, slot: usize, point: usize) {
        let prev = self.link(point).prev;
        {
            let link = self.link_mut(slot);
            link.next = point;
            link.prev = prev;
        }
        self.link_mut(prev).next = slot;
        self.link_mut(point).prev = slot;
    }

    fn store(&mut self, node: MemoryNode) -> usize {
        let link = Some(Link {
            node,
            next: usize::MAX,
            prev: usize::MAX,
        });
        if let Some(slot) = self.vacant.pop() {
            self.slots[slot] = link;
            slot
        } else {
            self.slots.push(link);
            self.slots.len() - 1
        }
    }

    /// Add a fresh node as the new active one
    pub(crate) fn push_active(&mut self, node: MemoryNode) -> usize {
        let slot = self.store(node);
        self.install_active(slot);
        slot
    }

    /// Take the node after the active one out of the ring if more than
    /// `size` bytes are free in it
    pub(crate) fn take_next_if_fits(&mut self, size: usize) -> Option<usize> {
        let next = self.next_of(self.active);
        if next == self.active || size >= self.node(next).remaining() {
            return None;
        }
        self.unlink(next);
        Some(next)
    }

    /// Make a detached `slot` the active node
    ///
    /// The new node goes in front of the previous active one, which then
    /// gets its `free_index` recomputed and moves forward past every node
    /// with more free units, keeping the descending order.
    pub(crate) fn install_active(&mut self, slot: usize) {
        let previous = self.active;
        self.link_before(slot, previous);
        self.active = slot;
        self.node_mut(slot).set_free_index(0);

        let free_index = self.node_mut(previous).refresh_free_index();
        let mut point = self.next_of(previous);
        if free_index >= self.node(point).free_index() {
            return;
        }
        // Terminates at the latest on the new active node, whose free_index is 0
        while free_index < self.node(point).free_index() {
            point = self.next_of(point);
        }
        self.unlink(previous);
        self.link_before(previous, point);
    }

    /// Drop every node but the self node, which becomes active and empty
    pub(crate) fn reset(&mut self) -> Vec<MemoryNode> {
        let self_slot = self.self_slot;
        let mut released = Vec::with_capacity(self.len().saturating_sub(1));
        let mut self_node = None;
        for (slot, link) in self.slots.drain(..).enumerate() {
            let Some(link) = link else { continue };
            if slot == self_slot {
                self_node = Some(link.node);
            } else {
                released.push(link.node);
            }
        }
        self.vacant.clear();
        if let Some(mut node) = self_node {
            node.reset();
            node.set_free_index(0);
            self.slots.push(Some(Link {
                node,
                next: 0,
                prev: 0,
            }));
        }
        self.active = 0;
        self.self_slot = 0;
        released
    }

    /// Every node, the self node included
    pub(crate) fn into_nodes(self) -> Vec<MemoryNode> {
        self.slots.into_iter().flatten().map(|link| link.node).collect()
    }

    /// Slots in ring order starting from the active node
    pub(crate) fn ring(&self) -> impl Iterator<Item = usize> + '_ {
        let start = self.active;
        let mut current = Some(start);
        std::iter::from_fn(move || {
            let slot = current?;
            let next = self.next_of(slot);
            current = (next != start).then_some(next);
            Some(slot)
        })
    }

    /// Bytes handed out across all nodes
    pub(crate) fn used_bytes(&self) -> usize {
        self.ring().map(|slot| self.node(slot).used()).sum()
    }

    pub(crate) fn contains(&self, ptr: *const u8) -> bool {
        self.ring().any(|slot| self.node(slot).contains(ptr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocator;
    use crate::core::boundary::BOUNDARY_SIZE;
    use std::sync::Arc;

    fn chain(allocator: &Arc<Allocator>) -> NodeChain {
        NodeChain::new(allocator.acquire(0).unwrap())
    }

    fn free_indices(chain: &NodeChain) -> Vec<u32> {
        chain.ring().map(|slot| chain.node(slot).free_index()).collect()
    }

    #[test]
    fn new_chain_is_a_single_ring() {
        let allocator = Allocator::new();
        let chain = chain(&allocator);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.ring().count(), 1);
        allocator.release(chain.into_nodes());
    }

    #[test]
    fn push_active_puts_new_node_first() {
        let allocator = Allocator::new();
        let mut chain = chain(&allocator);
        chain.active_mut().bump(100);

        let slot = chain.push_active(allocator.acquire(0).unwrap());
        assert_eq!(chain.active_slot(), slot);
        assert_eq!(chain.ring().count(), 2);
        // 8092 bytes left in the old active: one whole unit
        assert_eq!(free_indices(&chain), vec![0, 1]);
        allocator.release(chain.into_nodes());
    }

    #[test]
    fn previous_active_moves_past_emptier_nodes() {
        let allocator = Allocator::new();
        let mut chain = chain(&allocator);
        let self_start = chain.active().start();
        chain.active_mut().bump(8);

        // Large node filled almost to the end: zero whole units left
        let big = chain.push_active(allocator.acquire(4 * BOUNDARY_SIZE).unwrap());
        let big_start = chain.node(big).start();
        chain.active_mut().bump(4 * BOUNDARY_SIZE - 384);

        chain.push_active(allocator.acquire(0).unwrap());
        let starts: Vec<_> = chain.ring().map(|slot| chain.node(slot).start()).collect();
        assert_eq!(starts[1], self_start);
        assert_eq!(starts[2], big_start);
        assert_eq!(free_indices(&chain), vec![0, 1, 0]);
        allocator.release(chain.into_nodes());
    }

    #[test]
    fn take_next_requires_strictly_more_room() {
        let allocator = Allocator::new();
        let mut chain = chain(&allocator);
        chain.push_active(allocator.acquire(0).unwrap());

        let next = chain.next_of(chain.active_slot());
        let room = chain.node(next).remaining();
        assert!(chain.take_next_if_fits(room).is_none());

        let slot = chain.take_next_if_fits(room - 1).unwrap();
        assert_eq!(chain.ring().count(), 1);
        chain.install_active(slot);
        assert_eq!(chain.ring().count(), 2);
        allocator.release(chain.into_nodes());
    }

    #[test]
    fn reset_keeps_only_the_self_node() {
        let allocator = Allocator::new();
        let mut chain = chain(&allocator);
        let self_start = chain.active().start();
        chain.active_mut().bump(64);
        chain.push_active(allocator.acquire(0).unwrap());
        chain.push_active(allocator.acquire(0).unwrap());

        let released = chain.reset();
        assert_eq!(released.len(), 2);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.active().start(), self_start);
        assert_eq!(chain.used_bytes(), 0);
        allocator.release(released);
        allocator.release(chain.into_nodes());
    }
}
