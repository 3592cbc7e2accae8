//! Child list of a pool
//!
//! Children are kept most-recent-first in a slab-backed doubly-linked list.
//! Each child remembers its slot, so unlinking is O(1).

use super::{Pool, PoolInner};

/// Slot value meaning "not linked into any parent"
pub(crate) const UNLINKED: usize = usize::MAX;

struct ChildLink {
    pool: Pool,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
pub(crate) struct ChildList {
    slots: Vec<Option<ChildLink>>,
    vacant: Vec<usize>,
    head: Option<usize>,
}

impl ChildList {
    /// Link `pool` as the newest child; returns its slot
    pub(crate) fn push_front(&mut self, pool: Pool) -> usize {
        let link = ChildLink {
            pool,
            prev: None,
            next: self.head,
        };
        let slot = if let Some(slot) = self.vacant.pop() {
            self.slots[slot] = Some(link);
            slot
        } else {
            self.slots.push(Some(link));
            self.slots.len() - 1
        };
        if let Some(head) = self.head
            && let Some(old_head) = self.slots[head].as_mut()
        {
            old_head.prev = Some(slot);
        }
        self.head = Some(slot);
        slot
    }

    /// Unlink the child at `slot` if it is `pool`
    pub(crate) fn remove(&mut self, slot: usize, pool: *const PoolInner) -> Option<Pool> {
        let matches = self
            .slots
            .get(slot)
            .and_then(Option::as_ref)
            .is_some_and(|link| link.pool.is(pool));
        if !matches {
            return None;
        }
        let link = self.slots[slot].take()?;
        match link.prev {
            Some(prev) => {
                if let Some(prev) = self.slots[prev].as_mut() {
                    prev.next = link.next;
                }
            }
            None => self.head = link.next,
        }
        if let Some(next) = link.next
            && let Some(next) = self.slots[next].as_mut()
        {
            next.prev = link.prev;
        }
        self.vacant.push(slot);
        Some(link.pool)
    }

    /// Newest child
    pub(crate) fn first(&self) -> Option<Pool> {
        self.head
            .and_then(|head| self.slots[head].as_ref())
            .map(|link| link.pool.clone())
    }

    /// Children, newest first
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Pool> + '_ {
        let mut current = self.head;
        std::iter::from_fn(move || {
            let link = self.slots[current?].as_ref()?;
            current = link.next;
            Some(&link.pool)
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{Allocator, PoolConfig};

    fn pool() -> Pool {
        Pool::new_root(Some(Allocator::new()), None, PoolConfig::default()).unwrap()
    }

    fn ids(list: &ChildList) -> Vec<u64> {
        list.iter().map(|pool| pool.id().as_u64()).collect()
    }

    #[test]
    fn newest_child_comes_first() {
        let (a, b, c) = (pool(), pool(), pool());
        let mut list = ChildList::default();
        list.push_front(a.clone());
        list.push_front(b.clone());
        list.push_front(c.clone());

        assert_eq!(list.len(), 3);
        assert!(list.first().is_some_and(|first| first.ptr_eq(&c)));
        assert_eq!(
            ids(&list),
            vec![c.id().as_u64(), b.id().as_u64(), a.id().as_u64()]
        );
    }

    #[test]
    fn remove_relinks_neighbours_and_reuses_the_slot() {
        let (a, b, c) = (pool(), pool(), pool());
        let mut list = ChildList::default();
        list.push_front(a.clone());
        let middle = list.push_front(b.clone());
        list.push_front(c.clone());

        let removed = list.remove(middle, Arc::as_ptr(&b.inner));
        assert!(removed.is_some_and(|pool| pool.ptr_eq(&b)));
        assert_eq!(ids(&list), vec![c.id().as_u64(), a.id().as_u64()]);

        let d = pool();
        assert_eq!(list.push_front(d.clone()), middle);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn remove_ignores_a_stale_slot() {
        let (a, b) = (pool(), pool());
        let mut list = ChildList::default();
        let slot = list.push_front(a.clone());

        assert!(list.remove(slot, Arc::as_ptr(&b.inner)).is_none());
        assert!(list.remove(UNLINKED, Arc::as_ptr(&a.inner)).is_none());
        assert_eq!(list.len(), 1);

        assert!(list.remove(slot, Arc::as_ptr(&a.inner)).is_some());
        assert!(list.first().is_none());
        assert_eq!(list.len(), 0);
    }
}
