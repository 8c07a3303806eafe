//! Circular doubly linked list for the vxge HAL core.
//!
//! Nodes live in an arena owned by the list and are addressed by
//! generational [`NodeId`]s instead of pointers embedded in the owning
//! object. Slot 0 of the arena is the sentinel head:
//!
//! ```text
//!     ┌──────────────────────────────────────────┐
//!     ▼                                          │
//!   head ⇄ A ⇄ B ⇄ C ─────────────────────────────┘
//! ```
//!
//! Empty list: `head.next == head` and `head.prev == head`.
//!
//! Removing a node bumps the generation of its slot. An id that outlived
//! its node no longer matches and is rejected, so a stale handle cannot
//! corrupt the links of whatever node reuses the slot later.
//!
//! The list performs no locking. Callers that share a list wrap it in
//! their own lock.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

/// Arena index of the sentinel head.
const HEAD: u32 = 0;

/// Handle to a node linked into a [`List`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// Arena slot of the node.
    #[inline]
    pub const fn index(&self) -> usize {
        self.index as usize
    }

    /// Generation of the slot when this id was issued.
    #[inline]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// True if this id refers to the sentinel head.
    #[inline]
    pub const fn is_head(&self) -> bool {
        self.index == HEAD
    }
}

struct Node<T> {
    next: u32,
    prev: u32,
    generation: u32,
    value: Option<T>,
}

impl<T> Node<T> {
    const fn sentinel() -> Self {
        Self {
            next: HEAD,
            prev: HEAD,
            generation: 0,
            value: None,
        }
    }
}

/// Circular doubly linked list with O(1) insert, remove and first lookup.
pub struct List<T> {
    nodes: Vec<Node<T>>,
    /// Unlinked arena slots available for reuse.
    vacant: Vec<u32>,
    len: usize,
}

impl<T> List<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create an empty list with room for `capacity` nodes before the
    /// arena has to grow.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut nodes = Vec::with_capacity(capacity + 1);
        nodes.push(Node::sentinel());
        Self {
            nodes,
            vacant: Vec::new(),
            len: 0,
        }
    }

    /// The sentinel head. Valid as the anchor of `insert_after` and
    /// `insert_before`.
    #[inline]
    pub const fn head(&self) -> NodeId {
        NodeId {
            index: HEAD,
            generation: 0,
        }
    }

    /// True iff `head.next == head`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes[HEAD as usize].next == HEAD
    }

    /// Number of linked nodes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// First node, or `None` if the list is empty.
    pub fn first(&self) -> Option<NodeId> {
        self.link_target(self.nodes[HEAD as usize].next)
    }

    /// Last node, or `None` if the list is empty.
    pub fn last(&self) -> Option<NodeId> {
        self.link_target(self.nodes[HEAD as usize].prev)
    }

    /// Node following `id`, or `None` at the end of the list or if `id`
    /// is stale.
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        let slot = self.slot(id)?;
        self.link_target(self.nodes[slot as usize].next)
    }

    /// Node preceding `id`, or `None` at the start of the list or if `id`
    /// is stale.
    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        let slot = self.slot(id)?;
        self.link_target(self.nodes[slot as usize].prev)
    }

    /// True if `id` refers to a node currently linked into this list.
    pub fn contains(&self, id: NodeId) -> bool {
        !id.is_head() && self.slot(id).is_some()
    }

    /// Splice `value` in immediately after `prev`.
    ///
    /// # Panics
    /// Panics if `prev` is stale.
    pub fn insert_after(&mut self, value: T, prev: NodeId) -> NodeId {
        let prev = self.expect_slot(prev);
        let next = self.nodes[prev as usize].next;
        self.link(value, prev, next)
    }

    /// Splice `value` in immediately before `next`.
    ///
    /// # Panics
    /// Panics if `next` is stale.
    pub fn insert_before(&mut self, value: T, next: NodeId) -> NodeId {
        let next = self.expect_slot(next);
        let prev = self.nodes[next as usize].prev;
        self.link(value, prev, next)
    }

    /// Insert at the front of the list.
    #[inline]
    pub fn push_front(&mut self, value: T) -> NodeId {
        self.insert_after(value, self.head())
    }

    /// Insert at the back of the list.
    #[inline]
    pub fn push_back(&mut self, value: T) -> NodeId {
        self.insert_before(value, self.head())
    }

    /// Unlink `id` and hand back its value.
    ///
    /// Returns `None` if `id` is the head or no longer linked.
    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        if id.is_head() {
            return None;
        }
        let slot = self.slot(id)?;
        let (prev, next) = {
            let node = &self.nodes[slot as usize];
            (node.prev, node.next)
        };
        self.nodes[prev as usize].next = next;
        self.nodes[next as usize].prev = prev;

        // Poison: self-loop plus a fresh generation.
        let node = &mut self.nodes[slot as usize];
        node.next = slot;
        node.prev = slot;
        node.generation = node.generation.wrapping_add(1);
        let value = node.value.take();

        self.vacant.push(slot);
        self.len -= 1;
        value
    }

    /// Unlink and return the first value.
    pub fn pop_front(&mut self) -> Option<T> {
        let id = self.first()?;
        self.remove(id)
    }

    /// Unlink and return the last value.
    pub fn pop_back(&mut self) -> Option<T> {
        let id = self.last()?;
        self.remove(id)
    }

    /// Value stored at `id`.
    pub fn get(&self, id: NodeId) -> Option<&T> {
        let slot = self.slot(id)?;
        self.nodes[slot as usize].value.as_ref()
    }

    /// Mutable value stored at `id`.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        let slot = self.slot(id)?;
        self.nodes[slot as usize].value.as_mut()
    }

    /// Walk the list front to back, handing each node to `f`.
    ///
    /// The successor is captured before `f` runs, so `f` may remove the
    /// current node. If `f` unlinks the captured successor as well the
    /// walk stops there and the remaining nodes are not visited. Callers
    /// that need every node must only ever remove the current one.
    pub fn for_each_safe<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut Self, NodeId),
    {
        let mut cursor = self.first();
        while let Some(current) = cursor {
            let next = self.next(current);
            f(self, current);
            cursor = match next {
                Some(next) if self.contains(next) => Some(next),
                _ => None,
            };
        }
    }

    /// Unlink every node, dropping the values.
    pub fn clear(&mut self) {
        while self.pop_front().is_some() {}
    }

    /// Iterate values front to back.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.nodes[HEAD as usize].next,
            remaining: self.len,
        }
    }

    /// Iterate node ids front to back.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        let mut cursor = self.first();
        core::iter::from_fn(move || {
            let current = cursor?;
            cursor = self.next(current);
            Some(current)
        })
    }

    fn link(&mut self, value: T, prev: u32, next: u32) -> NodeId {
        let slot = match self.vacant.pop() {
            Some(slot) => {
                let node = &mut self.nodes[slot as usize];
                node.value = Some(value);
                node.prev = prev;
                node.next = next;
                slot
            }
            None => {
                let slot = self.nodes.len() as u32;
                self.nodes.push(Node {
                    next,
                    prev,
                    generation: 0,
                    value: Some(value),
                });
                slot
            }
        };
        self.nodes[prev as usize].next = slot;
        self.nodes[next as usize].prev = slot;
        self.len += 1;
        NodeId {
            index: slot,
            generation: self.nodes[slot as usize].generation,
        }
    }

    fn link_target(&self, slot: u32) -> Option<NodeId> {
        if slot == HEAD {
            return None;
        }
        Some(NodeId {
            index: slot,
            generation: self.nodes[slot as usize].generation,
        })
    }

    fn slot(&self, id: NodeId) -> Option<u32> {
        let node = self.nodes.get(id.index())?;
        if node.generation != id.generation {
            return None;
        }
        if id.is_head() || node.value.is_some() {
            Some(id.index)
        } else {
            None
        }
    }

    fn expect_slot(&self, id: NodeId) -> u32 {
        match self.slot(id) {
            Some(slot) => slot,
            None => panic!("BUG: list node {:?} is not linked", id),
        }
    }
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for List<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Front-to-back iterator over list values.
pub struct Iter<'a, T> {
    list: &'a List<T>,
    cursor: u32,
    remaining: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == HEAD {
            return None;
        }
        let node = &self.list.nodes[self.cursor as usize];
        self.cursor = node.next;
        self.remaining -= 1;
        node.value.as_ref()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T> IntoIterator for &'a List<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// ============================================================================
// Tests
// ============================================================================
