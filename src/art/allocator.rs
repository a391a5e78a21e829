//! Slab allocation for fixed-size nodes.
//!
//! Each node kind has its own `FixedSizeAllocator`. Nodes live in buffers of
//! `SLOTS_PER_BUFFER` slots; a [`NodeHandle`] addresses a slot by
//! `(buffer_id, offset)`. Free slots are kept ordered so allocation always
//! fills the lowest free position, which keeps live nodes packed towards the
//! low buffers and makes vacuum effective.

use std::collections::{BTreeMap, BTreeSet};

use crate::art::node::{NodeHandle, NodeKind};
use crate::config::SLOTS_PER_BUFFER;
use crate::error::{ArtError, Result};

struct Buffer<T> {
    slots: Vec<Option<T>>,
    live: usize,
}

impl<T> Buffer<T> {
    fn new() -> Self {
        Buffer {
            slots: (0..SLOTS_PER_BUFFER).map(|_| None).collect(),
            live: 0,
        }
    }
}

pub struct FixedSizeAllocator<T> {
    kind: NodeKind,
    buffers: BTreeMap<u32, Buffer<T>>,
    free_slots: BTreeSet<(u32, u32)>,
    next_buffer_id: u32,
    max_buffers: Option<usize>,
    /// Buffers being emptied by the current vacuum pass.
    vacuum_buffers: BTreeSet<u32>,
    live: usize,
}

impl<T> FixedSizeAllocator<T> {
    pub fn new(kind: NodeKind, max_buffers: Option<usize>) -> Self {
        FixedSizeAllocator {
            kind,
            buffers: BTreeMap::new(),
            free_slots: BTreeSet::new(),
            next_buffer_id: 0,
            max_buffers,
            vacuum_buffers: BTreeSet::new(),
            live: 0,
        }
    }

    /// Store `value` in a free slot, growing by one buffer if needed.
    pub fn allocate(&mut self, value: T) -> Result<NodeHandle> {
        let (buffer_id, offset) = match self.free_slots.pop_first() {
            Some(slot) => slot,
            None => self.grow()?,
        };
        let buffer = self
            .buffers
            .get_mut(&buffer_id)
            .ok_or_else(|| ArtError::Internal(format!("free slot in missing buffer {}", buffer_id)))?;
        debug_assert!(buffer.slots[offset as usize].is_none());
        buffer.slots[offset as usize] = Some(value);
        buffer.live += 1;
        self.live += 1;
        Ok(NodeHandle::new(self.kind, buffer_id, offset))
    }

    fn grow(&mut self) -> Result<(u32, u32)> {
        if let Some(max) = self.max_buffers {
            if self.buffers.len() >= max {
                return Err(ArtError::OutOfMemory {
                    kind: self.kind,
                    buffers: max,
                });
            }
        }
        let buffer_id = self.next_buffer_id;
        self.next_buffer_id = self
            .next_buffer_id
            .checked_add(1)
            .ok_or_else(|| ArtError::Internal("buffer id space exhausted".into()))?;
        self.buffers.insert(buffer_id, Buffer::new());
        self.free_slots
            .extend((1..SLOTS_PER_BUFFER as u32).map(|offset| (buffer_id, offset)));
        tracing::trace!(kind = ?self.kind, buffer_id, "allocated node buffer");
        Ok((buffer_id, 0))
    }

    fn slot(&self, node: NodeHandle) -> Option<&T> {
        self.buffers
            .get(&node.buffer_id())
            .and_then(|buffer| buffer.slots.get(node.offset() as usize))
            .and_then(Option::as_ref)
    }

    pub fn get(&self, node: NodeHandle) -> &T {
        debug_assert_eq!(node.kind(), Some(self.kind));
        self.slot(node)
            .unwrap_or_else(|| panic!("dangling {:?} handle {:?}", self.kind, node))
    }

    pub fn get_mut(&mut self, node: NodeHandle) -> &mut T {
        debug_assert_eq!(node.kind(), Some(self.kind));
        let kind = self.kind;
        self.buffers
            .get_mut(&node.buffer_id())
            .and_then(|buffer| buffer.slots.get_mut(node.offset() as usize))
            .and_then(Option::as_mut)
            .unwrap_or_else(|| panic!("dangling {:?} handle {:?}", kind, node))
    }

    /// Remove the value stored at `node` and return it.
    pub fn take(&mut self, node: NodeHandle) -> T {
        debug_assert_eq!(node.kind(), Some(self.kind));
        let kind = self.kind;
        let buffer = self
            .buffers
            .get_mut(&node.buffer_id())
            .unwrap_or_else(|| panic!("dangling {:?} handle {:?}", kind, node));
        let value = buffer.slots[node.offset() as usize]
            .take()
            .unwrap_or_else(|| panic!("double free of {:?} handle {:?}", kind, node));
        buffer.live -= 1;
        self.live -= 1;
        if !self.vacuum_buffers.contains(&node.buffer_id()) {
            self.free_slots.insert((node.buffer_id(), node.offset()));
        }
        value
    }

    pub fn contains(&self, node: NodeHandle) -> bool {
        node.kind() == Some(self.kind) && self.slot(node).is_some()
    }

    /// Move every buffer of `other` into this allocator. Buffer ids of `other`
    /// are shifted by this allocator's `next_buffer_id()` as it was before the
    /// call; handles into `other` must have been rewritten accordingly.
    pub fn absorb(&mut self, other: FixedSizeAllocator<T>) {
        debug_assert_eq!(self.kind, other.kind);
        debug_assert!(other.vacuum_buffers.is_empty());
        let shift = self.next_buffer_id;
        for (buffer_id, buffer) in other.buffers {
            self.buffers.insert(buffer_id + shift, buffer);
        }
        self.free_slots.extend(
            other
                .free_slots
                .into_iter()
                .map(|(buffer_id, offset)| (buffer_id + shift, offset)),
        );
        self.next_buffer_id = shift + other.next_buffer_id;
        self.live += other.live;
    }

    /// Values stored in this allocator, in slot order.
    pub fn values(&self) -> impl Iterator<Item = (NodeHandle, &T)> + '_ {
        let kind = self.kind;
        self.buffers.iter().flat_map(move |(&buffer_id, buffer)| {
            buffer
                .slots
                .iter()
                .enumerate()
                .filter_map(move |(offset, slot)| {
                    slot.as_ref()
                        .map(|value| (NodeHandle::new(kind, buffer_id, offset as u32), value))
                })
        })
    }
}

/// Kind-independent view of an allocator, used for dispatch by [`NodeKind`].
pub trait NodeAllocator {
    fn kind(&self) -> NodeKind;
    fn live(&self) -> usize;
    fn buffer_count(&self) -> usize;
    fn next_buffer_id(&self) -> u32;
    fn contains(&self, node: NodeHandle) -> bool;
    fn release(&mut self, node: NodeHandle);

    /// Select the buffers to empty in this vacuum pass. Returns false if
    /// there is not enough free space to reclaim a whole buffer.
    fn initialize_vacuum(&mut self, threshold_percent: usize) -> bool;
    fn needs_vacuum(&self, node: NodeHandle) -> bool;
    /// Move the node at `node` into a slot outside the vacuumed buffers.
    fn relocate(&mut self, node: NodeHandle) -> Result<NodeHandle>;
    fn finalize_vacuum(&mut self);
}

impl<T> NodeAllocator for FixedSizeAllocator<T> {
    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn live(&self) -> usize {
        self.live
    }

    fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    fn next_buffer_id(&self) -> u32 {
        self.next_buffer_id
    }

    fn contains(&self, node: NodeHandle) -> bool {
        FixedSizeAllocator::contains(self, node)
    }

    fn release(&mut self, node: NodeHandle) {
        self.take(node);
    }

    fn initialize_vacuum(&mut self, threshold_percent: usize) -> bool {
        let total = self.buffers.len() * SLOTS_PER_BUFFER;
        if total == 0 {
            return false;
        }
        let free = total - self.live;
        if free * 100 < total * threshold_percent {
            return false;
        }
        let excess = free / SLOTS_PER_BUFFER;
        if excess == 0 {
            return false;
        }

        let mut by_occupancy: Vec<(usize, u32)> = self
            .buffers
            .iter()
            .map(|(&id, buffer)| (buffer.live, id))
            .collect();
        by_occupancy.sort_unstable();
        self.vacuum_buffers = by_occupancy
            .into_iter()
            .take(excess)
            .map(|(_, id)| id)
            .collect();
        let vacuum_buffers = &self.vacuum_buffers;
        self.free_slots
            .retain(|(buffer_id, _)| !vacuum_buffers.contains(buffer_id));
        true
    }

    fn needs_vacuum(&self, node: NodeHandle) -> bool {
        self.vacuum_buffers.contains(&node.buffer_id())
    }

    fn relocate(&mut self, node: NodeHandle) -> Result<NodeHandle> {
        let value = self.take(node);
        self.allocate(value)
    }

    fn finalize_vacuum(&mut self) {
        for buffer_id in std::mem::take(&mut self.vacuum_buffers) {
            if let Some(buffer) = self.buffers.remove(&buffer_id) {
                debug_assert_eq!(buffer.live, 0, "vacuumed buffer still holds nodes");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_fills_lowest_slot() {
        let mut alloc: FixedSizeAllocator<u32> = FixedSizeAllocator::new(NodeKind::Leaf, None);
        let a = alloc.allocate(1).unwrap();
        let b = alloc.allocate(2).unwrap();
        assert_eq!((a.buffer_id(), a.offset()), (0, 0));
        assert_eq!((b.buffer_id(), b.offset()), (0, 1));

        alloc.release(a);
        let c = alloc.allocate(3).unwrap();
        assert_eq!(c, a);
        assert_eq!(*alloc.get(c), 3);
        assert_eq!(alloc.live(), 2);
    }

    #[test]
    fn test_bounded_allocator_reports_out_of_memory() {
        let mut alloc: FixedSizeAllocator<u8> = FixedSizeAllocator::new(NodeKind::Prefix, Some(1));
        for _ in 0..SLOTS_PER_BUFFER {
            alloc.allocate(0).unwrap();
        }
        match alloc.allocate(0) {
            Err(ArtError::OutOfMemory { kind, buffers }) => {
                assert_eq!(kind, NodeKind::Prefix);
                assert_eq!(buffers, 1);
            }
            other => panic!("expected out of memory, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_vacuum_empties_sparse_buffers() {
        let mut alloc: FixedSizeAllocator<usize> = FixedSizeAllocator::new(NodeKind::Leaf, None);
        let handles: Vec<_> = (0..SLOTS_PER_BUFFER * 3)
            .map(|i| alloc.allocate(i).unwrap())
            .collect();
        // Keep every fourth node alive.
        let mut kept = Vec::new();
        for (i, h) in handles.into_iter().enumerate() {
            if i % 4 == 0 {
                kept.push(h);
            } else {
                alloc.release(h);
            }
        }
        assert_eq!(alloc.buffer_count(), 3);
        assert!(alloc.initialize_vacuum(10));

        let mut moved = Vec::new();
        for h in kept {
            let h = if alloc.needs_vacuum(h) {
                alloc.relocate(h).unwrap()
            } else {
                h
            };
            moved.push(h);
        }
        alloc.finalize_vacuum();

        assert_eq!(alloc.buffer_count(), 1);
        assert_eq!(alloc.live(), moved.len());
        let mut values: Vec<usize> = moved.iter().map(|&h| *alloc.get(h)).collect();
        values.sort_unstable();
        let expected: Vec<usize> = (0..SLOTS_PER_BUFFER * 3).step_by(4).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_absorb_shifts_buffer_ids() {
        let mut left: FixedSizeAllocator<u8> = FixedSizeAllocator::new(NodeKind::Leaf, None);
        let mut right: FixedSizeAllocator<u8> = FixedSizeAllocator::new(NodeKind::Leaf, None);
        left.allocate(1).unwrap();
        let r = right.allocate(2).unwrap();

        let shift = left.next_buffer_id();
        left.absorb(right);
        let moved = NodeHandle::new(NodeKind::Leaf, r.buffer_id() + shift, r.offset());
        assert_eq!(*left.get(moved), 2);
        assert_eq!(left.live(), 2);
        assert_eq!(left.buffer_count(), 2);
    }
}
