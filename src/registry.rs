//! Descriptor registry: per-descriptor state records with stable tags.
//!
//! One record exists per registered descriptor. Records live in a slot
//! arena guarded by the registry lock: freed slots go on a free list and
//! are reused, with a per-slot generation counter so a stale kernel tag
//! from a closed descriptor never resolves to the slot's new occupant.
//! The packed `(index, generation)` pair is the opaque tag the reactor
//! hands to the kernel as registration user-data.
//!
//! Lock order: the registry lock is only ever taken *after* a descriptor
//! lock where both are needed (the close path). The dispatch loop takes
//! the registry lock briefly to resolve a tag and releases it before
//! locking the descriptor, so it never nests the two.

use crate::error::{Error, OpError};
use crate::op::{Op, OpKind, ReadyBatch};
use crate::sys::RawFd;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;

/// Packed slot identity: high 32 bits index, low 32 bits generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Tag {
    index: u32,
    generation: u32,
}

impl Tag {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Packs the tag into the u64 used as kernel registration user-data.
    pub(crate) const fn pack(self) -> u64 {
        ((self.index as u64) << 32) | self.generation as u64
    }

    pub(crate) const fn unpack(raw: u64) -> Self {
        Self {
            index: (raw >> 32) as u32,
            generation: raw as u32,
        }
    }
}

/// The three FIFO queues and shutdown flag of one descriptor, guarded by
/// the descriptor lock.
pub(crate) struct OpQueues {
    queues: [VecDeque<Box<dyn Op>>; 3],
    shutdown: bool,
}

impl OpQueues {
    fn new() -> Self {
        Self {
            queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            shutdown: false,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub(crate) fn set_shutdown(&mut self) {
        self.shutdown = true;
    }

    pub(crate) fn queue(&self, kind: OpKind) -> &VecDeque<Box<dyn Op>> {
        &self.queues[kind.index()]
    }

    pub(crate) fn queue_mut(&mut self, kind: OpKind) -> &mut VecDeque<Box<dyn Op>> {
        &mut self.queues[kind.index()]
    }

    /// Drains every queued operation across all three kinds into `batch`,
    /// attaching `error` to each. Returns the number drained.
    pub(crate) fn drain_all_into(&mut self, error: OpError, batch: &mut ReadyBatch) -> usize {
        let mut drained = 0;
        for kind in OpKind::ALL {
            while let Some(mut op) = self.queues[kind.index()].pop_front() {
                op.set_error(error);
                batch.push(op);
                drained += 1;
            }
        }
        drained
    }
}

/// One registered descriptor's state record.
pub(crate) struct DescriptorState {
    fd: RawFd,
    tag: Tag,
    queues: Mutex<OpQueues>,
}

impl DescriptorState {
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn tag(&self) -> Tag {
        self.tag
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, OpQueues> {
        self.queues.lock()
    }
}

/// Opaque per-descriptor handle returned by
/// [`Reactor::register_descriptor`](crate::Reactor::register_descriptor).
///
/// `close_descriptor` nulls the handle; submitting through a nulled (or
/// default-constructed) handle completes the operation immediately with
/// [`OpError::BadDescriptor`]. The handle is not `Clone`: descriptor
/// state must not be reachable through caller copies after close.
#[derive(Default)]
pub struct DescriptorHandle {
    state: Option<Arc<DescriptorState>>,
}

impl DescriptorHandle {
    pub(crate) fn new(state: Arc<DescriptorState>) -> Self {
        Self { state: Some(state) }
    }

    pub(crate) fn state(&self) -> Option<&Arc<DescriptorState>> {
        self.state.as_ref()
    }

    pub(crate) fn take(&mut self) -> Option<Arc<DescriptorState>> {
        self.state.take()
    }

    /// Returns true if the handle has been closed (or never registered).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.is_none()
    }
}

impl std::fmt::Debug for DescriptorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.state {
            Some(state) => f
                .debug_struct("DescriptorHandle")
                .field("fd", &state.fd)
                .field("tag", &state.tag)
                .finish(),
            None => f.write_str("DescriptorHandle(closed)"),
        }
    }
}

enum Slot {
    Occupied {
        state: Arc<DescriptorState>,
        generation: u32,
    },
    Vacant {
        next_free: Option<u32>,
        generation: u32,
    },
}

struct Slots {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    len: usize,
}

/// Concurrency-guarded pool of descriptor state records.
pub(crate) struct Registry {
    inner: Mutex<Slots>,
    capacity: usize,
}

impl Registry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Slots {
                slots: Vec::new(),
                free_head: None,
                len: 0,
            }),
            capacity,
        }
    }

    /// Allocates a fresh record for `fd`. The record embeds its own tag.
    pub(crate) fn allocate(&self, fd: RawFd) -> Result<Arc<DescriptorState>, Error> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.len >= self.capacity {
            return Err(Error::Exhausted);
        }

        let state = if let Some(free_index) = inner.free_head {
            let slot = &mut inner.slots[free_index as usize];
            match slot {
                Slot::Vacant {
                    next_free,
                    generation,
                } => {
                    let generation = *generation;
                    let next_free = *next_free;
                    let state = Arc::new(DescriptorState {
                        fd,
                        tag: Tag::new(free_index, generation),
                        queues: Mutex::new(OpQueues::new()),
                    });
                    *slot = Slot::Occupied {
                        state: Arc::clone(&state),
                        generation,
                    };
                    inner.free_head = next_free;
                    state
                }
                Slot::Occupied { .. } => unreachable!("free list pointed to occupied slot"),
            }
        } else {
            let index = u32::try_from(inner.slots.len()).map_err(|_| Error::Exhausted)?;
            let state = Arc::new(DescriptorState {
                fd,
                tag: Tag::new(index, 0),
                queues: Mutex::new(OpQueues::new()),
            });
            inner.slots.push(Slot::Occupied {
                state: Arc::clone(&state),
                generation: 0,
            });
            state
        };

        inner.len += 1;
        Ok(state)
    }

    /// Resolves a kernel tag to its record. Stale tags (generation
    /// mismatch after free) resolve to `None` and the event is dropped.
    pub(crate) fn resolve(&self, tag: Tag) -> Option<Arc<DescriptorState>> {
        let inner = self.inner.lock();
        match inner.slots.get(tag.index as usize)? {
            Slot::Occupied { state, generation } if *generation == tag.generation => {
                Some(Arc::clone(state))
            }
            _ => None,
        }
    }

    /// Returns the record's slot to the free list, bumping the
    /// generation so outstanding kernel tags become meaningless.
    pub(crate) fn free(&self, tag: Tag) -> Option<Arc<DescriptorState>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let slot = inner.slots.get_mut(tag.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == tag.generation => {
                let next_generation = generation.wrapping_add(1);
                let old = std::mem::replace(
                    slot,
                    Slot::Vacant {
                        next_free: inner.free_head,
                        generation: next_generation,
                    },
                );
                inner.free_head = Some(tag.index);
                inner.len -= 1;
                match old {
                    Slot::Occupied { state, .. } => Some(state),
                    Slot::Vacant { .. } => unreachable!(),
                }
            }
            _ => None,
        }
    }

    /// Frees every live record and returns them, for shutdown.
    pub(crate) fn drain(&self) -> Vec<Arc<DescriptorState>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut drained = Vec::with_capacity(inner.len);
        let mut free_head = inner.free_head;
        for (index, slot) in inner.slots.iter_mut().enumerate() {
            if let Slot::Occupied { generation, .. } = slot {
                let next_generation = generation.wrapping_add(1);
                let old = std::mem::replace(
                    slot,
                    Slot::Vacant {
                        next_free: free_head,
                        generation: next_generation,
                    },
                );
                free_head = Some(index as u32);
                if let Slot::Occupied { state, .. } = old {
                    drained.push(state);
                }
            }
        }
        inner.free_head = free_head;
        inner.len = 0;
        drained
    }

    /// Number of live records.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_packs_and_unpacks() {
        let tag = Tag::new(7, 3);
        assert_eq!(Tag::unpack(tag.pack()), tag);
        assert_eq!(Tag::unpack(u64::MAX), Tag::new(u32::MAX, u32::MAX));
    }

    #[test]
    fn allocate_resolve_free() {
        let registry = Registry::new(8);
        let state = registry.allocate(5).expect("allocate");
        assert_eq!(state.fd(), 5);
        assert_eq!(registry.len(), 1);

        let resolved = registry.resolve(state.tag()).expect("resolve");
        assert_eq!(resolved.fd(), 5);

        registry.free(state.tag()).expect("free");
        assert_eq!(registry.len(), 0);
        assert!(registry.resolve(state.tag()).is_none());
    }

    #[test]
    fn freed_slot_reuses_index_with_new_generation() {
        let registry = Registry::new(8);
        let first = registry.allocate(1).expect("allocate");
        let first_tag = first.tag();
        registry.free(first_tag).expect("free");

        let second = registry.allocate(2).expect("allocate");
        assert_eq!(second.tag().index, first_tag.index);
        assert_ne!(second.tag().generation, first_tag.generation);

        // The stale tag must not resolve to the new occupant.
        assert!(registry.resolve(first_tag).is_none());
        assert_eq!(registry.resolve(second.tag()).unwrap().fd(), 2);
    }

    #[test]
    fn capacity_is_enforced() {
        let registry = Registry::new(2);
        let _a = registry.allocate(1).expect("allocate");
        let _b = registry.allocate(2).expect("allocate");
        assert!(matches!(registry.allocate(3), Err(Error::Exhausted)));
    }

    #[test]
    fn drain_frees_everything() {
        let registry = Registry::new(8);
        let a = registry.allocate(1).expect("allocate");
        let b = registry.allocate(2).expect("allocate");
        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.len(), 0);
        assert!(registry.resolve(a.tag()).is_none());
        assert!(registry.resolve(b.tag()).is_none());

        // Slots are reusable afterwards.
        let c = registry.allocate(3).expect("allocate");
        assert!(registry.resolve(c.tag()).is_some());
    }

    #[test]
    fn drain_all_into_empties_queues_in_order() {
        use crate::op::perform_op;
        let mut queues = OpQueues::new();
        queues.queue_mut(OpKind::Read).push_back(perform_op(|| true));
        queues.queue_mut(OpKind::Read).push_back(perform_op(|| true));
        queues.queue_mut(OpKind::Write).push_back(perform_op(|| true));
        queues
            .queue_mut(OpKind::Except)
            .push_back(perform_op(|| true));

        let mut batch = ReadyBatch::new();
        let drained = queues.drain_all_into(OpError::Aborted, &mut batch);
        assert_eq!(drained, 4);
        assert_eq!(batch.len(), 4);
        for kind in OpKind::ALL {
            assert!(queues.queue(kind).is_empty());
        }
        for op in batch {
            assert_eq!(op.error(), Some(OpError::Aborted));
        }
    }

    #[test]
    fn handle_default_is_closed() {
        let handle = DescriptorHandle::default();
        assert!(handle.is_closed());
        assert!(handle.state().is_none());
    }
}
