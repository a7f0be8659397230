//! Shared ring of task slots
//!
//! Slots cycle `Free -> Queued -> Running -> Finished -> Free`. Every state
//! change happens under the segment's ring lock, which is never held across a
//! payload copy that could be long, a handler call, or a wait.
//!
//! Who may touch a slot is decided by its state: the submitter between
//! `try_allocate` and `publish`, one worker while Running, the owning client
//! while Finished. Payload bytes are therefore copied outside the lock.
//!
//! Queued slots are handed to workers in publish order through a FIFO of slot
//! indices kept next to the slot table.

use crate::segment::Segment;
use procpool_core::constants::{MAX_CLIENTS, NODE_ALIGN, NONE};
use procpool_core::error::{MemoryError, PoolError, PoolResult};
use procpool_core::{SlotIndex, SlotState, TaskNode, TaskOutcome};
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Snapshot of slot occupancy
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub depth: usize,
    pub occupied: usize,
    pub queued: usize,
    pub running: usize,
    pub finished: usize,
}

/// Typed view of the ring inside a segment
pub struct RingQueue<N> {
    segment: Arc<Segment>,
    _marker: PhantomData<fn() -> N>,
}

impl<N> Clone for RingQueue<N> {
    fn clone(&self) -> Self {
        Self {
            segment: Arc::clone(&self.segment),
            _marker: PhantomData,
        }
    }
}

impl<N> RingQueue<N> {
    #[inline]
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }
}

impl<N: Copy> RingQueue<N> {
    /// Bind `N` to a segment whose slots are large enough for it
    pub fn new(segment: Arc<Segment>) -> PoolResult<Self> {
        if align_of::<N>() > NODE_ALIGN {
            return Err(MemoryError::Misaligned(align_of::<N>()).into());
        }
        let stride = segment.layout().stride;
        if size_of::<N>() > stride {
            return Err(PoolError::SizeMismatch {
                required: size_of::<N>(),
                actual: stride,
            });
        }
        Ok(Self {
            segment,
            _marker: PhantomData,
        })
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.segment.layout().queue_depth
    }

    #[inline]
    pub fn slot_state(&self, slot: SlotIndex) -> SlotState {
        self.segment.slots()[slot.as_usize()].state()
    }

    /// Reserve a Free slot for client `owner`
    ///
    /// The slot is marked Queued but is not visible to workers until
    /// `publish`. Returns `None` when every slot is occupied.
    pub fn try_allocate(&self, owner: u32) -> Option<SlotIndex> {
        let header = self.segment.header();
        let slots = self.segment.slots();
        let depth = slots.len();

        let mut meta = header.ring.lock();
        if meta.occupied as usize >= depth {
            return None;
        }

        // occupied < depth, so the scan always ends on a Free slot
        let mut idx = meta.head as usize;
        for _ in 0..depth {
            if slots[idx].state() == SlotState::Free {
                break;
            }
            idx = (idx + 1) % depth;
        }
        let slot = &slots[idx];
        if slot.state() != SlotState::Free {
            tracing::error!(occupied = meta.occupied, depth, "ring counters disagree with slot table");
            return None;
        }

        slot.owner.store(owner, Ordering::Relaxed);
        slot.worker.store(NONE, Ordering::Relaxed);
        slot.set_outcome(TaskOutcome::Pending);
        slot.set_state(SlotState::Queued);

        if meta.occupied == 0 {
            meta.tail = idx as u32;
        }
        meta.occupied += 1;
        meta.queued += 1;
        meta.head = ((idx + 1) % depth) as u32;

        Some(SlotIndex::new(idx as u32))
    }

    /// Copy `payload` into an allocated slot and hand it to the workers
    pub fn publish(&self, slot: SlotIndex, payload: &N) {
        let idx = slot.as_usize();
        // Safety: slot was allocated by the caller and is not yet in the FIFO,
        // so nothing else reads or writes its payload.
        unsafe { std::ptr::write(self.segment.payload_ptr(idx) as *mut N, *payload) };

        let header = self.segment.header();
        {
            let mut meta = header.ring.lock();
            debug_assert_eq!(self.segment.slots()[idx].state(), SlotState::Queued);
            let depth = self.depth() as u32;
            let pos = (meta.fifo_head + meta.fifo_len) % depth;
            self.segment.fifo()[pos as usize].store(slot.as_u32(), Ordering::Relaxed);
            meta.fifo_len += 1;
        }
        header.work.notify_one();
    }

    /// Take the oldest published slot for `worker`, marking it Running
    pub fn claim_next(&self, worker: u32) -> Option<SlotIndex> {
        let mut meta = self.segment.header().ring.lock();
        if meta.fifo_len == 0 {
            return None;
        }

        let depth = self.depth() as u32;
        let idx = self.segment.fifo()[meta.fifo_head as usize].load(Ordering::Relaxed);
        meta.fifo_head = (meta.fifo_head + 1) % depth;
        meta.fifo_len -= 1;

        let slot = &self.segment.slots()[idx as usize];
        slot.worker.store(worker, Ordering::Relaxed);
        slot.set_state(SlotState::Running);
        meta.queued -= 1;
        meta.running += 1;

        Some(SlotIndex::new(idx))
    }

    /// Copy a slot's payload out
    ///
    /// Only meaningful for a slot the caller currently owns (Running for a
    /// worker, Finished for its submitter).
    #[inline]
    pub fn load(&self, slot: SlotIndex) -> N {
        // Safety: payload was written by publish or complete and the caller
        // owns the slot in its current state.
        unsafe { std::ptr::read(self.segment.payload_ptr(slot.as_usize()) as *const N) }
    }

    /// Store the handler's result and mark the slot Finished
    ///
    /// Sets the owning client's latch.
    pub fn complete(&self, slot: SlotIndex, result: &N, outcome: TaskOutcome) {
        let idx = slot.as_usize();
        // Safety: the calling worker holds the slot in Running
        unsafe { std::ptr::write(self.segment.payload_ptr(idx) as *mut N, *result) };
        self.finish(idx, outcome);
    }

    /// Mark a Running slot whose worker died as Finished/Abandoned
    ///
    /// The payload is left as the worker last wrote it. Returns `false` if the
    /// slot was not Running.
    pub fn abandon(&self, slot: SlotIndex) -> bool {
        if self.slot_state(slot) != SlotState::Running {
            return false;
        }
        self.finish(slot.as_usize(), TaskOutcome::Abandoned)
    }

    fn finish(&self, idx: usize, outcome: TaskOutcome) -> bool {
        let header = self.segment.header();
        let slot = &self.segment.slots()[idx];
        let owner;
        {
            let mut meta = header.ring.lock();
            if slot.state() != SlotState::Running {
                return false;
            }
            slot.set_outcome(outcome);
            slot.set_state(SlotState::Finished);
            meta.running -= 1;
            meta.finished += 1;
            owner = slot.owner();
        }

        header.tasks_completed.fetch_add(1, Ordering::Relaxed);
        match outcome {
            TaskOutcome::Failed => {
                header.tasks_failed.fetch_add(1, Ordering::Relaxed);
            }
            TaskOutcome::Abandoned => {
                header.tasks_abandoned.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        if (owner as usize) < MAX_CLIENTS {
            self.segment.clients()[owner as usize].latch.set();
        }
        true
    }

    /// Copy a Finished slot into a task node without freeing it
    pub fn peek(&self, slot: SlotIndex) -> Option<TaskNode<N>> {
        let header = &self.segment.slots()[slot.as_usize()];
        if header.state() != SlotState::Finished {
            return None;
        }
        Some(TaskNode::from_parts(
            slot,
            SlotState::Finished,
            header.outcome(),
            self.load(slot),
        ))
    }

    /// Return a Finished slot to Free, yielding its final contents
    pub fn reclaim(&self, slot: SlotIndex) -> Option<TaskNode<N>> {
        let idx = slot.as_usize();
        let slots = self.segment.slots();
        let depth = slots.len();
        let header = &slots[idx];

        let node = self.peek(slot)?;
        {
            let mut meta = self.segment.header().ring.lock();
            if header.state() != SlotState::Finished {
                return None;
            }
            header.owner.store(NONE, Ordering::Relaxed);
            header.worker.store(NONE, Ordering::Relaxed);
            header.set_state(SlotState::Free);
            meta.finished -= 1;
            meta.occupied -= 1;

            while meta.occupied > 0 && slots[meta.tail as usize].state() == SlotState::Free {
                meta.tail = ((meta.tail as usize + 1) % depth) as u32;
            }
        }
        Some(node)
    }

    /// Finished slots owned by `owner` right now
    pub fn finished_count(&self, owner: u32) -> usize {
        let _meta = self.segment.header().ring.lock();
        self.segment
            .slots()
            .iter()
            .filter(|s| s.state() == SlotState::Finished && s.owner() == owner)
            .count()
    }

    /// Slot indices in ring order, starting at the oldest occupied slot
    pub fn scan_order(&self) -> impl Iterator<Item = SlotIndex> {
        let depth = self.depth();
        let tail = self.segment.header().ring.lock().tail as usize;
        (0..depth).map(move |i| SlotIndex::new(((tail + i) % depth) as u32))
    }

    /// Whether `slot` is Finished and belongs to `owner`
    #[inline]
    pub fn is_finished_for(&self, slot: SlotIndex, owner: u32) -> bool {
        let header = &self.segment.slots()[slot.as_usize()];
        header.state() == SlotState::Finished && header.owner() == owner
    }

    /// Running slots claimed by `worker`
    pub fn running_on(&self, worker: u32) -> Vec<SlotIndex> {
        let _meta = self.segment.header().ring.lock();
        self.segment
            .slots()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state() == SlotState::Running && s.worker() == worker)
            .map(|(i, _)| SlotIndex::new(i as u32))
            .collect()
    }

    /// No slot is Queued or Running
    pub fn is_idle(&self) -> bool {
        let meta = self.segment.header().ring.lock();
        meta.queued == 0 && meta.running == 0
    }

    pub fn occupied(&self) -> usize {
        self.segment.header().ring.lock().occupied as usize
    }

    pub fn stats(&self) -> RingStats {
        let meta = *self.segment.header().ring.lock();
        RingStats {
            depth: self.depth(),
            occupied: meta.occupied as usize,
            queued: meta.queued as usize,
            running: meta.running as usize,
            finished: meta.finished as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Job {
        key: u32,
        value: u64,
    }

    fn ring(depth: usize) -> RingQueue<Job> {
        let seg = Arc::new(Segment::create(1, size_of::<Job>(), depth).unwrap());
        RingQueue::new(seg).unwrap()
    }

    #[test]
    fn test_full_lifecycle() {
        let ring = ring(4);
        let slot = ring.try_allocate(0).unwrap();
        assert_eq!(ring.slot_state(slot), SlotState::Queued);
        ring.publish(slot, &Job { key: 1, value: 10 });

        let claimed = ring.claim_next(0).unwrap();
        assert_eq!(claimed, slot);
        assert_eq!(ring.slot_state(slot), SlotState::Running);
        assert_eq!(ring.stats().running, 1);

        let mut job = ring.load(slot);
        job.value *= 2;
        ring.complete(slot, &job, TaskOutcome::Succeeded);
        assert!(ring.is_finished_for(slot, 0));
        assert!(ring.is_idle());
        assert_eq!(ring.occupied(), 1);
        assert!(ring.segment().clients()[0].latch().is_set());

        let node = ring.reclaim(slot).unwrap();
        assert_eq!(node.payload, Job { key: 1, value: 20 });
        assert_eq!(node.outcome(), TaskOutcome::Succeeded);
        assert_eq!(ring.slot_state(slot), SlotState::Free);
        assert_eq!(ring.stats(), RingStats { depth: 4, ..Default::default() });
    }

    #[test]
    fn test_allocate_until_full() {
        let ring = ring(3);
        let slots: Vec<_> = (0..3).map(|_| ring.try_allocate(0).unwrap()).collect();
        assert_eq!(slots.len(), 3);
        assert!(ring.try_allocate(0).is_none());
        assert_eq!(ring.occupied(), 3);
    }

    #[test]
    fn test_claims_in_publish_order() {
        let ring = ring(4);
        let a = ring.try_allocate(0).unwrap();
        let b = ring.try_allocate(0).unwrap();
        // publish out of allocation order
        ring.publish(b, &Job { key: 2, value: 0 });
        ring.publish(a, &Job { key: 1, value: 0 });
        assert_eq!(ring.claim_next(0), Some(b));
        assert_eq!(ring.claim_next(0), Some(a));
        assert_eq!(ring.claim_next(0), None);
    }

    #[test]
    fn test_unpublished_slot_not_claimable() {
        let ring = ring(2);
        let _slot = ring.try_allocate(0).unwrap();
        assert_eq!(ring.claim_next(0), None);
    }

    #[test]
    fn test_reclaim_requires_finished() {
        let ring = ring(2);
        let slot = ring.try_allocate(0).unwrap();
        assert!(ring.reclaim(slot).is_none());
        ring.publish(slot, &Job { key: 0, value: 0 });
        assert!(ring.reclaim(slot).is_none());
        ring.claim_next(0).unwrap();
        assert!(ring.reclaim(slot).is_none());
    }

    #[test]
    fn test_freed_slot_reused_after_wrap() {
        let ring = ring(2);
        for round in 0..5u32 {
            let slot = ring.try_allocate(0).unwrap();
            ring.publish(slot, &Job { key: round, value: 0 });
            ring.claim_next(0).unwrap();
            ring.complete(slot, &Job { key: round, value: 1 }, TaskOutcome::Succeeded);
            assert_eq!(ring.reclaim(slot).unwrap().payload.key, round);
        }
        assert_eq!(ring.occupied(), 0);
    }

    #[test]
    fn test_finished_count_per_owner() {
        let ring = ring(4);
        for owner in [0, 1, 1] {
            let slot = ring.try_allocate(owner).unwrap();
            ring.publish(slot, &Job { key: owner, value: 0 });
            let s = ring.claim_next(0).unwrap();
            ring.complete(s, &ring.load(s), TaskOutcome::Succeeded);
        }
        assert_eq!(ring.finished_count(0), 1);
        assert_eq!(ring.finished_count(1), 2);
        assert_eq!(ring.finished_count(2), 0);
    }

    #[test]
    fn test_abandon_running_slot() {
        let ring = ring(2);
        let slot = ring.try_allocate(0).unwrap();
        ring.publish(slot, &Job { key: 7, value: 0 });
        assert!(!ring.abandon(slot));
        ring.claim_next(3).unwrap();
        assert_eq!(ring.running_on(3), vec![slot]);
        assert!(ring.abandon(slot));
        let node = ring.reclaim(slot).unwrap();
        assert_eq!(node.outcome(), TaskOutcome::Abandoned);
        assert_eq!(ring.segment().header().tasks_abandoned.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_oversized_node_rejected() {
        #[derive(Clone, Copy)]
        struct Big([u8; 256]);
        let seg = Arc::new(Segment::create(1, 8, 2).unwrap());
        assert!(matches!(
            RingQueue::<Big>::new(seg),
            Err(PoolError::SizeMismatch { required: 256, actual: 64 })
        ));
    }

    #[test]
    fn test_scan_starts_at_tail() {
        let ring = ring(4);
        let first = ring.try_allocate(0).unwrap();
        let second = ring.try_allocate(0).unwrap();
        ring.publish(first, &Job { key: 0, value: 0 });
        ring.claim_next(0).unwrap();
        ring.complete(first, &Job { key: 0, value: 0 }, TaskOutcome::Succeeded);
        ring.reclaim(first).unwrap();

        assert_eq!(ring.scan_order().next(), Some(second));
        assert_eq!(ring.scan_order().count(), 4);
    }
}
