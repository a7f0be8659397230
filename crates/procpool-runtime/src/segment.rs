//! Shared segment layout
//!
//! One contiguous mapping holds everything the ring and the workers share:
//!
//! ```text
//! +-----------------+  0
//! | SegmentHeader   |  creator pid, shutdown flag, ring lock + counters,
//! |                 |  work signal, completion counters
//! +-----------------+  workers_off
//! | WorkerEntry[W]  |  pid, lifecycle state, current slot, per-worker counters
//! +-----------------+  clients_off
//! | ClientEntry[C]  |  attached client pid + completion latch
//! +-----------------+  fifo_off
//! | u32[D]          |  queued slot indices in publish order
//! +-----------------+  slots_off
//! | SlotHeader[D]   |  state, outcome, owner client, worker
//! +-----------------+  payload_off
//! | payload[D]      |  D * stride bytes, stride = task size rounded to NODE_ALIGN
//! +-----------------+  total_size
//! ```
//!
//! Every cross-reference is an integer index, never a pointer, so the layout
//! means the same thing in every process that maps it. A zero-filled region is
//! a valid empty segment apart from the creator pid and the `NONE` markers,
//! which `create_in` writes before any worker exists. The pool's partition
//! index follows the segment in the same host region; see
//! `required_pool_memory`.

use crate::latch::{Latch, WorkSignal};
use crate::memory::SharedRegion;
use procpool_core::constants::{
    CACHE_LINE_SIZE, MAX_CLIENTS, MAX_QUEUE_DEPTH, MAX_WORKERS, NODE_ALIGN, NONE,
};
use procpool_core::error::{MemoryError, PoolError, PoolResult};
use procpool_core::{align_up, SlotState, SpinLock, TaskOutcome, WorkerState};
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Ring bookkeeping, guarded by `SegmentHeader::ring`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RingMeta {
    /// Next slot the allocator scans from
    pub head: u32,
    /// Oldest slot that may still be occupied; drain scans start here
    pub tail: u32,
    pub occupied: u32,
    pub queued: u32,
    pub running: u32,
    pub finished: u32,
    pub fifo_head: u32,
    pub fifo_len: u32,
}

#[repr(C, align(64))]
pub struct SegmentHeader {
    creator_pid: AtomicI32,

    pub(crate) shutdown: AtomicBool,
    pub(crate) ring: SpinLock<RingMeta>,
    pub(crate) work: WorkSignal,

    pub(crate) tasks_completed: AtomicU64,
    pub(crate) tasks_failed: AtomicU64,
    pub(crate) tasks_abandoned: AtomicU64,
}

impl SegmentHeader {
    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    #[inline]
    pub fn creator_pid(&self) -> i32 {
        self.creator_pid.load(Ordering::Relaxed)
    }
}

/// One entry per worker
#[repr(C, align(64))]
pub struct WorkerEntry {
    pub(crate) pid: AtomicI32,
    state: AtomicU8,
    pub(crate) current: AtomicU32,
    pub(crate) tasks_done: AtomicU64,
}

impl WorkerEntry {
    #[inline]
    pub fn state(&self) -> WorkerState {
        WorkerState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state.into(), Ordering::Release);
    }

    #[inline]
    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire)
    }

    /// Slot being executed, or `NONE`
    #[inline]
    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    #[inline]
    pub fn tasks_done(&self) -> u64 {
        self.tasks_done.load(Ordering::Relaxed)
    }
}

/// One entry per attached client process
#[repr(C, align(64))]
pub struct ClientEntry {
    pub(crate) pid: AtomicI32,
    pub(crate) latch: Latch,
}

impl ClientEntry {
    /// 0 when unclaimed
    #[inline]
    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire)
    }

    #[inline]
    pub fn latch(&self) -> &Latch {
        &self.latch
    }
}

/// Per-slot control word
///
/// `state` is only changed under the ring lock; readers outside the lock
/// use it as a hint and re-check under the lock before acting.
#[repr(C)]
pub struct SlotHeader {
    state: AtomicU8,
    outcome: AtomicU8,
    pub(crate) owner: AtomicU32,
    pub(crate) worker: AtomicU32,
}

impl SlotHeader {
    #[inline]
    pub fn state(&self) -> SlotState {
        SlotState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: SlotState) {
        debug_assert!(
            self.state().can_transition_to(state),
            "illegal slot transition {:?} -> {:?}",
            self.state(),
            state
        );
        self.state.store(state.into(), Ordering::Release);
    }

    #[inline]
    pub fn outcome(&self) -> TaskOutcome {
        TaskOutcome::from(self.outcome.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_outcome(&self, outcome: TaskOutcome) {
        self.outcome.store(outcome.into(), Ordering::Release);
    }

    /// Client index that submitted the task, or `NONE`
    #[inline]
    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Acquire)
    }

    /// Worker that claimed the task, or `NONE`
    #[inline]
    pub fn worker(&self) -> u32 {
        self.worker.load(Ordering::Acquire)
    }
}

/// Byte offsets of each table within the segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    pub worker_count: usize,
    pub queue_depth: usize,
    pub task_size: usize,
    /// Distance between consecutive payloads
    pub stride: usize,
    pub workers_off: usize,
    pub clients_off: usize,
    pub fifo_off: usize,
    pub slots_off: usize,
    pub payload_off: usize,
    pub total_size: usize,
}

impl SegmentLayout {
    pub fn new(worker_count: usize, task_size: usize, queue_depth: usize) -> Result<Self, MemoryError> {
        fn table(off: usize, count: usize, elem: usize) -> Result<usize, MemoryError> {
            count
                .checked_mul(elem)
                .and_then(|bytes| bytes.checked_add(off))
                .map(|end| align_up(end, CACHE_LINE_SIZE))
                .ok_or(MemoryError::TooLarge)
        }

        if task_size > u32::MAX as usize {
            return Err(MemoryError::TooLarge);
        }

        let stride = align_up(task_size.max(1), NODE_ALIGN);
        let workers_off = align_up(size_of::<SegmentHeader>(), CACHE_LINE_SIZE);
        let clients_off = table(workers_off, worker_count, size_of::<WorkerEntry>())?;
        let fifo_off = table(clients_off, MAX_CLIENTS, size_of::<ClientEntry>())?;
        let slots_off = table(fifo_off, queue_depth, size_of::<AtomicU32>())?;
        let payload_off = align_up(
            table(slots_off, queue_depth, size_of::<SlotHeader>())?,
            NODE_ALIGN,
        );
        let total_size = table(payload_off, queue_depth, stride)?;

        Ok(Self {
            worker_count,
            queue_depth,
            task_size,
            stride,
            workers_off,
            clients_off,
            fifo_off,
            slots_off,
            payload_off,
            total_size,
        })
    }
}

/// Bytes of shared memory a pool with these parameters needs
///
/// Covers the ring segment only. Hosts placing a whole pool in their own
/// memory size it with `required_pool_memory`, which adds the partition
/// index. Saturates to `usize::MAX` if the layout would overflow.
pub fn required_shared_memory(worker_count: usize, task_size: usize, queue_depth: usize) -> usize {
    SegmentLayout::new(worker_count, task_size, queue_depth)
        .map(|l| l.total_size)
        .unwrap_or(usize::MAX)
}

fn check_params(worker_count: usize, queue_depth: usize) -> PoolResult<()> {
    if worker_count == 0 || worker_count > MAX_WORKERS {
        return Err(PoolError::InvalidConfig("worker_count must be in 1..=MAX_WORKERS"));
    }
    if queue_depth == 0 || queue_depth > MAX_QUEUE_DEPTH {
        return Err(PoolError::InvalidConfig("queue_depth must be in 1..=MAX_QUEUE_DEPTH"));
    }
    Ok(())
}

/// The mapped segment plus its computed layout
pub struct Segment {
    region: SharedRegion,
    layout: SegmentLayout,
}

impl Segment {
    /// Map a standalone segment with no partition index behind it
    #[cfg(test)]
    pub(crate) fn create(worker_count: usize, task_size: usize, queue_depth: usize) -> PoolResult<Self> {
        check_params(worker_count, queue_depth)?;
        let layout = SegmentLayout::new(worker_count, task_size, queue_depth)?;
        Self::init(SharedRegion::map(layout.total_size)?, layout)
    }

    /// Initialize a segment inside host-provided shared memory
    ///
    /// Fails with `SizeMismatch` if `region` is smaller than
    /// [`required_shared_memory`] for the same parameters.
    pub fn create_in(
        mut region: SharedRegion,
        worker_count: usize,
        task_size: usize,
        queue_depth: usize,
    ) -> PoolResult<Self> {
        check_params(worker_count, queue_depth)?;
        let layout = SegmentLayout::new(worker_count, task_size, queue_depth)?;
        if region.len() < layout.total_size {
            return Err(PoolError::SizeMismatch {
                required: layout.total_size,
                actual: region.len(),
            });
        }
        if region.base() as usize % CACHE_LINE_SIZE != 0 {
            return Err(MemoryError::Misaligned(CACHE_LINE_SIZE).into());
        }
        region.clear();
        Self::init(region, layout)
    }

    fn init(region: SharedRegion, layout: SegmentLayout) -> PoolResult<Self> {
        let segment = Self { region, layout };
        let header = segment.header();
        header.creator_pid.store(std::process::id() as i32, Ordering::Relaxed);

        for slot in segment.slots() {
            slot.owner.store(NONE, Ordering::Relaxed);
            slot.worker.store(NONE, Ordering::Relaxed);
        }
        for worker in segment.workers() {
            worker.current.store(NONE, Ordering::Relaxed);
        }

        tracing::debug!(
            bytes = layout.total_size,
            workers = layout.worker_count,
            depth = layout.queue_depth,
            stride = layout.stride,
            "initialized shared segment"
        );
        Ok(segment)
    }

    #[inline]
    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    #[inline]
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    #[inline]
    pub fn header(&self) -> &SegmentHeader {
        // Safety: offset 0, size and alignment checked at construction
        unsafe { &*(self.region.base() as *const SegmentHeader) }
    }

    /// # Safety
    ///
    /// `off..off + count * size_of::<T>()` must lie in the region and hold `T`s.
    #[inline]
    unsafe fn table<T>(&self, off: usize, count: usize) -> &[T] {
        core::slice::from_raw_parts(self.region.base().add(off) as *const T, count)
    }

    #[inline]
    pub fn workers(&self) -> &[WorkerEntry] {
        unsafe { self.table(self.layout.workers_off, self.layout.worker_count) }
    }

    #[inline]
    pub fn clients(&self) -> &[ClientEntry] {
        unsafe { self.table(self.layout.clients_off, MAX_CLIENTS) }
    }

    #[inline]
    pub(crate) fn fifo(&self) -> &[AtomicU32] {
        unsafe { self.table(self.layout.fifo_off, self.layout.queue_depth) }
    }

    #[inline]
    pub fn slots(&self) -> &[SlotHeader] {
        unsafe { self.table(self.layout.slots_off, self.layout.queue_depth) }
    }

    /// Start of the payload bytes for slot `index`
    #[inline]
    pub(crate) fn payload_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.layout.queue_depth);
        unsafe {
            self.region
                .base()
                .add(self.layout.payload_off + index * self.layout.stride)
        }
    }
}

impl core::fmt::Debug for Segment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Segment")
            .field("region", &self.region)
            .field("layout", &self.layout)
            .finish()
    }
}
