//! Scheduler handle shared by workers and the control
//!
//! `TaskSched<N>` is what a handler receives: the pool's name, its segment and
//! a typed ring. It is cheap to clone and holds nothing process-local besides
//! the `Arc` around the mapping.

use crate::ring::{RingQueue, RingStats};
use crate::segment::Segment;
use procpool_core::error::PoolResult;
use procpool_core::WorkerState;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Worker lifecycle tally
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCounts {
    pub unused: usize,
    pub starting: usize,
    pub idle: usize,
    pub running: usize,
    pub draining: usize,
    pub stopped: usize,
    pub failed: usize,
}

impl WorkerCounts {
    fn add(&mut self, state: WorkerState) {
        match state {
            WorkerState::Unused => self.unused += 1,
            WorkerState::Starting => self.starting += 1,
            WorkerState::Idle => self.idle += 1,
            WorkerState::Running => self.running += 1,
            WorkerState::Draining => self.draining += 1,
            WorkerState::Stopped => self.stopped += 1,
            WorkerState::Failed => self.failed += 1,
        }
    }

    /// Workers that got past startup and have not terminated
    pub fn live(&self) -> usize {
        self.idle + self.running + self.draining
    }
}

/// Point-in-time pool statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub ring: RingStats,
    pub workers: WorkerCounts,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_abandoned: u64,
}

/// Handle to a pool's shared state
pub struct TaskSched<N> {
    name: Arc<str>,
    ring: RingQueue<N>,
}

impl<N> Clone for TaskSched<N> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            ring: self.ring.clone(),
        }
    }
}

impl<N> TaskSched<N> {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn ring(&self) -> &RingQueue<N> {
        &self.ring
    }

    #[inline]
    pub fn segment(&self) -> &Arc<Segment> {
        self.ring.segment()
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.segment().layout().worker_count
    }

    #[inline]
    pub fn queue_depth(&self) -> usize {
        self.segment().layout().queue_depth
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.segment().header().is_shutdown()
    }
}

impl<N: Copy> TaskSched<N> {
    /// Standalone scheduler over a fresh segment sized for `N`
    #[cfg(test)]
    pub(crate) fn create(name: &str, worker_count: usize, queue_depth: usize) -> PoolResult<Self> {
        let segment = Segment::create(worker_count, std::mem::size_of::<N>(), queue_depth)?;
        Self::with_segment(name, segment)
    }

    /// Use an already initialized segment
    pub fn with_segment(name: &str, segment: Segment) -> PoolResult<Self> {
        let ring = RingQueue::new(Arc::new(segment))?;
        Ok(Self { name: Arc::from(name), ring })
    }

    /// No slot is Queued or Running
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.ring.is_idle()
    }

    pub fn worker_state(&self, worker: usize) -> Option<WorkerState> {
        self.segment().workers().get(worker).map(|w| w.state())
    }

    pub fn stats(&self) -> PoolStats {
        let segment = self.segment();
        let header = segment.header();
        let mut workers = WorkerCounts::default();
        for w in segment.workers() {
            workers.add(w.state());
        }
        PoolStats {
            ring: self.ring.stats(),
            workers,
            tasks_completed: header.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: header.tasks_failed.load(Ordering::Relaxed),
            tasks_abandoned: header.tasks_abandoned.load(Ordering::Relaxed),
        }
    }
}

impl<N> std::fmt::Debug for TaskSched<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSched")
            .field("name", &self.name)
            .field("segment", self.ring.segment())
            .finish()
    }
}
