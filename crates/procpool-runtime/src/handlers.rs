//! Callback set bound to a pool
//!
//! Plain function pointers rather than closures: they carry no captured
//! state, so a forked worker can call them without sharing any heap with the
//! parent. Per-worker state belongs in statics or the startup callback's own
//! setup; aggregation state belongs in the control's context `C`.

use crate::sched::TaskSched;
use crate::worker::WorkerMode;
use procpool_core::TaskNode;

/// Error type startup callbacks may return
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Identity of the worker a lifecycle callback runs in
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext<'a> {
    pub worker_id: usize,
    pub pid: i32,
    pub pool_name: &'a str,
    pub mode: WorkerMode,
}

/// Per-worker one-time setup. An `Err` keeps the worker from going Idle and
/// fails `start`.
pub type StartupFn = fn(&WorkerContext<'_>) -> Result<(), BoxError>;

/// Runs one task. The result is whatever it leaves in `node.payload`;
/// the return value becomes the task's outcome.
pub type HandleFn<N> = fn(&TaskSched<N>, &mut TaskNode<N>) -> bool;

/// Per-worker teardown. `false` is logged, nothing more.
pub type CleanupFn = fn(&WorkerContext<'_>) -> bool;

/// Extracts the partition tag. Must depend only on the submitted payload.
pub type GetTagFn<N, K> = fn(&N) -> K;

/// Called in the draining client for each finished task
pub type FinishedFn<N, C> = fn(&TaskNode<N>, &mut C);

/// The worker-side callbacks
pub struct WorkerHandlers<N> {
    pub startup: StartupFn,
    pub handle: HandleFn<N>,
    pub cleanup: CleanupFn,
}

impl<N> WorkerHandlers<N> {
    pub const fn new(startup: StartupFn, handle: HandleFn<N>, cleanup: CleanupFn) -> Self {
        Self { startup, handle, cleanup }
    }

    /// Only a handler; startup and cleanup do nothing
    pub const fn handle_only(handle: HandleFn<N>) -> Self {
        Self::new(noop_startup, handle, noop_cleanup)
    }
}

impl<N> Clone for WorkerHandlers<N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<N> Copy for WorkerHandlers<N> {}

impl<N> std::fmt::Debug for WorkerHandlers<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandlers").finish_non_exhaustive()
    }
}

pub fn noop_startup(_ctx: &WorkerContext<'_>) -> Result<(), BoxError> {
    Ok(())
}

pub fn noop_cleanup(_ctx: &WorkerContext<'_>) -> bool {
    true
}
