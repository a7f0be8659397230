//! Worker lifecycle
//!
//! Workers are forked processes (or, for tests and embedding, OS threads)
//! that run the same loop: startup callback, then claim/execute/complete until
//! shutdown, then cleanup. Each worker publishes its lifecycle state in its
//! `WorkerEntry` in the segment so the creator can watch startup and detect
//! workers that died.

use crate::handlers::{WorkerContext, WorkerHandlers};
use crate::sched::TaskSched;
use procpool_core::constants::NONE;
use procpool_core::error::{PoolResult, WorkerError};
use procpool_core::{SlotIndex, SlotState, TaskNode, TaskOutcome, WorkerState};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace, warn};

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

/// Exit code of a worker process whose loop panicked
const PANIC_EXIT_CODE: i32 = 101;

/// How workers are run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// One forked process per worker
    Process,
    /// One OS thread per worker, same loop and shared segment
    Thread,
}

impl FromStr for WorkerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" | "proc" | "fork" => Ok(WorkerMode::Process),
            "thread" | "threads" => Ok(WorkerMode::Thread),
            other => Err(format!("unknown worker mode '{}'", other)),
        }
    }
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerMode::Process => f.write_str("process"),
            WorkerMode::Thread => f.write_str("thread"),
        }
    }
}

enum WorkerHandle {
    Process(Pid),
    Thread(JoinHandle<bool>),
    Reaped,
}

/// Spawned workers of one pool
pub struct WorkerPool {
    mode: WorkerMode,
    num_workers: usize,
    handles: Vec<WorkerHandle>,
}

impl WorkerPool {
    pub fn new(mode: WorkerMode, num_workers: usize) -> Self {
        Self {
            mode,
            num_workers,
            handles: Vec::with_capacity(num_workers),
        }
    }

    /// Spawn every worker
    ///
    /// `worker_fn(id)` returns `true` on a clean stop. On a spawn failure the
    /// workers already spawned stay in the pool so the caller can stop and
    /// join them.
    pub fn start<F>(&mut self, name: &str, worker_fn: F) -> PoolResult<()>
    where
        F: Fn(usize) -> bool + Send + Sync + Clone + 'static,
    {
        for id in self.handles.len()..self.num_workers {
            let handle = match self.mode {
                WorkerMode::Process => Self::spawn_process(id, worker_fn.clone())?,
                WorkerMode::Thread => {
                    let worker_fn = worker_fn.clone();
                    let handle = thread::Builder::new()
                        .name(format!("{}-worker-{}", name, id))
                        .spawn(move || worker_fn(id))
                        .map_err(|e| WorkerError::SpawnFailed(e.raw_os_error().unwrap_or(0)))?;
                    WorkerHandle::Thread(handle)
                }
            };
            self.handles.push(handle);
        }
        Ok(())
    }

    fn spawn_process<F>(id: usize, worker_fn: F) -> PoolResult<WorkerHandle>
    where
        F: Fn(usize) -> bool,
    {
        // Safety: the child only runs the worker loop and leaves via _exit,
        // never returning into the caller's stack or running its destructors.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                trace!(worker = id, pid = child.as_raw(), "forked worker");
                Ok(WorkerHandle::Process(child))
            }
            Ok(ForkResult::Child) => {
                let code = match panic::catch_unwind(AssertUnwindSafe(|| worker_fn(id))) {
                    Ok(true) => 0,
                    Ok(false) => 1,
                    Err(_) => PANIC_EXIT_CODE,
                };
                unsafe { libc::_exit(code) }
            }
            Err(errno) => Err(WorkerError::SpawnFailed(errno as i32).into()),
        }
    }

    /// Wait for every worker to exit
    ///
    /// All workers are joined even if some fail; the first failure is
    /// returned.
    pub fn join(&mut self) -> PoolResult<()> {
        let mut first_failure = None;
        for (id, handle) in self.handles.iter_mut().enumerate() {
            let clean = match std::mem::replace(handle, WorkerHandle::Reaped) {
                WorkerHandle::Process(pid) => match waitpid(pid, None) {
                    Ok(WaitStatus::Exited(_, 0)) => true,
                    Ok(status) => {
                        warn!(worker = id, ?status, "worker process exited abnormally");
                        false
                    }
                    Err(e) => {
                        warn!(worker = id, error = %e, "waitpid failed");
                        false
                    }
                },
                WorkerHandle::Thread(h) => match h.join() {
                    Ok(clean) => clean,
                    Err(_) => {
                        warn!(worker = id, "worker thread panicked");
                        false
                    }
                },
                WorkerHandle::Reaped => true,
            };
            if !clean && first_failure.is_none() {
                first_failure = Some(id);
            }
        }

        match first_failure {
            Some(worker) => Err(WorkerError::JoinFailed { worker }.into()),
            None => Ok(()),
        }
    }

    /// Collect workers that have exited without blocking
    ///
    /// Returns their ids. Each worker is reported at most once.
    pub fn reap_exited(&mut self) -> Vec<usize> {
        let mut exited = Vec::new();
        for (id, handle) in self.handles.iter_mut().enumerate() {
            let done = match handle {
                WorkerHandle::Process(pid) => {
                    match waitpid(*pid, Some(WaitPidFlag::WNOHANG)) {
                        Ok(WaitStatus::StillAlive) => false,
                        Ok(status) => {
                            debug!(worker = id, ?status, "reaped worker process");
                            true
                        }
                        Err(_) => true,
                    }
                }
                WorkerHandle::Thread(h) => h.is_finished(),
                WorkerHandle::Reaped => false,
            };
            if done {
                if let WorkerHandle::Thread(h) = std::mem::replace(handle, WorkerHandle::Reaped) {
                    let _ = h.join();
                }
                exited.push(id);
            }
        }
        exited
    }

    #[inline]
    pub fn mode(&self) -> WorkerMode {
        self.mode
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Workers spawned and not yet reaped
    pub fn live(&self) -> usize {
        self.handles
            .iter()
            .filter(|h| !matches!(h, WorkerHandle::Reaped))
            .count()
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("mode", &self.mode)
            .field("num_workers", &self.num_workers)
            .field("live", &self.live())
            .finish()
    }
}

/// Body of every worker
///
/// Returns `true` if the worker started and stopped cleanly.
pub(crate) fn worker_main<N: Copy>(
    sched: &TaskSched<N>,
    handlers: &WorkerHandlers<N>,
    mode: WorkerMode,
    id: usize,
) -> bool {
    let segment = sched.segment();
    let entry = &segment.workers()[id];
    let pid = std::process::id() as i32;

    entry.pid.store(pid, Ordering::Release);
    entry.set_state(WorkerState::Starting);

    let ctx = WorkerContext {
        worker_id: id,
        pid,
        pool_name: sched.name(),
        mode,
    };

    let started = panic::catch_unwind(AssertUnwindSafe(|| (handlers.startup)(&ctx)));
    match started {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(pool = sched.name(), worker = id, error = %e, "worker startup failed");
            entry.set_state(WorkerState::Failed);
            return false;
        }
        Err(_) => {
            error!(pool = sched.name(), worker = id, "worker startup panicked");
            entry.set_state(WorkerState::Failed);
            return false;
        }
    }

    entry.set_state(WorkerState::Idle);
    debug!(pool = sched.name(), worker = id, pid, "worker idle");

    let work = &segment.header().work;
    loop {
        let token = work.prepare();

        if let Some(slot) = sched.ring().claim_next(id as u32) {
            entry.current.store(slot.as_u32(), Ordering::Release);
            entry.set_state(WorkerState::Running);

            run_task(sched, handlers, id, slot);

            entry.tasks_done.fetch_add(1, Ordering::Relaxed);
            entry.current.store(NONE, Ordering::Release);
            entry.set_state(WorkerState::Idle);
            continue;
        }

        // Queue is empty; shutdown only takes effect once it is
        if sched.is_shutdown() {
            break;
        }

        work.wait(token, None);
    }

    entry.set_state(WorkerState::Draining);
    debug!(pool = sched.name(), worker = id, tasks = entry.tasks_done(), "worker draining");

    let cleaned = match panic::catch_unwind(AssertUnwindSafe(|| (handlers.cleanup)(&ctx))) {
        Ok(ok) => ok,
        Err(_) => false,
    };
    if !cleaned {
        warn!(pool = sched.name(), worker = id, "worker cleanup reported failure");
    }

    entry.set_state(WorkerState::Stopped);
    debug!(pool = sched.name(), worker = id, "worker stopped");
    true
}

fn run_task<N: Copy>(sched: &TaskSched<N>, handlers: &WorkerHandlers<N>, id: usize, slot: SlotIndex) {
    let ring = sched.ring();
    let mut node = TaskNode::from_parts(slot, SlotState::Running, TaskOutcome::Pending, ring.load(slot));

    let ok = match panic::catch_unwind(AssertUnwindSafe(|| (handlers.handle)(sched, &mut node))) {
        Ok(ok) => ok,
        Err(_) => {
            warn!(pool = sched.name(), worker = id, %slot, "task handler panicked");
            false
        }
    };

    ring.complete(slot, &node.payload, TaskOutcome::from_handler(ok));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{noop_cleanup, noop_startup, BoxError};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn double(_: &TaskSched<u64>, node: &mut TaskNode<u64>) -> bool {
        node.payload *= 2;
        true
    }

    fn reject_odd(_: &TaskSched<u64>, node: &mut TaskNode<u64>) -> bool {
        if node.payload % 2 == 1 {
            panic!("odd payload");
        }
        node.payload % 4 == 0
    }

    fn failing_startup(_: &WorkerContext<'_>) -> Result<(), BoxError> {
        Err("no cache".into())
    }

    fn wait_for_state(sched: &TaskSched<u64>, id: usize, want: WorkerState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while sched.worker_state(id) != Some(want) {
            assert!(Instant::now() < deadline, "worker never reached {}", want);
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("process".parse::<WorkerMode>(), Ok(WorkerMode::Process));
        assert_eq!("Thread".parse::<WorkerMode>(), Ok(WorkerMode::Thread));
        assert!("fiber".parse::<WorkerMode>().is_err());
        assert_eq!(WorkerMode::Thread.to_string(), "thread");
    }

    #[test]
    fn test_thread_worker_runs_and_stops() {
        let sched = TaskSched::<u64>::create("unit", 1, 4).unwrap();
        let handlers = WorkerHandlers::new(noop_startup, double, noop_cleanup);
        let mut pool = WorkerPool::new(WorkerMode::Thread, 1);
        let s = sched.clone();
        pool.start("unit", move |id| worker_main(&s, &handlers, WorkerMode::Thread, id))
            .unwrap();
        wait_for_state(&sched, 0, WorkerState::Idle);

        let ring = sched.ring();
        let slot = ring.try_allocate(0).unwrap();
        ring.publish(slot, &21);

        let deadline = Instant::now() + Duration::from_secs(5);
        while ring.slot_state(slot) != SlotState::Finished {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        let node = ring.reclaim(slot).unwrap();
        assert_eq!(node.payload, 42);
        assert!(node.succeeded());

        sched.segment().header().shutdown.store(true, Ordering::Release);
        sched.segment().header().work.notify_all();
        pool.join().unwrap();
        assert_eq!(sched.worker_state(0), Some(WorkerState::Stopped));
        assert_eq!(sched.segment().workers()[0].tasks_done(), 1);
    }

    #[test]
    fn test_handler_failure_and_panic_recorded() {
        let sched = TaskSched::<u64>::create("unit", 1, 4).unwrap();
        let handlers = WorkerHandlers::handle_only(reject_odd);
        let ring = sched.ring();

        // Queue before starting; shutdown is already requested, so the
        // worker drains these and exits.
        let slots: Vec<_> = [4u64, 6, 7]
            .iter()
            .map(|v| {
                let slot = ring.try_allocate(0).unwrap();
                ring.publish(slot, v);
                slot
            })
            .collect();
        sched.segment().header().shutdown.store(true, Ordering::Release);

        let mut pool = WorkerPool::new(WorkerMode::Thread, 1);
        let s = sched.clone();
        pool.start("unit", move |id| worker_main(&s, &handlers, WorkerMode::Thread, id))
            .unwrap();
        pool.join().unwrap();

        let outcomes: Vec<_> = slots.iter().map(|&s| ring.reclaim(s).unwrap().outcome()).collect();
        assert_eq!(
            outcomes,
            vec![TaskOutcome::Succeeded, TaskOutcome::Failed, TaskOutcome::Failed]
        );
        assert_eq!(sched.stats().tasks_failed, 2);
    }

    #[test]
    fn test_startup_failure_marks_failed() {
        let sched = TaskSched::<u64>::create("unit", 1, 2).unwrap();
        let handlers = WorkerHandlers::new(failing_startup, double, noop_cleanup);
        let mut pool = WorkerPool::new(WorkerMode::Thread, 1);
        let s = sched.clone();
        pool.start("unit", move |id| worker_main(&s, &handlers, WorkerMode::Thread, id))
            .unwrap();

        assert!(matches!(
            pool.join(),
            Err(procpool_core::PoolError::Worker(WorkerError::JoinFailed { worker: 0 }))
        ));
        assert_eq!(sched.worker_state(0), Some(WorkerState::Failed));
    }

    #[test]
    fn test_reap_exited_threads() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(WorkerMode::Thread, 2);
        let r = Arc::clone(&ran);
        pool.start("unit", move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut reaped = Vec::new();
        while reaped.len() < 2 {
            assert!(Instant::now() < deadline);
            reaped.extend(pool.reap_exited());
            thread::sleep(Duration::from_millis(1));
        }
        reaped.sort_unstable();
        assert_eq!(reaped, vec![0, 1]);
        assert_eq!(pool.live(), 0);
        assert!(pool.reap_exited().is_empty());
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }
}
