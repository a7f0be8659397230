//! Scheduler control
//!
//! `TaskSchedCtl` is the client-facing side of a pool. It owns the segment
//! (through `TaskSched`), the partition index, the registered callbacks and
//! the aggregation context, and drives the protocol:
//!
//! ```text
//! create -> register_handlers -> [register_completion] -> start
//!        -> { submit | drain_finished | wait }* -> release
//! ```
//!
//! `submit` reserves the task's tag before allocating a slot, so two tasks
//! with equal tags are never in flight together. The reservation is held
//! until the finished task is drained, after the completion callback ran.
//!
//! A control created before workers are forked is inherited by every child.
//! Any process may submit and drain its own tasks; only the creating process
//! may start, recover, or release the pool. A client process that exits
//! without dropping its control leaves its entry behind; the next process to
//! attach takes that entry over, and with it the dead client's unfinished and
//! undrained tasks.
//!
//! All shared state lives in one region, sized by [`required_pool_memory`]:
//!
//! ```text
//! [ring segment][pad to 64][partition index]
//! ```

use crate::config::PoolConfig;
use crate::handlers::{
    CleanupFn, FinishedFn, GetTagFn, HandleFn, StartupFn, WorkerHandlers,
};
use crate::latch::WakeReason;
use crate::memory::SharedRegion;
use crate::ring::RingQueue;
use crate::sched::{PoolStats, TaskSched};
use crate::segment::{Segment, SegmentLayout};
use crate::worker::{worker_main, WorkerMode, WorkerPool};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use procpool_core::constants::{CACHE_LINE_SIZE, MAX_CLIENTS};
use procpool_core::error::{MemoryError, Misuse, PoolError, PoolResult, WorkerError};
use procpool_core::{PartitionIndex, SlotIndex, TagOps, TaskNode, WorkerState};
use std::mem::size_of;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Poll interval while waiting for workers to report in
const STARTUP_POLL: Duration = Duration::from_millis(1);

/// Upper bound on one latch wait inside the blocking helpers
const RETRY_WAIT: Duration = Duration::from_millis(100);

/// Placement of the partition index behind the ring segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PoolLayout {
    partition_off: usize,
    partition_len: usize,
    /// Entries per bucket: one per slot plus one transient reservation per
    /// client between `try_reserve` and slot allocation
    partition_capacity: usize,
    total_size: usize,
}

impl PoolLayout {
    fn new<N, K: Copy>(worker_count: usize, queue_depth: usize, buckets: usize) -> PoolResult<Self> {
        let segment = SegmentLayout::new(worker_count, size_of::<N>(), queue_depth)?;
        let partition_off = segment
            .total_size
            .checked_next_multiple_of(CACHE_LINE_SIZE)
            .ok_or(MemoryError::TooLarge)?;
        let partition_capacity = queue_depth.checked_add(MAX_CLIENTS).ok_or(MemoryError::TooLarge)?;
        let partition_len = PartitionIndex::<K>::required_size(buckets, partition_capacity)?;
        let total_size = partition_off
            .checked_add(partition_len)
            .ok_or(MemoryError::TooLarge)?;
        Ok(Self {
            partition_off,
            partition_len,
            partition_capacity,
            total_size,
        })
    }
}

/// Bytes of shared memory a whole pool needs: ring segment plus partition
/// index
///
/// This is what a host passes to [`TaskSchedCtl::create_in`]; the payload
/// size is `size_of::<N>()` and the index holds tags of type `K`.
pub fn required_pool_memory<N, K: Copy>(
    worker_count: usize,
    queue_depth: usize,
    buckets: usize,
) -> PoolResult<usize> {
    PoolLayout::new::<N, K>(worker_count, queue_depth, buckets).map(|l| l.total_size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Released,
}

/// Client handle to a pool
///
/// - `N`: task payload, plain `Copy` data stored in shared memory
/// - `K`: partition tag, also plain `Copy` data
/// - `C`: aggregation context handed to the completion callback; local to
///   each process
pub struct TaskSchedCtl<N, K, C> {
    // Points into the segment's region; declared first so it is dropped first
    partition: PartitionIndex<K>,
    sched: TaskSched<N>,
    config: PoolConfig,

    handlers: Option<WorkerHandlers<N>>,
    get_tag: Option<GetTagFn<N, K>>,
    finished: Option<FinishedFn<N, C>>,
    context: C,

    /// Tags of this process's in-flight tasks, by slot
    inflight: Vec<Option<K>>,
    /// (pid, client index) last resolved in this process
    client: Option<(i32, u32)>,

    workers: Option<WorkerPool>,
    lifecycle: Lifecycle,
}

impl<N, K, C> TaskSchedCtl<N, K, C>
where
    N: Copy + Send + 'static,
    K: Copy + Send + 'static,
{
    /// Map and initialize the pool's shared structures
    ///
    /// Must run before any worker or client process is forked from this one.
    /// The payload size is `size_of::<N>()`.
    pub fn create(config: PoolConfig, tag_ops: TagOps<K>, agg_context: C) -> PoolResult<Self> {
        config.validate()?;
        let layout = PoolLayout::new::<N, K>(config.worker_count, config.queue_depth, config.buckets)?;
        let region = SharedRegion::map(layout.total_size)?;
        Self::build(config, layout, region, tag_ops, agg_context)
    }

    /// Like `create`, but places the pool in host-provided shared memory
    ///
    /// `region` must hold at least [`required_pool_memory`] bytes for the
    /// same worker count, queue depth and bucket count; nothing else is
    /// mapped.
    pub fn create_in(
        config: PoolConfig,
        region: SharedRegion,
        tag_ops: TagOps<K>,
        agg_context: C,
    ) -> PoolResult<Self> {
        config.validate()?;
        let layout = PoolLayout::new::<N, K>(config.worker_count, config.queue_depth, config.buckets)?;
        if region.len() < layout.total_size {
            return Err(PoolError::SizeMismatch {
                required: layout.total_size,
                actual: region.len(),
            });
        }
        Self::build(config, layout, region, tag_ops, agg_context)
    }

    fn build(
        config: PoolConfig,
        layout: PoolLayout,
        region: SharedRegion,
        tag_ops: TagOps<K>,
        agg_context: C,
    ) -> PoolResult<Self> {
        let base = region.base();
        // Zeroes the whole region, partition bytes included
        let segment = Segment::create_in(region, config.worker_count, size_of::<N>(), config.queue_depth)?;
        // Safety: `base + partition_off` is cache-line aligned (the segment
        // checked `base`), `partition_len` bytes fit inside the region, and
        // the region is owned by `segment`, which outlives `partition`.
        let partition = unsafe {
            PartitionIndex::from_raw(
                base.add(layout.partition_off),
                layout.partition_len,
                config.buckets,
                layout.partition_capacity,
                tag_ops,
            )?
        };
        let sched = TaskSched::with_segment(&config.name, segment)?;

        info!(
            pool = %config.name,
            workers = config.worker_count,
            depth = config.queue_depth,
            buckets = config.buckets,
            mode = %config.worker_mode,
            segment_bytes = layout.partition_off,
            partition_bytes = layout.partition_len,
            "created task pool"
        );

        Ok(Self {
            inflight: vec![None; config.queue_depth],
            partition,
            sched,
            config,
            handlers: None,
            get_tag: None,
            finished: None,
            context: agg_context,
            client: None,
            workers: None,
            lifecycle: Lifecycle::Created,
        })
    }

    /// Bind the worker callbacks and the tag extractor
    pub fn register_handlers(
        &mut self,
        startup: StartupFn,
        handle: HandleFn<N>,
        cleanup: CleanupFn,
        get_tag: GetTagFn<N, K>,
    ) -> PoolResult<()> {
        match self.lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Started => return Err(Misuse::AlreadyStarted.into()),
            Lifecycle::Released => return Err(Misuse::Released.into()),
        }
        self.handlers = Some(WorkerHandlers::new(startup, handle, cleanup));
        self.get_tag = Some(get_tag);
        Ok(())
    }

    /// Bind the completion callback and replace the aggregation context
    ///
    /// Returns the previous context.
    pub fn register_completion(&mut self, finished: FinishedFn<N, C>, context: C) -> C {
        self.finished = Some(finished);
        std::mem::replace(&mut self.context, context)
    }

    /// Spawn the workers and wait until every one has run its startup
    ///
    /// Any startup failure or a missed deadline stops the workers that did
    /// start and leaves the pool released.
    pub fn start(&mut self) -> PoolResult<()> {
        self.check_creator()?;
        match self.lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Started => return Err(Misuse::AlreadyStarted.into()),
            Lifecycle::Released => return Err(Misuse::Released.into()),
        }
        let handlers = self.handlers.ok_or(Misuse::HandlersNotRegistered)?;

        let mode = self.config.worker_mode;
        let mut pool = WorkerPool::new(mode, self.config.worker_count);
        let sched = self.sched.clone();
        let spawned = pool.start(&self.config.name, move |id| {
            worker_main(&sched, &handlers, mode, id)
        });
        self.workers = Some(pool);

        if let Err(e) = spawned.and_then(|()| self.await_startup()) {
            error!(pool = %self.config.name, error = %e, "pool start failed");
            self.stop_workers();
            self.lifecycle = Lifecycle::Released;
            return Err(e);
        }

        self.lifecycle = Lifecycle::Started;
        info!(pool = %self.config.name, workers = self.config.worker_count, %mode, "started task pool");
        Ok(())
    }

    fn await_startup(&mut self) -> PoolResult<()> {
        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            let mut ready = 0;
            for (id, w) in self.sched.segment().workers().iter().enumerate() {
                match w.state() {
                    WorkerState::Failed => return Err(WorkerError::StartupFailed { worker: id }.into()),
                    s if s.is_started() => ready += 1,
                    _ => {}
                }
            }
            if ready == self.config.worker_count {
                return Ok(());
            }

            // Nothing asked the workers to stop yet, so any exit is fatal
            if let Some(pool) = self.workers.as_mut() {
                let reaped = pool.reap_exited();
                if let Some(worker) = startup_casualty(self.sched.segment(), &reaped) {
                    return Err(WorkerError::StartupFailed { worker }.into());
                }
            }

            if Instant::now() >= deadline {
                return Err(WorkerError::StartupTimeout {
                    waited_ms: self.config.startup_timeout.as_millis() as u64,
                }
                .into());
            }
            std::thread::sleep(STARTUP_POLL);
        }
    }

    /// Raise shutdown, wake every worker, and join them
    fn stop_workers(&mut self) {
        let header = self.sched.segment().header();
        header.shutdown.store(true, Ordering::Release);
        header.work.notify_all();

        if let Some(mut pool) = self.workers.take() {
            if let Err(e) = pool.join() {
                warn!(pool = %self.config.name, error = %e, "worker did not exit cleanly");
            }
        }
    }

    /// Submit one task
    ///
    /// `Ok(false)` means "not now": the tag already has a task in flight or
    /// every slot is occupied. Nothing is left reserved in that case; drain,
    /// optionally `wait`, and retry.
    pub fn submit(&mut self, payload: &N) -> PoolResult<bool> {
        if self.lifecycle == Lifecycle::Released || self.sched.is_shutdown() {
            return Err(Misuse::Released.into());
        }
        let get_tag = self.get_tag.ok_or(Misuse::HandlersNotRegistered)?;
        let owner = self.client_index()?;
        let tag = get_tag(payload);

        if !self.partition.try_reserve(&tag) {
            trace!(pool = %self.config.name, "tag in flight; submit deferred");
            return Ok(false);
        }

        let Some(slot) = self.sched.ring().try_allocate(owner) else {
            self.partition.release(&tag);
            trace!(pool = %self.config.name, "ring full; submit deferred");
            return Ok(false);
        };

        self.partition.assign(&tag, slot);
        self.inflight[slot.as_usize()] = Some(tag);
        self.sched.ring().publish(slot, payload);
        Ok(true)
    }

    /// Collect this process's finished tasks
    ///
    /// For each, in ring order: completion callback, tag release, slot
    /// reclaim. Returns how many were drained; never blocks.
    pub fn drain_finished(&mut self) -> PoolResult<usize> {
        let owner = self.client_index()?;
        let ring = self.sched.ring().clone();

        let limit = ring.finished_count(owner);
        if limit == 0 {
            return Ok(0);
        }

        let mut drained = 0;
        for slot in ring.scan_order() {
            if drained == limit {
                break;
            }
            if !ring.is_finished_for(slot, owner) {
                continue;
            }
            if self.drain_slot(&ring, slot) {
                drained += 1;
            }
        }

        if drained > 0 {
            self.wake_other_clients(owner);
        }
        Ok(drained)
    }

    fn drain_slot(&mut self, ring: &RingQueue<N>, slot: SlotIndex) -> bool {
        let Some(node) = ring.peek(slot) else {
            return false;
        };

        if let Some(finished) = self.finished {
            finished(&node, &mut self.context);
        }

        let tag = match self.inflight[slot.as_usize()].take() {
            Some(tag) => Some(tag),
            // Not submitted through this handle; recompute from the payload
            None => self.get_tag.map(|get_tag| get_tag(&node.payload)),
        };
        if let Some(tag) = tag {
            if self.partition.release(&tag).is_none() {
                warn!(pool = %self.config.name, %slot, "drained task had no tag reservation");
            }
        }

        ring.reclaim(slot).is_some()
    }

    /// Submit, draining and waiting until the task is accepted
    pub fn submit_blocking(&mut self, payload: &N) -> PoolResult<()> {
        loop {
            if self.submit(payload)? {
                return Ok(());
            }
            if self.drain_finished()? == 0 {
                self.wait(Some(RETRY_WAIT))?;
            }
        }
    }

    /// Drain until the pool is idle or shutting down
    ///
    /// Returns the number of tasks this process drained.
    pub fn drain_until_idle(&mut self) -> PoolResult<usize> {
        let mut total = 0;
        while !self.is_idle() {
            let n = self.drain_finished()?;
            total += n;
            if n == 0 && self.wait(Some(RETRY_WAIT))? == WakeReason::Shutdown {
                break;
            }
        }
        Ok(total)
    }

    /// Whole pool quiescent: nothing Queued, Running, or waiting to be drained
    pub fn is_idle(&self) -> bool {
        self.sched.ring().occupied() == 0
    }

    /// Block until one of this process's tasks finishes or a slot frees up
    ///
    /// Resets the latch before returning `Set`. `None` waits indefinitely.
    pub fn wait(&mut self, timeout: Option<Duration>) -> PoolResult<WakeReason> {
        let owner = self.client_index()?;
        let segment = self.sched.segment();
        let latch = segment.clients()[owner as usize].latch();
        let reason = latch.wait(timeout, &segment.header().shutdown);
        if reason == WakeReason::Set {
            latch.reset();
        }
        Ok(reason)
    }

    /// Turn tasks held by dead workers into finished, abandoned tasks
    ///
    /// Reaps workers that exited, marks them Failed unless they stopped
    /// cleanly, and completes any slot they held Running with
    /// `TaskOutcome::Abandoned`. Dead workers are not replaced. Returns the
    /// number of slots recovered; they are collected by the next drain.
    pub fn recover_abandoned(&mut self) -> PoolResult<usize> {
        self.check_creator()?;
        let Some(pool) = self.workers.as_mut() else {
            return Ok(0);
        };

        let mut recovered = 0;
        for worker in pool.reap_exited() {
            let entry = &self.sched.segment().workers()[worker];
            if entry.state() != WorkerState::Stopped {
                entry.set_state(WorkerState::Failed);
                warn!(pool = %self.config.name, worker, pid = entry.pid(), "worker died");
            }
            for slot in self.sched.ring().running_on(worker as u32) {
                if self.sched.ring().abandon(slot) {
                    warn!(pool = %self.config.name, worker, %slot, "abandoned task recovered");
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }

    /// Stop the pool
    ///
    /// Workers finish every Queued task, run cleanup and exit; then any
    /// remaining finished tasks of this process are drained through the
    /// completion callback. Returns the number drained here. Only the
    /// creating process may call this, once.
    pub fn release(&mut self) -> PoolResult<usize> {
        self.check_creator()?;
        if self.lifecycle == Lifecycle::Released {
            return Err(Misuse::Released.into());
        }
        info!(pool = %self.config.name, "releasing task pool");

        self.stop_workers();

        // Nothing runs any more; a slot still Running lost its worker
        let stuck: Vec<SlotIndex> = (0..self.config.worker_count)
            .flat_map(|w| self.sched.ring().running_on(w as u32))
            .collect();
        for slot in stuck {
            if self.sched.ring().abandon(slot) {
                warn!(pool = %self.config.name, %slot, "task abandoned at release");
            }
        }

        let drained = self.drain_finished()?;

        let stats = self.sched.stats();
        if stats.ring.queued > 0 {
            warn!(pool = %self.config.name, queued = stats.ring.queued, "tasks left queued; pool never started");
        }
        if stats.ring.finished > 0 {
            debug!(pool = %self.config.name, finished = stats.ring.finished, "finished tasks left for other clients");
        }

        for client in self.sched.segment().clients() {
            client.latch().set();
        }
        self.lifecycle = Lifecycle::Released;
        info!(
            pool = %self.config.name,
            drained,
            completed = stats.tasks_completed,
            failed = stats.tasks_failed,
            "released task pool"
        );
        Ok(drained)
    }

    /// Claim (or find) this process's client entry
    fn client_index(&mut self) -> PoolResult<u32> {
        let pid = std::process::id() as i32;
        if let Some((cached_pid, idx)) = self.client {
            if cached_pid == pid {
                return Ok(idx);
            }
        }

        let clients = self.sched.segment().clients();
        let idx = match clients.iter().position(|c| c.pid() == pid) {
            Some(idx) => idx,
            None => self.claim_client_entry(pid)?,
        };

        // A forked copy inherits the parent's bookkeeping, not its tasks
        if self.client.is_some() {
            self.inflight.iter_mut().for_each(|t| *t = None);
        }
        self.client = Some((pid, idx as u32));
        Ok(idx as u32)
    }

    /// Take over the entry of an exited client, or else a free one
    ///
    /// An adopted entry comes with the dead client's tasks: they finish to
    /// this process, and draining them releases their tags.
    fn claim_client_entry(&self, pid: i32) -> PoolResult<usize> {
        let clients = self.sched.segment().clients();

        for (idx, client) in clients.iter().enumerate() {
            let old = client.pid();
            if old == 0 || process_alive(old) {
                continue;
            }
            if client
                .pid
                .compare_exchange(old, pid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Its finished tasks may already be waiting
                client.latch().set();
                warn!(pool = %self.config.name, pid, client = idx, dead_pid = old, "adopted entry of exited client");
                return Ok(idx);
            }
        }

        let idx = clients
            .iter()
            .position(|c| c.pid.compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire).is_ok())
            .ok_or(PoolError::ClientsExhausted(MAX_CLIENTS))?;
        clients[idx].latch().reset();
        debug!(pool = %self.config.name, pid, client = idx, "client attached");
        Ok(idx)
    }

    fn wake_other_clients(&self, owner: u32) {
        for (idx, client) in self.sched.segment().clients().iter().enumerate() {
            if idx as u32 != owner && client.pid() != 0 {
                client.latch().set();
            }
        }
    }

    fn check_creator(&self) -> PoolResult<()> {
        if std::process::id() as i32 != self.sched.segment().header().creator_pid() {
            return Err(Misuse::NotCreator.into());
        }
        Ok(())
    }
}

/// Worker to report when workers exited during startup
///
/// Prefers one that never reported in; any exit at all fails the start.
fn startup_casualty(segment: &Segment, reaped: &[usize]) -> Option<usize> {
    reaped
        .iter()
        .copied()
        .find(|&w| {
            let state = segment.workers()[w].state();
            !state.is_started() || state == WorkerState::Failed
        })
        .or_else(|| reaped.first().copied())
}

/// `false` only once the kernel no longer knows `pid`
fn process_alive(pid: i32) -> bool {
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

impl<N, K, C> TaskSchedCtl<N, K, C> {
    #[inline]
    pub fn sched(&self) -> &TaskSched<N> {
        &self.sched
    }

    #[inline]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[inline]
    pub fn context(&self) -> &C {
        &self.context
    }

    #[inline]
    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    #[inline]
    pub fn partition(&self) -> &PartitionIndex<K> {
        &self.partition
    }

    #[inline]
    pub fn worker_mode(&self) -> WorkerMode {
        self.config.worker_mode
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.lifecycle == Lifecycle::Started
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.lifecycle == Lifecycle::Released
    }
}

impl<N: Copy, K, C> TaskSchedCtl<N, K, C> {
    pub fn stats(&self) -> PoolStats {
        self.sched.stats()
    }
}

impl<N, K, C> Drop for TaskSchedCtl<N, K, C> {
    fn drop(&mut self) {
        let is_creator = std::process::id() as i32 == self.sched.segment().header().creator_pid();
        if !is_creator {
            // Thread handles are meaningless in a forked copy
            if let Some(pool) = self.workers.take() {
                std::mem::forget(pool);
            }
            if let Some((pid, idx)) = self.client {
                let entry = &self.sched.segment().clients()[idx as usize];
                let _ = entry.pid.compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Acquire);
            }
            return;
        }
        if self.lifecycle == Lifecycle::Started {
            error!(pool = %self.config.name, "pool dropped without release; stopping workers");
            let header = self.sched.segment().header();
            header.shutdown.store(true, Ordering::Release);
            header.work.notify_all();
            if let Some(mut pool) = self.workers.take() {
                let _ = pool.join();
            }
        }
    }
}
