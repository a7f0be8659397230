//! # procpool - process pool task engine
//!
//! A fixed pool of long-lived worker processes executes tasks submitted by one
//! or more client processes. Tasks sharing a tag never run at the same time;
//! tasks with different tags run in parallel.
//!
//! ## Quick Start
//!
//! ```ignore
//! use procpool::{noop_cleanup, noop_startup, PoolConfig, TagOps, TaskNode, TaskSched, TaskSchedCtl};
//!
//! #[derive(Clone, Copy)]
//! struct Calc { key: u32, value: u64 }
//!
//! fn handle(_: &TaskSched<Calc>, node: &mut TaskNode<Calc>) -> bool {
//!     let k = node.payload.key as u64;
//!     node.payload.value = k * (k + 1);
//!     true
//! }
//!
//! fn finished(node: &TaskNode<Calc>, total: &mut u64) {
//!     *total += node.payload.value;
//! }
//!
//! fn main() -> procpool::PoolResult<()> {
//!     let config = PoolConfig::from_env().worker_count(8).queue_depth(32);
//!     let mut ctl = TaskSchedCtl::create(config, TagOps::natural(), 0u64)?;
//!     ctl.register_handlers(noop_startup, handle, noop_cleanup, |c: &Calc| c.key % 256)?;
//!     ctl.register_completion(finished, 0);
//!     ctl.start()?;
//!
//!     for key in 1..=1000 {
//!         ctl.submit_blocking(&Calc { key, value: 0 })?;
//!     }
//!     ctl.drain_until_idle()?;
//!     ctl.release()?;
//!     println!("total = {}", ctl.context());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +------------------+        +------------------+
//! |  client process  |  ...   |  client process  |    submit / drain / wait
//! |  TaskSchedCtl    |        |  TaskSchedCtl    |
//! +--------+---------+        +---------+--------+
//!          |                            |
//!          v                            v
//! +-------------------------------------------------+
//! | segment: header | workers | clients | fifo |    |  one MAP_SHARED region,
//! |          slot headers | payloads                |  required_pool_memory
//! +-------------------------------------------------+  bytes
//! | partition index                                 |  tag -> slot, B buckets
//! +-------------------------------------------------+
//!          ^                            ^
//!          |                            |
//! +--------+---------+        +---------+--------+
//! |  worker process  |  ...   |  worker process  |    claim / handle / complete
//! +------------------+        +------------------+
//! ```
//!
//! ## Protocol
//!
//! - `submit` returns `Ok(false)` when the tag already has a task in flight or
//!   the ring is full. Nothing is held; drain, `wait`, retry.
//! - Handler failures and panics become `TaskOutcome::Failed`, visible to the
//!   completion callback. They are never retried.
//! - `release` lets workers finish every queued task, joins them, and drains
//!   what is left.

// Re-export core types
pub use procpool_core::{
    align_up, constants, MemoryError, Misuse, PartitionIndex, PoolError, PoolResult, SlotIndex,
    SlotState, SpinLock, TagOps, TaskNode, TaskOutcome, WorkerError, WorkerState,
};

// Re-export env utilities
pub use procpool_core::{env_get, env_get_str};

// Re-export runtime types
pub use procpool_runtime::{
    noop_cleanup, noop_startup, required_pool_memory, required_shared_memory, BoxError, CleanupFn,
    FinishedFn, GetTagFn, HandleFn, PoolConfig, PoolStats, RingStats, SharedRegion, StartupFn,
    TaskSched, TaskSchedCtl, WakeReason, WorkerContext, WorkerCounts, WorkerMode,
};

pub use procpool_runtime::config;
