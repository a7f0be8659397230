//! # procpool-runtime
//!
//! Platform runtime for the procpool task engine.
//!
//! This crate provides:
//! - Shared anonymous mappings that survive `fork` (`memory`)
//! - Cross-process sleep/wake on futex words (`parking`, `latch`)
//! - The shared segment layout and its sizing function (`segment`)
//! - The slot ring (`ring`)
//! - Worker processes and threads (`worker`)
//! - The scheduler handle and the client-facing control (`sched`, `ctl`)
//! - Pool configuration (`config`)

pub mod config;
pub mod memory;
pub mod parking;
pub mod latch;
pub mod segment;
pub mod ring;
pub mod handlers;
pub mod worker;
pub mod sched;
pub mod ctl;

// Re-exports
pub use config::PoolConfig;
pub use ctl::{required_pool_memory, TaskSchedCtl};
pub use handlers::{
    noop_cleanup, noop_startup, BoxError, CleanupFn, FinishedFn, GetTagFn, HandleFn, StartupFn,
    WorkerContext, WorkerHandlers,
};
pub use latch::{Latch, WakeReason, WorkSignal};
pub use memory::SharedRegion;
pub use ring::{RingQueue, RingStats};
pub use sched::{PoolStats, TaskSched, WorkerCounts};
pub use segment::{required_shared_memory, Segment, SegmentLayout};
pub use worker::{WorkerMode, WorkerPool};
