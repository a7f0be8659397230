//! Library defaults for `PoolConfig`

use crate::worker::WorkerMode;

pub const NAME: &str = "procpool";

pub const WORKER_COUNT: usize = 4;

pub const QUEUE_DEPTH: usize = 32;

/// Partition buckets; tags hashing to the same bucket share one lock
pub const BUCKETS: usize = 32;

pub const WORKER_MODE: WorkerMode = WorkerMode::Process;

/// How long `start` waits for every worker to finish its startup callback
pub const STARTUP_TIMEOUT_MS: u64 = 10_000;
