//! Error types for the task pool
//!
//! Backpressure ("queue full", "tag already in flight") is not an error:
//! `submit` reports it as `Ok(false)`. Handler failure is not an error either;
//! it is recorded as the task's `TaskOutcome`. What remains here is
//! initialization failure and protocol misuse, both fatal to the caller.

use thiserror::Error;

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur creating, starting or driving a pool
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Configuration rejected by `validate`
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(&'static str),

    /// Region handed in is smaller than the layout requires
    #[error("shared segment too small: need {required} bytes, got {actual}")]
    SizeMismatch { required: usize, actual: usize },

    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Programming error in how the pool is driven
    #[error("protocol misuse: {0}")]
    Misuse(#[from] Misuse),

    /// Every client latch is claimed by another process
    #[error("all {0} client slots are attached")]
    ClientsExhausted(usize),
}

/// Shared mapping errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("mmap failed: errno {0}")]
    MapFailed(i32),

    #[error("munmap failed: errno {0}")]
    UnmapFailed(i32),

    /// Requested layout overflows `usize`
    #[error("requested segment size overflows")]
    TooLarge,

    /// Task node type needs stricter alignment than slots provide
    #[error("task node alignment {0} exceeds slot alignment")]
    Misaligned(usize),
}

/// Worker lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// fork or thread spawn failed
    #[error("failed to spawn worker: errno {0}")]
    SpawnFailed(i32),

    /// Startup callback returned an error
    #[error("worker {worker} failed during startup")]
    StartupFailed { worker: usize },

    /// Workers did not report in before the startup deadline
    #[error("workers did not start within {waited_ms}ms")]
    StartupTimeout { waited_ms: u64 },

    #[error("failed to join worker {worker}")]
    JoinFailed { worker: usize },
}

/// Calls made in the wrong order or from the wrong process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Misuse {
    #[error("handlers must be registered first")]
    HandlersNotRegistered,

    #[error("pool already started")]
    AlreadyStarted,

    #[error("pool not started")]
    NotStarted,

    #[error("pool already released")]
    Released,

    /// Lifecycle operation called from a process other than the creator
    #[error("only the creating process may do this")]
    NotCreator,
}
