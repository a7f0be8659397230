//! # procpool-core
//!
//! Core types for the procpool task engine.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Shared mappings, futex wake-ups and process spawning live in
//! `procpool-runtime`.
//!
//! ## Modules
//!
//! - `slot` - Slot index type
//! - `state` - Slot, worker and task outcome enums
//! - `node` - Task node record handed to callbacks
//! - `tag` - Pluggable tag hashing and ordering
//! - `partition` - Hash-bucketed in-flight tag index (shared-memory layout)
//! - `spinlock` - Process-shared spinlock
//! - `error` - Error types
//! - `env` - Environment variable utilities

pub mod slot;
pub mod state;
pub mod node;
pub mod tag;
pub mod partition;
pub mod spinlock;
pub mod error;
pub mod env;

// Re-exports for convenience
pub use slot::SlotIndex;
pub use state::{SlotState, TaskOutcome, WorkerState};
pub use node::TaskNode;
pub use tag::TagOps;
pub use partition::PartitionIndex;
pub use spinlock::SpinLock;
pub use error::{MemoryError, Misuse, PoolError, PoolResult, WorkerError};
pub use env::{env_get, env_get_str};

/// Constants for the shared segment layout
pub mod constants {
    /// Maximum worker processes per pool
    pub const MAX_WORKERS: usize = 64;

    /// Maximum client processes attached to one pool
    pub const MAX_CLIENTS: usize = 64;

    /// Maximum ring depth
    pub const MAX_QUEUE_DEPTH: usize = 1 << 16;

    /// Cache line size for alignment
    pub const CACHE_LINE_SIZE: usize = 64;

    /// Task payload slots are strided and aligned to this boundary
    pub const NODE_ALIGN: usize = CACHE_LINE_SIZE;

    /// No slot / no owner / no worker sentinel
    pub const NONE: u32 = u32::MAX;
}

/// Round `n` up to the next multiple of `align` (power of two)
#[inline]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}
