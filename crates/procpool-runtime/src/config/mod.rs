//! Pool configuration
//!
//! Library defaults with runtime environment overrides, then builder calls.
//!
//! # Example
//!
//! ```rust,ignore
//! use procpool_runtime::config::PoolConfig;
//!
//! let config = PoolConfig::from_env()
//!     .worker_count(8)
//!     .queue_depth(64);
//! ```

pub mod defaults;

use crate::worker::WorkerMode;
use procpool_core::constants::{MAX_QUEUE_DEPTH, MAX_WORKERS};
use procpool_core::env::{env_get, env_get_str};
use procpool_core::error::{PoolError, PoolResult};
use std::time::Duration;

/// Pool configuration with builder pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Label used in logs
    pub name: String,
    pub worker_count: usize,
    /// Ring slots; also the most tasks that can be in flight at once
    pub queue_depth: usize,
    /// Partition index buckets
    pub buckets: usize,
    pub worker_mode: WorkerMode,
    pub startup_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl PoolConfig {
    /// Defaults with environment overrides
    ///
    /// Environment variables (all optional):
    /// - `PROCPOOL_NAME` - Pool label
    /// - `PROCPOOL_WORKERS` - Number of workers
    /// - `PROCPOOL_QUEUE_DEPTH` - Ring slots
    /// - `PROCPOOL_BUCKETS` - Partition buckets
    /// - `PROCPOOL_WORKER_MODE` - `process` or `thread`
    /// - `PROCPOOL_STARTUP_TIMEOUT_MS` - Startup deadline in milliseconds
    pub fn from_env() -> Self {
        Self {
            name: env_get_str("PROCPOOL_NAME", defaults::NAME),
            worker_count: env_get("PROCPOOL_WORKERS", defaults::WORKER_COUNT),
            queue_depth: env_get("PROCPOOL_QUEUE_DEPTH", defaults::QUEUE_DEPTH),
            buckets: env_get("PROCPOOL_BUCKETS", defaults::BUCKETS),
            worker_mode: env_get("PROCPOOL_WORKER_MODE", defaults::WORKER_MODE),
            startup_timeout: Duration::from_millis(env_get(
                "PROCPOOL_STARTUP_TIMEOUT_MS",
                defaults::STARTUP_TIMEOUT_MS,
            )),
        }
    }

    /// Library defaults, ignoring the environment
    pub fn new() -> Self {
        Self {
            name: defaults::NAME.to_string(),
            worker_count: defaults::WORKER_COUNT,
            queue_depth: defaults::QUEUE_DEPTH,
            buckets: defaults::BUCKETS,
            worker_mode: defaults::WORKER_MODE,
            startup_timeout: Duration::from_millis(defaults::STARTUP_TIMEOUT_MS),
        }
    }

    // Builder methods

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn worker_count(mut self, n: usize) -> Self {
        self.worker_count = n;
        self
    }

    pub fn queue_depth(mut self, n: usize) -> Self {
        self.queue_depth = n;
        self
    }

    pub fn buckets(mut self, n: usize) -> Self {
        self.buckets = n;
        self
    }

    pub fn worker_mode(mut self, mode: WorkerMode) -> Self {
        self.worker_mode = mode;
        self
    }

    pub fn startup_timeout(mut self, d: Duration) -> Self {
        self.startup_timeout = d;
        self
    }

    pub fn validate(&self) -> PoolResult<()> {
        if self.name.is_empty() {
            return Err(PoolError::InvalidConfig("name must not be empty"));
        }
        if self.worker_count == 0 {
            return Err(PoolError::InvalidConfig("worker_count must be > 0"));
        }
        if self.worker_count > MAX_WORKERS {
            return Err(PoolError::InvalidConfig("worker_count exceeds MAX_WORKERS"));
        }
        if self.queue_depth == 0 {
            return Err(PoolError::InvalidConfig("queue_depth must be > 0"));
        }
        if self.queue_depth > MAX_QUEUE_DEPTH {
            return Err(PoolError::InvalidConfig("queue_depth exceeds MAX_QUEUE_DEPTH"));
        }
        if self.buckets == 0 {
            return Err(PoolError::InvalidConfig("buckets must be > 0"));
        }
        if self.startup_timeout.is_zero() {
            return Err(PoolError::InvalidConfig("startup_timeout must be > 0"));
        }
        Ok(())
    }
}
