//! Shared-memory wake primitives
//!
//! Two flavors, both `repr(C)` atomics that are valid when zeroed:
//!
//! - [`WorkSignal`]: an event count workers sleep on while the ring is empty.
//!   A worker takes a token with `prepare`, re-checks for work, and only then
//!   waits on the token. A publish that lands in between bumps the count, so
//!   the wait returns at once instead of losing the wakeup.
//! - [`Latch`]: a one-bit flag per client. Completions set it, the client
//!   waits on it and resets it once woken.

use crate::parking::{wait_on, wake_on};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Why a client wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// A task owned by the caller finished, or a slot was freed
    Set,
    Timeout,
    /// The pool is shutting down
    Shutdown,
}

impl fmt::Display for WakeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WakeReason::Set => "set",
            WakeReason::Timeout => "timeout",
            WakeReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Event count for idle workers
#[repr(C)]
#[derive(Default)]
pub struct WorkSignal {
    seq: AtomicU32,
    sleepers: AtomicU32,
}

impl WorkSignal {
    pub const fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            sleepers: AtomicU32::new(0),
        }
    }

    /// Snapshot taken before checking for work
    #[inline]
    pub fn prepare(&self) -> u32 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Sleep unless something was signalled since `token`
    ///
    /// Returns `false` only on timeout.
    pub fn wait(&self, token: u32, timeout: Option<Duration>) -> bool {
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        let woke = if self.seq.load(Ordering::SeqCst) != token {
            true
        } else {
            !matches!(wait_on(&self.seq, token, timeout), crate::parking::Parked::TimedOut)
        };
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
        woke
    }

    #[inline]
    pub fn notify_one(&self) {
        self.seq.fetch_add(1, Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            wake_on(&self.seq, 1);
        }
    }

    #[inline]
    pub fn notify_all(&self) {
        self.seq.fetch_add(1, Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            wake_on(&self.seq, u32::MAX);
        }
    }

    /// Workers currently asleep (may be stale)
    #[inline]
    pub fn sleepers(&self) -> usize {
        self.sleepers.load(Ordering::Relaxed) as usize
    }
}

/// Per-client completion latch
#[repr(C)]
#[derive(Default)]
pub struct Latch {
    state: AtomicU32,
    waiters: AtomicU32,
}

impl Latch {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
        }
    }

    pub fn set(&self) {
        if self.state.swap(1, Ordering::SeqCst) == 0 && self.waiters.load(Ordering::SeqCst) > 0 {
            wake_on(&self.state, u32::MAX);
        }
    }

    #[inline]
    pub fn reset(&self) {
        self.state.store(0, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) != 0
    }

    /// Block until set, `shutdown` is raised, or `timeout` passes
    ///
    /// Does not reset the latch. `shutdown` wins over a set latch so that a
    /// client loop sees the pool going away.
    pub fn wait(&self, timeout: Option<Duration>, shutdown: &AtomicBool) -> WakeReason {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if shutdown.load(Ordering::Acquire) {
                return WakeReason::Shutdown;
            }
            if self.is_set() {
                return WakeReason::Set;
            }

            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return WakeReason::Timeout;
                    }
                    Some(d - now)
                }
                None => None,
            };

            self.waiters.fetch_add(1, Ordering::SeqCst);
            if !self.is_set() {
                wait_on(&self.state, 0, remaining);
            }
            self.waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
