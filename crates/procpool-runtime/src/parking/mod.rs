//! Cross-process sleep/wake on a 32-bit word
//!
//! The word lives in shared memory, so the primitive must work between
//! processes, not just threads. On Linux that is a futex without
//! `FUTEX_PRIVATE_FLAG`; elsewhere a short polling sleep stands in.
//!
//! Both calls are hints: callers always re-check their condition after
//! `wait_on` returns.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        use futex_linux as imp;
    } else {
        mod fallback;
        use fallback as imp;
    }
}

/// Outcome of a single `wait_on` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parked {
    /// Woken by `wake_on`, or the word no longer held `expected`
    Woken,
    TimedOut,
    /// Signal or spurious return
    Interrupted,
}

/// Sleep while `*word == expected`, at most `timeout`
#[inline]
pub fn wait_on(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Parked {
    imp::wait(word, expected, timeout)
}

/// Wake up to `count` sleepers on `word`
#[inline]
pub fn wake_on(word: &AtomicU32, count: u32) {
    imp::wake(word, count)
}
