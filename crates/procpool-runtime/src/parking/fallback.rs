//! Polling fallback for platforms without a shared futex
//!
//! Sleeps in short steps and re-reads the word. Wakeups cost up to one
//! step of latency; `wake` has nothing to do.

use super::Parked;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const POLL_STEP: Duration = Duration::from_micros(200);

pub(super) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Parked {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if word.load(Ordering::Acquire) != expected {
            return Parked::Woken;
        }
        let step = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return Parked::TimedOut;
                }
                (d - now).min(POLL_STEP)
            }
            None => POLL_STEP,
        };
        std::thread::sleep(step);
    }
}

pub(super) fn wake(_word: &AtomicU32, _count: u32) {}
