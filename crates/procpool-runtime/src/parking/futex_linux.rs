//! Linux futex parking
//!
//! Uses `FUTEX_WAIT`/`FUTEX_WAKE` without `FUTEX_PRIVATE_FLAG`. Private
//! futexes are keyed by (mm, address) and would never match a waiter in
//! another process; shared ones are keyed by the backing page.

use super::Parked;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

pub(super) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Parked {
    let timespec = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });

    let timespec_ptr = match &timespec {
        Some(ts) => ts as *const libc::timespec,
        None => std::ptr::null(),
    };

    let result = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            timespec_ptr,
            std::ptr::null::<u32>(),
            0u32,
        )
    };

    if result == 0 {
        return Parked::Woken;
    }

    match std::io::Error::last_os_error().raw_os_error() {
        // Word already changed
        Some(libc::EAGAIN) => Parked::Woken,
        Some(libc::ETIMEDOUT) => Parked::TimedOut,
        _ => Parked::Interrupted,
    }
}

pub(super) fn wake(word: &AtomicU32, count: u32) {
    let count = count.min(i32::MAX as u32) as i32;
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}
