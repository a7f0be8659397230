//! Unix shared mapping using mmap

use super::SharedRegion;
use core::ptr::NonNull;
use procpool_core::error::{MemoryError, PoolResult};

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl SharedRegion {
    /// Map `len` bytes of anonymous shared memory
    ///
    /// The mapping is `MAP_SHARED`, so it survives `fork` as the same
    /// physical pages rather than copy-on-write. Fresh pages are zero-filled.
    pub fn map(len: usize) -> PoolResult<Self> {
        if len == 0 {
            return Err(MemoryError::MapFailed(libc::EINVAL).into());
        }

        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if base == libc::MAP_FAILED {
            return Err(MemoryError::MapFailed(errno()).into());
        }

        let base = NonNull::new(base as *mut u8).ok_or(MemoryError::MapFailed(0))?;
        tracing::trace!(len, addr = ?base, "mapped shared region");

        Ok(Self { base, len, owned: true })
    }

    pub(super) fn unmap(&mut self) -> Result<(), MemoryError> {
        let ret = unsafe { libc::munmap(self.base() as *mut libc::c_void, self.len) };
        if ret != 0 {
            return Err(MemoryError::UnmapFailed(errno()));
        }
        Ok(())
    }
}
