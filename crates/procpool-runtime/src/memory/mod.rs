//! Shared memory regions
//!
//! Every piece of state a worker process needs to see lives in a
//! `SharedRegion`: the segment (header, worker table, ring) and the partition
//! index each get one. Regions are mapped before workers are forked, so all
//! processes see them at the same address.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
    } else {
        compile_error!("procpool needs a unix shared mapping");
    }
}

use core::ptr::NonNull;

/// A fixed-size, zero-initialized mapping visible to forked children
///
/// An owned region is unmapped on drop. A borrowed region (see
/// [`SharedRegion::from_raw`]) belongs to the host and is left alone.
pub struct SharedRegion {
    base: NonNull<u8>,
    len: usize,
    owned: bool,
}

// Safety: the region is plain memory; all typed access goes through atomics
// or the process-shared spinlock.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Wrap memory the host already mapped as shared
    ///
    /// # Safety
    ///
    /// `base` must point to `len` writable bytes that stay mapped for the
    /// lifetime of the returned region and are visible to every process that
    /// will use the pool.
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len, owned: false }
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether dropping this region unmaps it
    #[inline]
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Zero the whole region
    ///
    /// Only valid before any other process or thread uses it.
    pub(crate) fn clear(&mut self) {
        // Safety: we have exclusive access and len bytes are mapped
        unsafe { core::ptr::write_bytes(self.base(), 0, self.len) }
    }
}

impl core::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("owned", &self.owned)
            .finish()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.owned {
            if let Err(e) = self.unmap() {
                tracing::warn!(error = %e, len = self.len, "failed to unmap shared region");
            }
        }
    }
}
