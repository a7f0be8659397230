//! Hash-bucketed index of in-flight tags
//!
//! The index serializes same-tag work: a tag can be reserved at most once at
//! a time, system-wide. Tags are spread over `B` buckets by the caller's hash;
//! each bucket has its own lock, so submitters only contend when their tags
//! land in the same bucket.
//!
//! Inside a bucket the entries are kept as a sorted array (ordered by the
//! caller's comparator). Membership, insertion point and removal are a binary
//! search. Distinct tags that collide into one bucket coexist; only an
//! `Equal` comparison denies a reservation.
//!
//! # Memory layout
//!
//! The index is a plain byte region so it can live in a shared mapping:
//!
//! ```text
//! bucket 0: [BucketHeader (lock + len), padded to 64][entry; capacity] pad
//! bucket 1: ...
//! ```
//!
//! All-zero bytes are a valid empty index.

use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

use crate::align_up;
use crate::constants::CACHE_LINE_SIZE;
use crate::error::{MemoryError, PoolError, PoolResult};
use crate::slot::SlotIndex;
use crate::spinlock::SpinLock;
use crate::tag::TagOps;

/// One reservation: a tag and the ring slot carrying it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PartitionEntry<K> {
    pub tag: K,
    /// `SlotIndex::NONE` between reservation and slot allocation
    pub slot: SlotIndex,
}

#[repr(C)]
struct BucketMeta {
    len: u32,
    /// Largest `len` ever seen, for sizing diagnostics
    high_water: u32,
}

#[repr(C, align(64))]
struct BucketHeader {
    lock: SpinLock<BucketMeta>,
}

/// Shared-memory partition index over tags of type `K`
pub struct PartitionIndex<K> {
    base: NonNull<u8>,
    buckets: usize,
    capacity: usize,
    stride: usize,
    entries_offset: usize,
    ops: TagOps<K>,
    _marker: PhantomData<K>,
}

// Safety: every access to bucket contents goes through the bucket's lock;
// entries are plain `Copy` data.
unsafe impl<K: Send> Send for PartitionIndex<K> {}
unsafe impl<K: Send> Sync for PartitionIndex<K> {}

impl<K: Copy> PartitionIndex<K> {
    fn entries_offset() -> PoolResult<usize> {
        let align = align_of::<PartitionEntry<K>>();
        if align > CACHE_LINE_SIZE {
            return Err(MemoryError::Misaligned(align).into());
        }
        Ok(align_up(size_of::<BucketHeader>(), CACHE_LINE_SIZE))
    }

    fn bucket_stride(capacity: usize) -> PoolResult<usize> {
        let entries = capacity
            .checked_mul(size_of::<PartitionEntry<K>>())
            .ok_or(MemoryError::TooLarge)?;
        let raw = Self::entries_offset()?
            .checked_add(entries)
            .ok_or(MemoryError::TooLarge)?;
        Ok(align_up(raw, CACHE_LINE_SIZE))
    }

    /// Bytes needed for `buckets` buckets of `capacity` entries each
    pub fn required_size(buckets: usize, capacity: usize) -> PoolResult<usize> {
        let size = Self::bucket_stride(capacity)?
            .checked_mul(buckets)
            .ok_or(MemoryError::TooLarge)?;
        Ok(size)
    }

    /// View a zero-filled region as an empty index.
    ///
    /// # Safety
    ///
    /// - `base` must point to `len` writable bytes, 64-byte aligned, that stay
    ///   mapped for the lifetime of the returned value.
    /// - The region must be zero-filled or previously initialized by an index
    ///   with the same `buckets`, `capacity` and `K`.
    pub unsafe fn from_raw(
        base: *mut u8,
        len: usize,
        buckets: usize,
        capacity: usize,
        ops: TagOps<K>,
    ) -> PoolResult<Self> {
        if buckets == 0 {
            return Err(PoolError::InvalidConfig("partition index needs at least one bucket"));
        }
        if capacity == 0 || capacity > u32::MAX as usize {
            return Err(PoolError::InvalidConfig("partition bucket capacity out of range"));
        }
        let base = NonNull::new(base).ok_or(MemoryError::MapFailed(0))?;
        if base.as_ptr() as usize % CACHE_LINE_SIZE != 0 {
            return Err(MemoryError::Misaligned(CACHE_LINE_SIZE).into());
        }
        let required = Self::required_size(buckets, capacity)?;
        if len < required {
            return Err(PoolError::SizeMismatch { required, actual: len });
        }

        Ok(Self {
            base,
            buckets,
            capacity,
            stride: Self::bucket_stride(capacity)?,
            entries_offset: Self::entries_offset()?,
            ops,
            _marker: PhantomData,
        })
    }

    #[inline]
    fn header(&self, bucket: usize) -> &BucketHeader {
        debug_assert!(bucket < self.buckets);
        unsafe { &*(self.base.as_ptr().add(bucket * self.stride) as *const BucketHeader) }
    }

    #[inline]
    fn entries_ptr(&self, bucket: usize) -> *mut PartitionEntry<K> {
        unsafe {
            self.base
                .as_ptr()
                .add(bucket * self.stride + self.entries_offset) as *mut PartitionEntry<K>
        }
    }

    /// Locate `tag` in a bucket whose lock the caller holds
    ///
    /// `Ok(pos)` if present, `Err(insertion point)` otherwise.
    fn search(&self, bucket: usize, len: usize, tag: &K) -> Result<usize, usize> {
        // Safety: caller holds the bucket lock; the first `len` entries are initialized
        let entries = unsafe { core::slice::from_raw_parts(self.entries_ptr(bucket), len) };
        entries.binary_search_by(|e| (self.ops.compare)(&e.tag, tag))
    }

    #[inline]
    pub fn bucket_of(&self, tag: &K) -> usize {
        self.ops.bucket(tag, self.buckets)
    }

    /// Reserve `tag` if no equal tag is in flight.
    ///
    /// Returns `false` if the tag is already reserved, or if its bucket is at
    /// capacity (treated as backpressure, same as a denied reservation).
    pub fn try_reserve(&self, tag: &K) -> bool {
        let bucket = self.bucket_of(tag);
        let mut meta = self.header(bucket).lock.lock();
        let len = meta.len as usize;

        let pos = match self.search(bucket, len, tag) {
            Ok(_) => return false,
            Err(pos) => pos,
        };
        if len == self.capacity {
            return false;
        }

        unsafe {
            let entries = self.entries_ptr(bucket);
            ptr::copy(entries.add(pos), entries.add(pos + 1), len - pos);
            ptr::write(entries.add(pos), PartitionEntry { tag: *tag, slot: SlotIndex::NONE });
        }
        meta.len += 1;
        meta.high_water = meta.high_water.max(meta.len);
        true
    }

    /// Record the ring slot carrying a reserved tag
    ///
    /// Returns `false` if the tag is not reserved.
    pub fn assign(&self, tag: &K, slot: SlotIndex) -> bool {
        let bucket = self.bucket_of(tag);
        let meta = self.header(bucket).lock.lock();
        match self.search(bucket, meta.len as usize, tag) {
            Ok(pos) => {
                unsafe { (*self.entries_ptr(bucket).add(pos)).slot = slot };
                true
            }
            Err(_) => false,
        }
    }

    /// Remove the reservation for `tag`, returning the slot it carried
    ///
    /// `None` if the tag was not reserved.
    pub fn release(&self, tag: &K) -> Option<SlotIndex> {
        let bucket = self.bucket_of(tag);
        let mut meta = self.header(bucket).lock.lock();
        let len = meta.len as usize;
        let pos = self.search(bucket, len, tag).ok()?;

        let slot = unsafe {
            let entries = self.entries_ptr(bucket);
            let slot = (*entries.add(pos)).slot;
            ptr::copy(entries.add(pos + 1), entries.add(pos), len - pos - 1);
            slot
        };
        meta.len -= 1;
        Some(slot)
    }

    /// Slot carried by `tag`; `Some(SlotIndex::NONE)` if reserved but unassigned
    pub fn lookup(&self, tag: &K) -> Option<SlotIndex> {
        let bucket = self.bucket_of(tag);
        let meta = self.header(bucket).lock.lock();
        self.search(bucket, meta.len as usize, tag)
            .ok()
            .map(|pos| unsafe { (*self.entries_ptr(bucket).add(pos)).slot })
    }

    #[inline]
    pub fn contains(&self, tag: &K) -> bool {
        self.lookup(tag).is_some()
    }

    pub fn bucket_len(&self, bucket: usize) -> usize {
        self.header(bucket).lock.lock().len as usize
    }

    /// Used by shutdown and drain logic to detect quiescence
    #[inline]
    pub fn bucket_is_empty(&self, bucket: usize) -> bool {
        self.bucket_len(bucket) == 0
    }

    /// Total reservations (sums buckets one at a time; not an atomic snapshot)
    pub fn len(&self) -> usize {
        (0..self.buckets).map(|b| self.bucket_len(b)).sum()
    }

    pub fn is_empty(&self) -> bool {
        (0..self.buckets).all(|b| self.bucket_is_empty(b))
    }

    /// Highest occupancy any single bucket has reached
    pub fn high_water(&self) -> usize {
        (0..self.buckets)
            .map(|b| self.header(b).lock.lock().high_water as usize)
            .max()
            .unwrap_or(0)
    }

    /// Copy of one bucket's entries in order (diagnostics only, allocates)
    pub fn bucket_snapshot(&self, bucket: usize) -> Vec<PartitionEntry<K>> {
        let meta = self.header(bucket).lock.lock();
        let entries =
            unsafe { core::slice::from_raw_parts(self.entries_ptr(bucket), meta.len as usize) };
        entries.to_vec()
    }

    #[inline]
    pub fn buckets(&self) -> usize {
        self.buckets
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
