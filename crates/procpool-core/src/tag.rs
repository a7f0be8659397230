//! Pluggable tag hashing and ordering
//!
//! The partition index never looks inside a tag. It only needs a bucket hash
//! and a total order, both supplied by the caller as plain function pointers
//! so they stay valid in every forked process.

use core::cmp::Ordering;
use std::hash::{DefaultHasher, Hash, Hasher};

/// Hash and comparison functions over a fixed-size tag type
pub struct TagOps<K> {
    /// Bucket hash; reduced modulo the bucket count by the index.
    /// May be coarse: distinct tags sharing a bucket never block each other.
    pub hash: fn(&K) -> u32,

    /// Total order; `Equal` means "same tag" and blocks a reservation.
    pub compare: fn(&K, &K) -> Ordering,
}

impl<K> TagOps<K> {
    pub const fn new(hash: fn(&K) -> u32, compare: fn(&K, &K) -> Ordering) -> Self {
        Self { hash, compare }
    }

    #[inline]
    pub fn bucket(&self, tag: &K, buckets: usize) -> usize {
        (self.hash)(tag) as usize % buckets
    }
}

impl<K: Hash + Ord> TagOps<K> {
    /// `Hash` + `Ord` based operations.
    ///
    /// `DefaultHasher::new()` uses fixed keys, so every process running the
    /// same binary maps a tag to the same bucket.
    pub fn natural() -> Self {
        Self {
            hash: hash_with_default::<K>,
            compare: <K as Ord>::cmp,
        }
    }
}

fn hash_with_default<K: Hash>(tag: &K) -> u32 {
    let mut hasher = DefaultHasher::new();
    tag.hash(&mut hasher);
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

impl<K> Clone for TagOps<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for TagOps<K> {}

impl<K> core::fmt::Debug for TagOps<K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TagOps").finish_non_exhaustive()
    }
}
