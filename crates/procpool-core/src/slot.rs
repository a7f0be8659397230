//! Slot index type

use core::fmt;
use crate::constants::NONE;

/// Position of a task node in the ring
///
/// Every cross-process reference to a task is one of these, never a pointer:
/// each process resolves it against its own mapping of the segment.
/// `u32::MAX` is reserved as the "no slot" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SlotIndex(u32);

impl SlotIndex {
    /// Sentinel value indicating no slot
    pub const NONE: SlotIndex = SlotIndex(NONE);

    #[inline]
    pub const fn new(index: u32) -> Self {
        SlotIndex(index)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Get as usize for indexing
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == NONE
    }

    /// Convert to Option
    #[inline]
    pub const fn to_option(self) -> Option<SlotIndex> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

impl From<u32> for SlotIndex {
    #[inline]
    fn from(index: u32) -> Self {
        SlotIndex(index)
    }
}

impl fmt::Debug for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "SlotIndex(NONE)")
        } else {
            write!(f, "SlotIndex({})", self.0)
        }
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "-")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}
