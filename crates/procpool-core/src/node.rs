//! Task node record
//!
//! A `TaskNode<N>` is the common header (slot, state, outcome) plus the
//! caller-defined payload `N`. The payload lives in shared memory while the
//! task is in flight, so it must be plain data: `Copy`, no heap ownership.
//!
//! Workers copy the payload out of the slot, run the handler on a local
//! node, and copy the result back. Clients receive a local copy on drain.

use crate::slot::SlotIndex;
use crate::state::{SlotState, TaskOutcome};

/// One unit of work with its engine-maintained header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskNode<N> {
    slot: SlotIndex,
    state: SlotState,
    outcome: TaskOutcome,
    /// Caller-defined payload; handlers write their result here
    pub payload: N,
}

impl<N: Copy> TaskNode<N> {
    /// A node not yet placed in the ring
    pub const fn new(payload: N) -> Self {
        Self {
            slot: SlotIndex::NONE,
            state: SlotState::Free,
            outcome: TaskOutcome::Pending,
            payload,
        }
    }

    /// Rebuild a node from its slot header fields
    pub const fn from_parts(
        slot: SlotIndex,
        state: SlotState,
        outcome: TaskOutcome,
        payload: N,
    ) -> Self {
        Self { slot, state, outcome, payload }
    }

    /// Ring position; stable for the node's in-flight lifetime
    #[inline]
    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    /// Slot state at the time this copy was taken
    #[inline]
    pub fn state(&self) -> SlotState {
        self.state
    }

    #[inline]
    pub fn outcome(&self) -> TaskOutcome {
        self.outcome
    }

    /// Handler reported success
    #[inline]
    pub fn succeeded(&self) -> bool {
        self.outcome == TaskOutcome::Succeeded
    }

    #[inline]
    pub fn payload(&self) -> &N {
        &self.payload
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut N {
        &mut self.payload
    }

    #[inline]
    pub fn into_payload(self) -> N {
        self.payload
    }
}
