//! Slot, worker and task outcome state enums
//!
//! All three are stored as `u8` in the shared segment, so each has a
//! `repr(u8)` and lossless `From<u8>` conversion.

use core::fmt;

/// State of a ring slot
///
/// The state decides which component may touch the slot:
/// the ring while Queued, a worker while Running, the owning client while
/// Finished. Zeroed memory reads as `Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// Available for allocation
    Free = 0,

    /// Allocated by a submitter, waiting for a worker
    Queued = 1,

    /// Claimed by a worker, handler executing
    Running = 2,

    /// Handler returned, waiting for the submitter to drain it
    Finished = 3,
}

impl SlotState {
    /// Slot holds a task (anything but Free)
    #[inline]
    pub const fn is_occupied(&self) -> bool {
        !matches!(self, SlotState::Free)
    }

    /// Slot still has work outstanding (Queued or Running)
    #[inline]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, SlotState::Queued | SlotState::Running)
    }

    /// Check that `self -> next` is a legal transition
    #[inline]
    pub const fn can_transition_to(&self, next: SlotState) -> bool {
        matches!(
            (self, next),
            (SlotState::Free, SlotState::Queued)
                | (SlotState::Queued, SlotState::Running)
                | (SlotState::Running, SlotState::Finished)
                | (SlotState::Finished, SlotState::Free)
        )
    }
}

impl From<u8> for SlotState {
    fn from(v: u8) -> Self {
        match v {
            1 => SlotState::Queued,
            2 => SlotState::Running,
            3 => SlotState::Finished,
            _ => SlotState::Free,
        }
    }
}

impl From<SlotState> for u8 {
    fn from(state: SlotState) -> u8 {
        state as u8
    }
}

/// Lifecycle state of a worker
///
/// `Starting -> Idle -> Running -> Idle -> ... -> Draining -> Stopped`,
/// or `Starting -> Failed` when the startup callback fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Entry unused or worker not yet spawned
    Unused = 0,

    /// Spawned, running the startup callback
    Starting = 1,

    /// Waiting for work
    Idle = 2,

    /// Executing a handler
    Running = 3,

    /// Shutdown observed, running cleanup
    Draining = 4,

    /// Exited normally
    Stopped = 5,

    /// Startup failed or the worker died
    Failed = 6,
}

impl WorkerState {
    /// Worker finished starting (successfully or not)
    #[inline]
    pub const fn is_started(&self) -> bool {
        !matches!(self, WorkerState::Unused | WorkerState::Starting)
    }

    /// Worker has exited
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed)
    }
}

impl From<u8> for WorkerState {
    fn from(v: u8) -> Self {
        match v {
            1 => WorkerState::Starting,
            2 => WorkerState::Idle,
            3 => WorkerState::Running,
            4 => WorkerState::Draining,
            5 => WorkerState::Stopped,
            6 => WorkerState::Failed,
            _ => WorkerState::Unused,
        }
    }
}

impl From<WorkerState> for u8 {
    fn from(state: WorkerState) -> u8 {
        state as u8
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Unused => write!(f, "unused"),
            WorkerState::Starting => write!(f, "starting"),
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Draining => write!(f, "draining"),
            WorkerState::Stopped => write!(f, "stopped"),
            WorkerState::Failed => write!(f, "failed"),
        }
    }
}

/// What happened to a task, as seen by the completion callback
///
/// The engine never interprets this; it only records it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskOutcome {
    /// Not executed yet
    Pending = 0,

    /// Handler returned `true`
    Succeeded = 1,

    /// Handler returned `false` or panicked
    Failed = 2,

    /// The worker running it died; payload is whatever was submitted
    Abandoned = 3,
}

impl TaskOutcome {
    #[inline]
    pub const fn from_handler(ok: bool) -> Self {
        if ok {
            TaskOutcome::Succeeded
        } else {
            TaskOutcome::Failed
        }
    }
}

impl From<u8> for TaskOutcome {
    fn from(v: u8) -> Self {
        match v {
            1 => TaskOutcome::Succeeded,
            2 => TaskOutcome::Failed,
            3 => TaskOutcome::Abandoned,
            _ => TaskOutcome::Pending,
        }
    }
}

impl From<TaskOutcome> for u8 {
    fn from(outcome: TaskOutcome) -> u8 {
        outcome as u8
    }
}
