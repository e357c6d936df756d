//! Fiber lifecycle state

use core::fmt;

/// State of a fiber
///
/// ```text
///  Starting ──► Running ◄──► Frozen
///                  │
///                  ▼
///                Done
/// ```
///
/// A fiber only moves forward, except for the running/frozen oscillation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FiberState {
    /// Registered, waiting to be merged into the running set
    Starting = 0,

    /// Eligible for the current or next round
    Running = 1,

    /// Suspended until an external event unfreezes it
    Frozen = 2,

    /// Body finished (normally or not); never scheduled again
    Done = 3,
}

impl FiberState {
    /// Check if the fiber is still owned by a scheduler set
    #[inline]
    pub const fn is_alive(&self) -> bool {
        !matches!(self, FiberState::Done)
    }

    /// Check if the fiber has terminated
    #[inline]
    pub const fn is_done(&self) -> bool {
        matches!(self, FiberState::Done)
    }

    /// Whether `self -> next` is a legal lifecycle transition
    pub const fn can_transition_to(&self, next: FiberState) -> bool {
        matches!(
            (self, next),
            (FiberState::Starting, FiberState::Running)
                | (FiberState::Running, FiberState::Frozen)
                | (FiberState::Frozen, FiberState::Running)
                | (FiberState::Running, FiberState::Done)
                // Fibers still alive when their scheduler goes away are abandoned
                | (FiberState::Starting, FiberState::Done)
                | (FiberState::Frozen, FiberState::Done)
        )
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Starting,
            1 => FiberState::Running,
            2 => FiberState::Frozen,
            _ => FiberState::Done,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Starting => write!(f, "starting"),
            FiberState::Running => write!(f, "running"),
            FiberState::Frozen => write!(f, "frozen"),
            FiberState::Done => write!(f, "done"),
        }
    }
}
