//! Error types for the reactor scheduler

use core::fmt;
use std::any::Any;

use crate::id::FiberId;
use crate::state::FiberState;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Terminal result of a fiber body
pub type FiberResult = Result<(), FiberError>;

/// Errors that can occur in scheduler operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Called outside of a fiber step
    NotInFiber,

    /// No scheduler is running on this thread
    NoActiveScheduler,

    /// The scheduler behind a handle has been dropped
    SchedulerGone,

    /// `run()` called while the scheduler is already running
    AlreadyRunning,

    /// A previous `run()` ended with a fatal error
    Poisoned,

    /// Fiber is not tracked by this scheduler
    FiberNotFound(FiberId),

    /// Fiber was built against a different scheduler's handle
    ForeignFiber(FiberId),

    /// Fiber is not in the state an operation requires
    InvalidState {
        id: FiberId,
        expected: FiberState,
        actual: FiberState,
    },

    /// Fiber-local storage has no entry for this fiber
    MissingEntry(FiberId),

    /// Configuration rejected by `validate()`
    InvalidConfig(&'static str),

    /// Event loop adapter error (non-fatal context, e.g. a failed post)
    EventLoop(EventLoopError),

    /// Fail-fast termination of `run()`
    Fatal(FatalError),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::NotInFiber => write!(f, "not running inside a fiber"),
            SchedError::NoActiveScheduler => write!(f, "no scheduler running on this thread"),
            SchedError::SchedulerGone => write!(f, "scheduler has been dropped"),
            SchedError::AlreadyRunning => write!(f, "scheduler already running"),
            SchedError::Poisoned => write!(f, "scheduler poisoned by a fatal error"),
            SchedError::FiberNotFound(id) => write!(f, "fiber {} not found", id),
            SchedError::ForeignFiber(id) => {
                write!(f, "fiber {} was built for another scheduler", id)
            }
            SchedError::InvalidState { id, expected, actual } => {
                write!(f, "fiber {} is {}, expected {}", id, actual, expected)
            }
            SchedError::MissingEntry(id) => write!(f, "no local storage entry for fiber {}", id),
            SchedError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            SchedError::EventLoop(e) => write!(f, "event loop error: {}", e),
            SchedError::Fatal(e) => write!(f, "fatal: {}", e),
        }
    }
}

impl std::error::Error for SchedError {}

impl From<EventLoopError> for SchedError {
    fn from(e: EventLoopError) -> Self {
        SchedError::EventLoop(e)
    }
}

impl From<FatalError> for SchedError {
    fn from(e: FatalError) -> Self {
        SchedError::Fatal(e)
    }
}

/// Event loop adapter errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLoopError {
    /// A syscall failed with this errno
    Os(i32),

    /// A blocking wait returned without processing anything
    Stalled,
}

impl fmt::Display for EventLoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventLoopError::Os(code) => {
                write!(f, "{}", std::io::Error::from_raw_os_error(*code))
            }
            EventLoopError::Stalled => write!(f, "event loop is dead (no progress)"),
        }
    }
}

impl std::error::Error for EventLoopError {}

/// How a fiber body ended abnormally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The body panicked
    Panic,

    /// The body returned an error
    Error,

    /// The scheduler was dropped before the body finished
    Abandoned,
}

/// Failure captured on a fiber when its body ends abnormally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiberError {
    kind: FailureKind,
    message: String,
}

impl FiberError {
    /// Failure reported by a body's error result
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Error,
            message: message.into(),
        }
    }

    /// Failure from a panic payload caught around a step
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown error".to_string()
        };
        Self { kind: FailureKind::Panic, message }
    }

    /// The fiber never finished because its scheduler went away
    pub fn abandoned() -> Self {
        Self {
            kind: FailureKind::Abandoned,
            message: "scheduler dropped before fiber finished".to_string(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for FiberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Panic => write!(f, "panicked: {}", self.message),
            FailureKind::Error => write!(f, "{}", self.message),
            FailureKind::Abandoned => write!(f, "abandoned: {}", self.message),
        }
    }
}

impl std::error::Error for FiberError {}

/// Condition that stops the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// A fiber body failed
    Fiber {
        id: FiberId,
        name: String,
        error: FiberError,
    },

    /// The event loop can no longer make progress
    EventLoop(EventLoopError),
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::Fiber { name, error, .. } => write!(f, "thread {}: {}", name, error),
            FatalError::EventLoop(e) => write!(f, "fatal event loop error: {}", e),
        }
    }
}

impl std::error::Error for FatalError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = SchedError::InvalidState {
            id: FiberId::new(7),
            expected: FiberState::Running,
            actual: FiberState::Frozen,
        };
        assert_eq!(format!("{}", e), "fiber 7 is frozen, expected running");

        let e = SchedError::ForeignFiber(FiberId::new(4));
        assert_eq!(format!("{}", e), "fiber 4 was built for another scheduler");

        let e = SchedError::Fatal(FatalError::Fiber {
            id: FiberId::new(3),
            name: "uploader".into(),
            error: FiberError::failed("disk full"),
        });
        assert_eq!(format!("{}", e), "fatal: thread uploader: disk full");
    }

    #[test]
    fn test_error_conversion() {
        let sched_err: SchedError = EventLoopError::Stalled.into();
        assert!(matches!(sched_err, SchedError::EventLoop(EventLoopError::Stalled)));
    }

    #[test]
    fn test_panic_payloads() {
        let e = FiberError::from_panic(Box::new("static str"));
        assert_eq!(e.kind(), FailureKind::Panic);
        assert_eq!(e.message(), "static str");

        let e = FiberError::from_panic(Box::new(String::from("owned")));
        assert_eq!(e.message(), "owned");

        let e = FiberError::from_panic(Box::new(17u32));
        assert_eq!(e.message(), "unknown error");
        assert_eq!(e.to_string(), "panicked: unknown error");
    }
}
