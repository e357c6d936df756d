//! Event loop adapters
//!
//! The scheduler never performs I/O itself. It uses an event loop as a wake
//! source and as the place to block when every fiber is frozen.
//! Platform-specific implementations use the most efficient primitive available.

mod timers;

pub use timers::TimerHandle;
pub(crate) use timers::TimerQueue;

use reactor_core::error::EventLoopError;
use std::time::Duration;

use crate::config::LoopBackend;

/// Zero-argument callback run during a drain of the loop
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Asynchronous dispatch substrate driven by the scheduler
///
/// `post` and `post_after` may be called from any thread. `poll` and
/// `run_one` are only called by the thread driving `Scheduler::run`.
pub trait EventLoop: Send + Sync {
    /// Schedule a callback for a future drain
    fn post(&self, callback: Callback) -> Result<(), EventLoopError>;

    /// Schedule a callback to run once `delay` has elapsed
    fn post_after(&self, delay: Duration, callback: Callback) -> Result<TimerHandle, EventLoopError>;

    /// Cancel a pending timer
    ///
    /// Returns true if the timer had not fired yet.
    fn cancel(&self, timer: TimerHandle) -> bool;

    /// Run every callback and timer that is ready now, without blocking
    ///
    /// Callbacks posted while polling run on the next poll. Returns the
    /// number of callbacks executed.
    fn poll(&self) -> Result<usize, EventLoopError>;

    /// Block until at least one callback or timer has been processed
    ///
    /// Returns the number processed. Well-behaved adapters never return
    /// `Ok(0)`.
    fn run_one(&self) -> Result<usize, EventLoopError>;

    /// Adapter name for debugging
    fn name(&self) -> &'static str {
        "unknown"
    }
}

// Platform-specific implementations
mod fallback;
pub use fallback::CondvarLoop;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod eventfd_linux;
        pub use eventfd_linux::EventFdLoop;
        pub use eventfd_linux::EventFdLoop as PlatformLoop;
    } else {
        pub use fallback::CondvarLoop as PlatformLoop;
    }
}

/// Create a new event loop for the requested backend
pub fn new_event_loop(backend: LoopBackend) -> Result<Box<dyn EventLoop>, EventLoopError> {
    match backend {
        LoopBackend::Platform => Ok(Box::new(PlatformLoop::new()?)),
        LoopBackend::Fallback => Ok(Box::new(CondvarLoop::new())),
    }
}

/// Millisecond timeout for a blocking wait until `deadline_in`
///
/// Rounds up so a wait never returns just before a timer is due.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn timeout_ms(deadline_in: Option<Duration>) -> i32 {
    match deadline_in {
        None => -1,
        Some(d) if d.is_zero() => 0,
        Some(d) => {
            let ms = d.as_nanos().div_ceil(1_000_000);
            ms.min(i32::MAX as u128) as i32
        }
    }
}
