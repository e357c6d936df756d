//! # reactor-runtime
//!
//! Runtime implementation for the reactor cooperative fiber scheduler.
//!
//! This crate provides:
//! - Event loop adapters (eventfd on Linux, condvar fallback elsewhere)
//! - One-shot timers shared by every adapter
//! - Fibers: owned resumable computations with a lifecycle state machine
//! - The scheduler round loop with cross-thread registration
//! - Fiber-local storage cleaned up on fiber termination
//! - Thread-confined bindings for the current fiber and scheduler

pub mod config;
pub mod event_loop;
pub mod fiber;
pub mod scheduler;
pub mod scope;
pub mod storage;
pub mod tls;

mod set;
mod termination;
mod waker;

// Re-exports
pub use config::{FailurePolicy, LoopBackend, SchedulerConfig};
pub use event_loop::{new_event_loop, Callback, EventLoop, TimerHandle};
pub use fiber::{Fiber, FiberOutput, FiberRef, Join, Subscription, WeakFiber};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerStats};
pub use scope::{Freeze, Scope, Sleep, YieldNow};
pub use storage::LocalStorage;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking fiber poisoned it
///
/// Panics inside fiber bodies are caught and turned into fiber failures, so
/// poisoning carries no extra information here.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
