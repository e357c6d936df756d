//! # reactor - Cooperative Fiber Scheduler
//!
//! Single-threaded, round-based scheduling of fibers on top of an event
//! loop. A fiber runs until it suspends or completes; nothing is preempted.
//!
//! ## Features
//!
//! - **Round-based**: every runnable fiber is stepped once per round, in arrival order
//! - **Freeze / unfreeze**: suspended fibers stay parked until an event wakes them
//! - **Event loop driven**: eventfd on Linux, condvar elsewhere; timers built in
//! - **Cross-thread registration**: `SchedulerHandle` is `Send + Sync`
//! - **Fiber-local storage**: values cleaned up when their fiber finishes
//! - **Typed failures**: a failing fiber stops `run()` with a `Fatal` error by default
//!
//! ## Quick Start
//!
//! ```ignore
//! use reactor::{Runtime, SchedulerConfig};
//! use std::time::Duration;
//!
//! fn main() {
//!     let runtime = Runtime::new(SchedulerConfig::default()).unwrap();
//!
//!     runtime
//!         .block_on("main", |scope| async move {
//!             let worker = scope
//!                 .spawn("worker", |scope| async move {
//!                     scope.sleep(Duration::from_millis(10)).await?;
//!                     println!("worker woke up");
//!                     Ok::<(), reactor::SchedError>(())
//!                 })
//!                 .map_err(|e| e.to_string())?;
//!             scope.join(&worker).await.map_err(|e| e.to_string())
//!         })
//!         .unwrap();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        spawn(), scope.freeze(), scope.sleep(), join         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Scheduler                              │
//! │     starting → running ⇄ frozen → done, one round at a time │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                     Event Loop                          │
//!    │     posted callbacks, timers, blocking wait             │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use reactor_core::{
    EventLoopError,
    FailureKind,
    FatalError,
    FiberError,
    FiberId,
    FiberResult,
    FiberState,
    SchedError,
    SchedResult,
};

// Re-export kprint macros for debug logging
pub use reactor_core::{kprint, kprintln, kerror, kwarn, kinfo, kdebug, ktrace};
pub use reactor_core::kprint::{LogLevel, init as init_logging, set_log_level, set_flush_enabled};

// Re-export env utilities
pub use reactor_core::{env_get, env_get_bool, env_get_opt, env_get_str};

// Re-export runtime types
pub use reactor_runtime::{
    new_event_loop,
    Callback,
    EventLoop,
    FailurePolicy,
    Fiber,
    FiberOutput,
    FiberRef,
    Freeze,
    Join,
    LocalStorage,
    LoopBackend,
    Scheduler,
    SchedulerConfig,
    SchedulerHandle,
    SchedulerStats,
    Scope,
    Sleep,
    Subscription,
    TimerHandle,
    WeakFiber,
    YieldNow,
};
pub use reactor_runtime::scheduler::{freeze, try_freeze, try_unfreeze, unfreeze};

use std::future::Future;

/// Owns a scheduler for the calling thread
///
/// Thin convenience over `Scheduler`: initializes logging and offers
/// `block_on` for the common "run one main fiber to completion" case.
pub struct Runtime {
    scheduler: Scheduler,
}

impl Runtime {
    /// Create a runtime with the given configuration
    pub fn new(config: SchedulerConfig) -> SchedResult<Self> {
        init_logging();
        Ok(Self {
            scheduler: Scheduler::new(config)?,
        })
    }

    /// Create a runtime configured from `REACTOR_*` environment variables
    pub fn from_env() -> SchedResult<Self> {
        Self::new(SchedulerConfig::from_env())
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    /// Register a fiber for the next `run()`
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, body: F) -> SchedResult<FiberRef>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: FiberOutput,
    {
        self.scheduler.spawn(name, body)
    }

    /// Run until every fiber is done
    pub fn run(&self) -> SchedResult<()> {
        self.scheduler.run()
    }

    /// Spawn `body` as the main fiber and run until every fiber is done
    ///
    /// A failure of the main fiber is returned as `Fatal` even under
    /// `FailurePolicy::Isolate`.
    pub fn block_on<F, Fut>(&self, name: impl Into<String>, body: F) -> SchedResult<()>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: FiberOutput,
    {
        let main = self.scheduler.spawn(name, body)?;
        self.scheduler.run()?;
        match main.result() {
            Some(Err(error)) => Err(SchedError::Fatal(FatalError::Fiber {
                id: main.id(),
                name: main.name().to_string(),
                error,
            })),
            _ => Ok(()),
        }
    }
}

/// Get the current fiber
///
/// Returns `None` outside a fiber step.
#[inline]
pub fn current() -> Option<FiberRef> {
    reactor_runtime::tls::current()
}

/// Get the current fiber's ID
///
/// Returns `FiberId::NONE` if not running in a fiber.
#[inline]
pub fn current_id() -> FiberId {
    current().map(|fiber| fiber.id()).unwrap_or(FiberId::NONE)
}

/// Check if currently executing within a fiber
#[inline]
pub fn is_in_fiber() -> bool {
    reactor_runtime::tls::is_in_fiber()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_block_on_runs_spawned_fibers() {
        let runtime = Runtime::new(SchedulerConfig::default()).unwrap();
        let ids = Arc::new(Mutex::new(Vec::new()));
        let i = Arc::clone(&ids);
        runtime
            .block_on("main", move |scope| async move {
                assert!(is_in_fiber());
                i.lock().unwrap().push(current_id());
                let i2 = Arc::clone(&i);
                let child = scope
                    .spawn("child", move |_| async move {
                        i2.lock().unwrap().push(current_id());
                    })
                    .map_err(|e| e.to_string())?;
                scope.join(&child).await.map_err(|e| e.to_string())
            })
            .unwrap();

        let ids = ids.lock().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|id| id.is_some()));
        assert_ne!(ids[0], ids[1]);
        assert_eq!(current_id(), FiberId::NONE);
        assert!(!is_in_fiber());
    }

    #[test]
    fn test_block_on_reports_isolated_main_failure() {
        let config = SchedulerConfig::new().failure_policy(FailurePolicy::Isolate);
        let runtime = Runtime::new(config).unwrap();
        let err = runtime
            .block_on("main", |_| async { Err::<(), _>("no input") })
            .unwrap_err();
        match err {
            SchedError::Fatal(FatalError::Fiber { name, error, .. }) => {
                assert_eq!(name, "main");
                assert_eq!(error.kind(), FailureKind::Error);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
