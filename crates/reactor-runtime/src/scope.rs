//! Explicit execution context handed to every fiber body
//!
//! A `Scope` is the fiber's own handle plus a handle to the scheduler it was
//! built for. It is `Send`, so bodies stay `Send` while holding it across
//! suspension points.

use crate::event_loop::TimerHandle;
use crate::fiber::{FiberOutput, FiberRef, Join};
use crate::lock;
use crate::scheduler::SchedulerHandle;

use reactor_core::error::SchedResult;
use reactor_core::id::FiberId;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Scope {
    fiber: FiberRef,
    scheduler: SchedulerHandle,
}

impl Scope {
    pub(crate) fn new(fiber: FiberRef, scheduler: SchedulerHandle) -> Self {
        Self { fiber, scheduler }
    }

    /// Handle of the fiber running this body
    pub fn fiber(&self) -> &FiberRef {
        &self.fiber
    }

    pub fn id(&self) -> FiberId {
        self.fiber.id()
    }

    pub fn name(&self) -> &str {
        self.fiber.name()
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Suspend until something unfreezes this fiber
    ///
    /// Resolves on the first poll after the fiber was unfrozen, either
    /// explicitly (`unfreeze`) or through its waker.
    pub fn freeze(&self) -> Freeze {
        Freeze { armed: false }
    }

    /// Give up the rest of this round; runs again next round
    pub fn yield_now(&self) -> YieldNow {
        YieldNow { yielded: false }
    }

    /// Suspend for at least `delay`, using the event loop's timers
    pub fn sleep(&self, delay: Duration) -> Sleep {
        Sleep {
            scheduler: self.scheduler.clone(),
            delay,
            state: Arc::new(SleepState {
                fired: AtomicBool::new(false),
                waker: Mutex::new(None),
            }),
            timer: None,
        }
    }

    /// Spawn a sibling fiber on the same scheduler
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, body: F) -> SchedResult<FiberRef>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: FiberOutput,
    {
        self.scheduler.spawn(name, body)
    }

    /// Wait for `fiber` to finish
    pub fn join(&self, fiber: &FiberRef) -> Join {
        fiber.join()
    }
}

/// Future returned by `Scope::freeze`
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct Freeze {
    armed: bool,
}

impl Future for Freeze {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.armed {
            return Poll::Ready(());
        }
        // The scheduler freezes any fiber whose step returns Pending
        self.armed = true;
        Poll::Pending
    }
}

/// Future returned by `Scope::yield_now`
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

struct SleepState {
    fired: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

/// Future returned by `Scope::sleep`
///
/// Fails only if the scheduler is gone or the timer could not be armed.
/// Dropping it before it fires cancels the timer.
#[must_use = "futures do nothing unless awaited"]
pub struct Sleep {
    scheduler: SchedulerHandle,
    delay: Duration,
    state: Arc<SleepState>,
    timer: Option<TimerHandle>,
}

impl Future for Sleep {
    type Output = SchedResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<SchedResult<()>> {
        if self.state.fired.load(Ordering::Acquire) {
            self.timer = None;
            return Poll::Ready(Ok(()));
        }
        *lock(&self.state.waker) = Some(cx.waker().clone());
        if self.timer.is_none() {
            let state = Arc::clone(&self.state);
            let armed = self.scheduler.post_after(self.delay, move || {
                state.fired.store(true, Ordering::Release);
                if let Some(waker) = lock(&state.waker).take() {
                    waker.wake();
                }
            });
            match armed {
                Ok(timer) => self.timer = Some(timer),
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            if !self.state.fired.load(Ordering::Acquire) {
                self.scheduler.cancel_timer(timer);
            }
        }
    }
}

impl std::fmt::Debug for Sleep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sleep")
            .field("delay", &self.delay)
            .field("fired", &self.state.fired.load(Ordering::Relaxed))
            .finish()
    }
}
