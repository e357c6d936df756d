//! Thread-local scheduler context
//!
//! Provides the ambient "current fiber" and "active scheduler" bindings for
//! code that is not handed a `Scope`. Both are valid only on the thread
//! driving `Scheduler::run`, and the current fiber only during its step.

use crate::fiber::FiberRef;
use crate::scheduler::Core;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

thread_local! {
    /// Fiber being stepped on this thread
    static CURRENT_FIBER: RefCell<Option<FiberRef>> = const { RefCell::new(None) };

    /// Scheduler whose `run()` is executing on this thread
    static ACTIVE: RefCell<Option<Weak<Core>>> = const { RefCell::new(None) };
}

/// Set the fiber about to be stepped, returning the one it displaces
///
/// A step of a fiber that drives a nested scheduler displaces the outer
/// fiber; hand the result back to `restore_current` once the step ends.
#[inline]
pub(crate) fn set_current(fiber: FiberRef) -> Option<FiberRef> {
    CURRENT_FIBER.with(|cell| cell.borrow_mut().replace(fiber))
}

/// Put back the binding displaced by `set_current` (step finished)
#[inline]
pub(crate) fn restore_current(previous: Option<FiberRef>) {
    // Swap first so the finished handle drops after the borrow ends
    let finished = CURRENT_FIBER.with(|cell| std::mem::replace(&mut *cell.borrow_mut(), previous));
    drop(finished);
}

/// Fiber currently stepping on this thread, if any
#[inline]
pub fn current() -> Option<FiberRef> {
    CURRENT_FIBER.with(|cell| cell.borrow().clone())
}

/// Check if we're running inside a fiber step
#[inline]
pub fn is_in_fiber() -> bool {
    CURRENT_FIBER.with(|cell| cell.borrow().is_some())
}

/// Restores the previous active scheduler when dropped
pub(crate) struct ActiveGuard {
    previous: Option<Weak<Core>>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        ACTIVE.with(|cell| *cell.borrow_mut() = previous);
    }
}

/// Bind `core` as this thread's active scheduler for the guard's lifetime
pub(crate) fn enter(core: &Rc<Core>) -> ActiveGuard {
    let previous = ACTIVE.with(|cell| cell.borrow_mut().replace(Rc::downgrade(core)));
    ActiveGuard { previous }
}

/// Run `f` against the active scheduler, `None` if there is none
pub(crate) fn with_active<R>(f: impl FnOnce(&Core) -> R) -> Option<R> {
    // Upgrade and release the borrow before calling out
    let core = ACTIVE.with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade))?;
    Some(f(&core))
}
