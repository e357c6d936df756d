//! Per-fiber wakers
//!
//! Waking never touches the scheduler's sets directly: it queues a wake
//! request and posts a no-op so a blocked `run()` returns from its wait.
//! The request is applied on the scheduler thread after the next drain.

use crate::scheduler::Shared;

use reactor_core::id::FiberId;

use std::sync::{Arc, Weak};
use std::task::{Wake, Waker};

struct FiberWaker {
    fiber: FiberId,
    shared: Weak<Shared>,
}

impl Wake for FiberWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        // Scheduler gone: nothing left to wake
        if let Some(shared) = self.shared.upgrade() {
            shared.request_wake(self.fiber);
        }
    }
}

/// Build the waker handed to every step of `fiber`
pub(crate) fn fiber_waker(fiber: FiberId, shared: &Arc<Shared>) -> Waker {
    Waker::from(Arc::new(FiberWaker {
        fiber,
        shared: Arc::downgrade(shared),
    }))
}
