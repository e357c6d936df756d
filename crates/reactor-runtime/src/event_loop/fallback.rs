//! Fallback event loop using std::sync::Condvar
//!
//! Used on platforms without eventfd, or when forced through
//! `LoopBackend::Fallback`. Less efficient but portable.

use super::{Callback, EventLoop, TimerHandle, TimerQueue};
use crate::lock;

use reactor_core::error::EventLoopError;

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

struct LoopState {
    queue: VecDeque<Callback>,
    timers: TimerQueue,
}

/// Condvar-based event loop (fallback)
pub struct CondvarLoop {
    state: Mutex<LoopState>,
    ready: Condvar,
}

impl CondvarLoop {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopState {
                queue: VecDeque::new(),
                timers: TimerQueue::new(),
            }),
            ready: Condvar::new(),
        }
    }
}

impl Default for CondvarLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop for CondvarLoop {
    fn post(&self, callback: Callback) -> Result<(), EventLoopError> {
        lock(&self.state).queue.push_back(callback);
        self.ready.notify_one();
        Ok(())
    }

    fn post_after(&self, delay: Duration, callback: Callback) -> Result<TimerHandle, EventLoopError> {
        let handle = lock(&self.state).timers.insert(Instant::now() + delay, callback);
        self.ready.notify_one();
        Ok(handle)
    }

    fn cancel(&self, timer: TimerHandle) -> bool {
        lock(&self.state).timers.cancel(timer)
    }

    fn poll(&self) -> Result<usize, EventLoopError> {
        // Run callbacks with the lock released so they can post again
        let (expired, ready) = {
            let mut state = lock(&self.state);
            let expired = state.timers.take_expired(Instant::now());
            (expired, std::mem::take(&mut state.queue))
        };
        let count = expired.len() + ready.len();
        for cb in expired.into_iter().chain(ready) {
            cb();
        }
        Ok(count)
    }

    fn run_one(&self) -> Result<usize, EventLoopError> {
        loop {
            let count = self.poll()?;
            if count > 0 {
                return Ok(count);
            }

            let mut state = lock(&self.state);
            if !state.queue.is_empty() {
                continue;
            }
            let next = state.timers.next_deadline();
            match next {
                None => {
                    let _guard = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        let _guard = self
                            .ready
                            .wait_timeout(state, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "condvar"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_and_callback_counted_together() {
        let lp = CondvarLoop::new();
        lp.post_after(Duration::ZERO, Box::new(|| {})).unwrap();
        lp.post(Box::new(|| {})).unwrap();
        assert_eq!(lp.poll().unwrap(), 2);
        assert_eq!(lp.poll().unwrap(), 0);
    }
}
