//! Linux eventfd-based event loop
//!
//! Posted callbacks go through a lock-free queue; the poster then bumps an
//! eventfd so a blocked `run_one` wakes up. Multiple posts before the loop
//! reads the eventfd coalesce into a single wakeup (eventfd counter
//! semantics), which is fine because a drain empties the queue.
//!
//! Blocking waits are `poll(2)` on the eventfd with a timeout derived from
//! the earliest timer deadline.

use super::{timeout_ms, Callback, EventLoop, TimerHandle, TimerQueue};
use crate::lock;

use crossbeam_queue::SegQueue;
use nix::errno::Errno;
use reactor_core::error::EventLoopError;

use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct EventFdLoop {
    fd: RawFd,
    queue: SegQueue<Callback>,
    timers: Mutex<TimerQueue>,
}

impl EventFdLoop {
    /// Create the loop and its eventfd
    pub fn new() -> Result<Self, EventLoopError> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(EventLoopError::Os(Errno::last() as i32));
        }
        Ok(Self {
            fd,
            queue: SegQueue::new(),
            timers: Mutex::new(TimerQueue::new()),
        })
    }

    /// Raw eventfd descriptor
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    fn notify(&self) -> Result<(), EventLoopError> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            match Errno::last() {
                // Counter saturated: a wakeup is already pending
                Errno::EAGAIN => return Ok(()),
                err => return Err(EventLoopError::Os(err as i32)),
            }
        }
        Ok(())
    }

    /// Reset the eventfd counter
    fn consume(&self) -> Result<(), EventLoopError> {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            match Errno::last() {
                Errno::EAGAIN => return Ok(()),
                err => return Err(EventLoopError::Os(err as i32)),
            }
        }
        Ok(())
    }

    /// Wait for the eventfd to become readable
    fn wait(&self, timeout: i32) -> Result<(), EventLoopError> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout) };
            if ret >= 0 {
                return Ok(());
            }
            match Errno::last() {
                Errno::EINTR => continue,
                err => return Err(EventLoopError::Os(err as i32)),
            }
        }
    }
}

impl EventLoop for EventFdLoop {
    fn post(&self, callback: Callback) -> Result<(), EventLoopError> {
        self.queue.push(callback);
        self.notify()
    }

    fn post_after(&self, delay: Duration, callback: Callback) -> Result<TimerHandle, EventLoopError> {
        let handle = lock(&self.timers).insert(Instant::now() + delay, callback);
        // A loop blocked with a later (or no) deadline must recompute its timeout
        self.notify()?;
        Ok(handle)
    }

    fn cancel(&self, timer: TimerHandle) -> bool {
        lock(&self.timers).cancel(timer)
    }

    fn poll(&self) -> Result<usize, EventLoopError> {
        self.consume()?;

        let expired = lock(&self.timers).take_expired(Instant::now());
        let mut count = expired.len();
        for cb in expired {
            cb();
        }

        // Only what was queued when the drain started
        let ready = self.queue.len();
        for _ in 0..ready {
            match self.queue.pop() {
                Some(cb) => {
                    cb();
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }

    fn run_one(&self) -> Result<usize, EventLoopError> {
        loop {
            let count = self.poll()?;
            if count > 0 {
                return Ok(count);
            }
            if !self.queue.is_empty() {
                continue;
            }
            let deadline_in = lock(&self.timers)
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()));
            self.wait(timeout_ms(deadline_in))?;
        }
    }

    fn name(&self) -> &'static str {
        "eventfd"
    }
}

impl Drop for EventFdLoop {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_coalesces() {
        let lp = EventFdLoop::new().unwrap();
        assert!(lp.fd() >= 0);
        for _ in 0..3 {
            lp.notify().unwrap();
        }
        // One read clears every pending notification
        lp.consume().unwrap();
        lp.wait(0).unwrap();
        lp.consume().unwrap();
    }

    #[test]
    fn test_run_one_returns_after_post() {
        let lp = EventFdLoop::new().unwrap();
        lp.post(Box::new(|| {})).unwrap();
        assert_eq!(lp.run_one().unwrap(), 1);
        assert_eq!(lp.poll().unwrap(), 0);
    }
}
