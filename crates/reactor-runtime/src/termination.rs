//! One-shot termination signal carried by every fiber
//!
//! Listeners run exactly once, on the thread that finishes the fiber, after
//! the fiber is marked done. Subscribing to an already-fired signal fails so
//! callers know the fiber is gone.

use crate::lock;
use reactor_core::id::FiberId;
use std::sync::Mutex;

pub(crate) type Listener = Box<dyn FnOnce(FiberId) + Send + 'static>;

struct Listeners {
    fired: bool,
    next_key: u64,
    entries: Vec<(u64, Listener)>,
}

pub(crate) struct Termination {
    inner: Mutex<Listeners>,
}

impl Termination {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Listeners {
                fired: false,
                next_key: 0,
                entries: Vec::new(),
            }),
        }
    }

    /// Register a listener; `None` if the signal already fired
    pub(crate) fn subscribe(&self, listener: Listener) -> Option<u64> {
        let mut inner = lock(&self.inner);
        if inner.fired {
            return None;
        }
        let key = inner.next_key;
        inner.next_key += 1;
        inner.entries.push((key, listener));
        Some(key)
    }

    pub(crate) fn unsubscribe(&self, key: u64) -> bool {
        let mut inner = lock(&self.inner);
        let before = inner.entries.len();
        inner.entries.retain(|(k, _)| *k != key);
        inner.entries.len() != before
    }

    /// Fire once; later calls are no-ops
    pub(crate) fn fire(&self, id: FiberId) {
        let entries = {
            let mut inner = lock(&self.inner);
            if inner.fired {
                return;
            }
            inner.fired = true;
            std::mem::take(&mut inner.entries)
        };
        // Lock released: listeners may subscribe elsewhere or drop subscriptions
        for (_, listener) in entries {
            listener(id);
        }
    }

    pub(crate) fn listener_count(&self) -> usize {
        lock(&self.inner).entries.len()
    }
}
