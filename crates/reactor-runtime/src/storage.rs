//! Fiber-local storage
//!
//! A `LocalStorage<T>` maps fibers to values. The first insertion for a
//! fiber subscribes to its termination, and the entry is erased when the
//! fiber reaches `done`. Neither side owns the other: the storage keeps a
//! `Subscription` (weak back-reference to the fiber) and the termination
//! listener keeps only a weak reference to the storage.
//!
//! Thread-safe: fibers of different schedulers on different threads may
//! share one storage.

use crate::fiber::{FiberRef, Subscription};
use crate::lock;
use crate::tls;

use reactor_core::error::{SchedError, SchedResult};
use reactor_core::id::FiberId;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

struct Entries<T> {
    content: HashMap<FiberId, T>,
    links: HashMap<FiberId, Subscription>,
}

pub struct LocalStorage<T> {
    inner: Arc<Mutex<Entries<T>>>,
}

impl<T> Clone for LocalStorage<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Default for LocalStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> LocalStorage<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Entries {
                content: HashMap::new(),
                links: HashMap::new(),
            })),
        }
    }

    /// Subscribe the cleanup listener; false if the fiber is already done
    fn link(&self, entries: &mut Entries<T>, fiber: &FiberRef) -> bool {
        if entries.links.contains_key(&fiber.id()) {
            return true;
        }
        let weak = Arc::downgrade(&self.inner);
        let subscription = fiber.on_done(move |id| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let (value, link) = {
                let mut entries = lock(&inner);
                (entries.content.remove(&id), entries.links.remove(&id))
            };
            // Values and the spent subscription drop outside the lock
            drop(value);
            drop(link);
        });
        match subscription {
            Some(sub) => {
                entries.links.insert(fiber.id(), sub);
                true
            }
            None => false,
        }
    }

    /// Stored value for `fiber`, inserting `default` on first access
    ///
    /// For a fiber that is already done, `default` is returned without
    /// being stored.
    pub fn get_or_default(&self, fiber: &FiberRef, default: T) -> T
    where
        T: Clone,
    {
        let mut entries = lock(&self.inner);
        if let Some(value) = entries.content.get(&fiber.id()) {
            return value.clone();
        }
        if self.link(&mut entries, fiber) {
            entries.content.insert(fiber.id(), default.clone());
        }
        default
    }

    /// Stored value for `fiber`
    pub fn get(&self, fiber: &FiberRef) -> SchedResult<T>
    where
        T: Clone,
    {
        lock(&self.inner)
            .content
            .get(&fiber.id())
            .cloned()
            .ok_or(SchedError::MissingEntry(fiber.id()))
    }

    /// Run `f` on the fiber's value in place, inserting `default` if absent
    ///
    /// `f` runs with the storage locked and must not touch this storage.
    pub fn with_or_default<R>(&self, fiber: &FiberRef, default: T, f: impl FnOnce(&mut T) -> R) -> R {
        let mut entries = lock(&self.inner);
        let id = fiber.id();
        if !entries.content.contains_key(&id) && !self.link(&mut entries, fiber) {
            drop(entries);
            let mut detached = default;
            return f(&mut detached);
        }
        f(entries.content.entry(id).or_insert(default))
    }

    /// Store `value`, returning the previous one
    ///
    /// Not stored if the fiber is already done.
    pub fn set(&self, fiber: &FiberRef, value: T) -> Option<T> {
        let mut entries = lock(&self.inner);
        if !self.link(&mut entries, fiber) {
            return None;
        }
        entries.content.insert(fiber.id(), value)
    }

    /// Erase the fiber's entry and its cleanup link
    pub fn remove(&self, fiber: &FiberRef) -> Option<T> {
        let (value, link) = {
            let mut entries = lock(&self.inner);
            (entries.content.remove(&fiber.id()), entries.links.remove(&fiber.id()))
        };
        drop(link);
        value
    }

    pub fn contains(&self, fiber: &FiberRef) -> bool {
        lock(&self.inner).content.contains_key(&fiber.id())
    }

    /// Number of fibers with an entry
    pub fn len(&self) -> usize {
        lock(&self.inner).content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current_get_or_default(&self, default: T) -> SchedResult<T>
    where
        T: Clone,
    {
        let fiber = tls::current().ok_or(SchedError::NotInFiber)?;
        Ok(self.get_or_default(&fiber, default))
    }

    pub fn current_get(&self) -> SchedResult<T>
    where
        T: Clone,
    {
        let fiber = tls::current().ok_or(SchedError::NotInFiber)?;
        self.get(&fiber)
    }

    pub fn current_with_or_default<R>(&self, default: T, f: impl FnOnce(&mut T) -> R) -> SchedResult<R> {
        let fiber = tls::current().ok_or(SchedError::NotInFiber)?;
        Ok(self.with_or_default(&fiber, default, f))
    }

    pub fn current_set(&self, value: T) -> SchedResult<Option<T>> {
        let fiber = tls::current().ok_or(SchedError::NotInFiber)?;
        Ok(self.set(&fiber, value))
    }
}

impl<T> fmt::Debug for LocalStorage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = lock(&self.inner);
        f.debug_struct("LocalStorage")
            .field("entries", &entries.content.len())
            .field("links", &entries.links.len())
            .finish()
    }
}
