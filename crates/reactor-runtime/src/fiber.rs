//! Fibers and fiber handles
//!
//! A `Fiber` is the owned, not-yet-registered unit of work: a name, an id and
//! a boxed future built from the body closure. Registering it hands the
//! future to a scheduler; what remains visible is the `FiberRef`, a shared
//! handle for observing state, failure and termination.

use crate::scheduler::SchedulerHandle;
use crate::scope::Scope;
use crate::termination::Termination;
use crate::lock;

use reactor_core::error::{FiberError, FiberResult};
use reactor_core::id::FiberId;
use reactor_core::state::FiberState;

use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

/// Resumable computation of a fiber, moved out of its slot for each step
pub(crate) type Body = Pin<Box<dyn Future<Output = FiberResult> + Send + 'static>>;

/// Values a fiber body may finish with
pub trait FiberOutput {
    fn into_fiber_result(self) -> FiberResult;
}

impl FiberOutput for () {
    fn into_fiber_result(self) -> FiberResult {
        Ok(())
    }
}

impl<E: fmt::Display> FiberOutput for Result<(), E> {
    fn into_fiber_result(self) -> FiberResult {
        self.map_err(|e| FiberError::failed(e.to_string()))
    }
}

pub(crate) struct FiberInner {
    id: FiberId,
    name: String,
    state: AtomicU8,
    failure: Mutex<Option<FiberError>>,
    on_done: Termination,
}

/// Shared handle to a fiber
///
/// Cheap to clone and `Send + Sync`. Holding one does not keep the fiber's
/// body alive; the scheduler owns that.
#[derive(Clone)]
pub struct FiberRef {
    inner: Arc<FiberInner>,
}

impl FiberRef {
    fn new(name: String) -> Self {
        Self {
            inner: Arc::new(FiberInner {
                id: FiberId::next(),
                name,
                state: AtomicU8::new(FiberState::Starting as u8),
                failure: Mutex::new(None),
                on_done: Termination::new(),
            }),
        }
    }

    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> FiberState {
        FiberState::from(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// Terminal failure, if the fiber ended abnormally
    pub fn failure(&self) -> Option<FiberError> {
        lock(&self.inner.failure).clone()
    }

    /// Terminal result, `None` while the fiber is alive
    pub fn result(&self) -> Option<FiberResult> {
        if !self.is_done() {
            return None;
        }
        Some(match self.failure() {
            Some(error) => Err(error),
            None => Ok(()),
        })
    }

    /// Run `listener` once when the fiber reaches `done`
    ///
    /// Returns `None` if the fiber is already done; the listener is dropped
    /// without running. Dropping the returned `Subscription` disconnects it.
    pub fn on_done<F>(&self, listener: F) -> Option<Subscription>
    where
        F: FnOnce(FiberId) + Send + 'static,
    {
        let key = self.inner.on_done.subscribe(Box::new(listener))?;
        Some(Subscription {
            fiber: Arc::downgrade(&self.inner),
            key,
        })
    }

    /// Future resolving to the fiber's terminal result
    pub fn join(&self) -> Join {
        Join {
            fiber: self.clone(),
            waker: Arc::new(Mutex::new(None)),
            subscription: None,
        }
    }

    pub fn downgrade(&self) -> WeakFiber {
        WeakFiber {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn set_state(&self, next: FiberState) {
        debug_assert!(
            self.state().can_transition_to(next),
            "fiber {}: illegal transition {} -> {}",
            self.id(),
            self.state(),
            next
        );
        self.inner.state.store(next as u8, Ordering::Release);
    }

    /// Record the outcome, mark done and fire termination listeners
    pub(crate) fn finish(&self, failure: Option<FiberError>) {
        if self.is_done() {
            return;
        }
        *lock(&self.inner.failure) = failure;
        self.set_state(FiberState::Done);
        self.inner.on_done.fire(self.id());
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.inner.on_done.listener_count()
    }
}

impl PartialEq for FiberRef {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for FiberRef {}

impl Hash for FiberRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for FiberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRef")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for FiberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.id())
    }
}

/// Non-owning fiber handle
#[derive(Clone)]
pub struct WeakFiber {
    inner: Weak<FiberInner>,
}

impl WeakFiber {
    pub fn upgrade(&self) -> Option<FiberRef> {
        self.inner.upgrade().map(|inner| FiberRef { inner })
    }
}

impl fmt::Debug for WeakFiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(fiber) => write!(f, "WeakFiber({})", fiber.id()),
            None => write!(f, "WeakFiber(<gone>)"),
        }
    }
}

/// Termination listener registration; disconnects on drop
#[must_use = "dropping a Subscription disconnects its listener"]
pub struct Subscription {
    fiber: Weak<FiberInner>,
    key: u64,
}

impl Subscription {
    /// Keep the listener connected for the fiber's whole lifetime
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.fiber.upgrade() {
            inner.on_done.unsubscribe(self.key);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}

/// A fiber that has not been registered yet
///
/// Created in `starting`; `register` consumes it, so a fiber can be
/// registered at most once.
pub struct Fiber {
    handle: FiberRef,
    body: Body,
    /// Scheduler the body's `Scope` talks to
    owner: SchedulerHandle,
}

impl Fiber {
    /// Build a fiber whose body runs against `scheduler`
    ///
    /// `body` is called right away with the fiber's `Scope`; the future it
    /// returns is first polled by the scheduler's next round after
    /// registration.
    pub fn new<F, Fut>(scheduler: &SchedulerHandle, name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: FiberOutput,
    {
        let handle = FiberRef::new(name.into());
        let scope = Scope::new(handle.clone(), scheduler.clone());
        let fut = body(scope);
        Self {
            handle,
            body: Box::pin(async move { fut.await.into_fiber_result() }),
            owner: scheduler.clone(),
        }
    }

    pub fn id(&self) -> FiberId {
        self.handle.id()
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Shared handle, valid before and after registration
    pub fn handle(&self) -> FiberRef {
        self.handle.clone()
    }

    pub(crate) fn owner(&self) -> &SchedulerHandle {
        &self.owner
    }

    pub(crate) fn into_parts(self) -> (FiberRef, Body) {
        (self.handle, self.body)
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

/// Future returned by `FiberRef::join`
pub struct Join {
    fiber: FiberRef,
    waker: Arc<Mutex<Option<Waker>>>,
    subscription: Option<Subscription>,
}

impl Future for Join {
    type Output = FiberResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<FiberResult> {
        if let Some(result) = self.fiber.result() {
            return Poll::Ready(result);
        }
        *lock(&self.waker) = Some(cx.waker().clone());
        if self.subscription.is_none() {
            let slot = Arc::clone(&self.waker);
            let subscription = self.fiber.on_done(move |_| {
                if let Some(waker) = lock(&slot).take() {
                    waker.wake();
                }
            });
            match subscription {
                Some(sub) => self.subscription = Some(sub),
                // Finished between the check and the subscription
                None => {
                    return match self.fiber.result() {
                        Some(result) => Poll::Ready(result),
                        None => Poll::Pending,
                    }
                }
            }
        }
        Poll::Pending
    }
}
