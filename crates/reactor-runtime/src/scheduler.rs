//! Cooperative round-based scheduler
//!
//! One OS thread drives `run()`. Each round:
//! 1. Merge newly registered fibers (`starting`) into `running`
//! 2. Snapshot `running` and step every fiber still in it, in order
//! 3. Drain the event loop without blocking, then apply wake requests
//! 4. Exit if no fiber is left, or block on the event loop while every live
//!    fiber is frozen
//!
//! A step polls the fiber's future once. `Pending` freezes the fiber unless
//! something froze it already; its waker (or an explicit `unfreeze`) makes
//! it eligible again for the next round.

use crate::config::{FailurePolicy, SchedulerConfig};
use crate::event_loop::{new_event_loop, Callback, EventLoop, TimerHandle};
use crate::fiber::{Body, Fiber, FiberOutput, FiberRef, WeakFiber};
use crate::lock;
use crate::scope::Scope;
use crate::set::FiberSet;
use crate::tls;
use crate::waker::fiber_waker;

use crossbeam_queue::SegQueue;
use reactor_core::error::{EventLoopError, FatalError, FiberError, SchedError, SchedResult};
use reactor_core::id::FiberId;
use reactor_core::state::FiberState;
use reactor_core::{kdebug, kerror, kprint, kprintln, ktrace, kwarn};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// State reachable from any thread
pub(crate) struct Shared {
    /// Registered but not yet merged
    starting: Mutex<Vec<Fiber>>,
    /// Lenient unfreeze requests from wakers and handles
    wakes: SegQueue<FiberId>,
    event_loop: Box<dyn EventLoop>,
    debug: bool,
}

impl Shared {
    fn enqueue(&self, fiber: Fiber) -> SchedResult<FiberRef> {
        // Its sleeps and spawns would land on an event loop this run() never drains
        if !fiber.owner().is_handle_of(self) {
            return Err(SchedError::ForeignFiber(fiber.id()));
        }
        let handle = fiber.handle();
        lock(&self.starting).push(fiber);
        if self.debug {
            kdebug!("registered fiber {}", handle);
        }
        // Wake a run() blocked with every fiber frozen
        if let Err(e) = self.event_loop.post(Box::new(|| {})) {
            kwarn!("registration of fiber {} not signalled: {}", handle, e);
        }
        Ok(handle)
    }

    pub(crate) fn request_wake(&self, id: FiberId) {
        self.wakes.push(id);
        if let Err(e) = self.event_loop.post(Box::new(|| {})) {
            kwarn!("wake for fiber {} not signalled: {}", id, e);
        }
    }

    fn starting_len(&self) -> usize {
        lock(&self.starting).len()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Registered through a handle after the scheduler started dropping
        let stragglers = std::mem::take(
            self.starting
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for fiber in stragglers {
            let (handle, body) = fiber.into_parts();
            abandon(handle, Some(body));
        }
    }
}

fn abandon(fiber: FiberRef, body: Option<Body>) {
    drop(body);
    fiber.finish(Some(FiberError::abandoned()));
}

struct Slot {
    fiber: FiberRef,
    /// `None` while the fiber is being stepped
    body: Option<Body>,
    waker: Waker,
}

pub(crate) struct Core {
    config: SchedulerConfig,
    shared: Arc<Shared>,
    current: RefCell<Option<WeakFiber>>,
    running: RefCell<FiberSet>,
    frozen: RefCell<FiberSet>,
    fibers: RefCell<HashMap<FiberId, Slot>>,
    active: Cell<bool>,
    poisoned: Cell<bool>,
    rounds: Cell<u64>,
}

/// Clears the active flag when `run()` returns or unwinds
struct ActiveFlag<'a>(&'a Cell<bool>);

impl Drop for ActiveFlag<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Core {
    fn fiber(&self, id: FiberId) -> Option<FiberRef> {
        self.fibers.borrow().get(&id).map(|slot| slot.fiber.clone())
    }

    fn current(&self) -> Option<FiberRef> {
        self.current.borrow().as_ref().and_then(WeakFiber::upgrade)
    }

    pub(crate) fn try_freeze(&self, fiber: &FiberRef) -> SchedResult<()> {
        let id = fiber.id();
        let actual = fiber.state();
        if actual != FiberState::Running {
            return Err(SchedError::InvalidState {
                id,
                expected: FiberState::Running,
                actual,
            });
        }
        if !self.running.borrow().contains(id) {
            return Err(SchedError::FiberNotFound(id));
        }
        self.running.borrow_mut().remove(id);
        self.frozen.borrow_mut().insert(id);
        fiber.set_state(FiberState::Frozen);
        Ok(())
    }

    pub(crate) fn try_unfreeze(&self, fiber: &FiberRef) -> SchedResult<()> {
        let id = fiber.id();
        let actual = fiber.state();
        if actual != FiberState::Frozen {
            return Err(SchedError::InvalidState {
                id,
                expected: FiberState::Frozen,
                actual,
            });
        }
        if !self.frozen.borrow().contains(id) {
            return Err(SchedError::FiberNotFound(id));
        }
        self.frozen.borrow_mut().remove(id);
        self.running.borrow_mut().insert(id);
        fiber.set_state(FiberState::Running);
        Ok(())
    }

    /// Move every registered fiber into `running`, in registration order
    fn merge_starting(&self) {
        let batch = std::mem::take(&mut *lock(&self.shared.starting));
        if batch.is_empty() {
            return;
        }
        let mut running = self.running.borrow_mut();
        let mut fibers = self.fibers.borrow_mut();
        for fiber in batch {
            let (handle, body) = fiber.into_parts();
            let id = handle.id();
            handle.set_state(FiberState::Running);
            running.insert(id);
            fibers.insert(
                id,
                Slot {
                    fiber: handle,
                    body: Some(body),
                    waker: fiber_waker(id, &self.shared),
                },
            );
        }
    }

    /// Poll one fiber once
    fn step(&self, id: FiberId) -> Result<(), FatalError> {
        let taken = {
            let mut fibers = self.fibers.borrow_mut();
            fibers.get_mut(&id).and_then(|slot| {
                let body = slot.body.take()?;
                Some((slot.fiber.clone(), body, slot.waker.clone()))
            })
        };
        let Some((fiber, mut body, waker)) = taken else {
            return Ok(());
        };

        *self.current.borrow_mut() = Some(fiber.downgrade());
        let outer = tls::set_current(fiber.clone());
        let outer_tag = kprint::set_fiber_context(id.as_u64());

        let mut cx = Context::from_waker(&waker);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx)));

        kprint::set_fiber_context(outer_tag);
        tls::restore_current(outer);
        *self.current.borrow_mut() = None;

        match outcome {
            Ok(Poll::Pending) => {
                if fiber.state() == FiberState::Running {
                    // Every suspension is a freeze
                    if let Err(e) = self.try_freeze(&fiber) {
                        kwarn!("fiber {} suspended but could not be frozen: {}", fiber, e);
                    }
                }
                if let Some(slot) = self.fibers.borrow_mut().get_mut(&id) {
                    slot.body = Some(body);
                }
                Ok(())
            }
            Ok(Poll::Ready(result)) => {
                drop(body);
                self.complete(&fiber, result.err())
            }
            Err(payload) => {
                drop(body);
                self.complete(&fiber, Some(FiberError::from_panic(payload)))
            }
        }
    }

    /// Retire a finished fiber and apply the failure policy
    fn complete(&self, fiber: &FiberRef, failure: Option<FiberError>) -> Result<(), FatalError> {
        let id = fiber.id();
        self.running.borrow_mut().remove(id);
        self.frozen.borrow_mut().remove(id);
        let slot = self.fibers.borrow_mut().remove(&id);
        drop(slot);

        fiber.finish(failure.clone());
        if self.config.debug_logging {
            kdebug!("fiber {} done", fiber);
        }

        let Some(error) = failure else {
            return Ok(());
        };
        match self.config.failure_policy {
            FailurePolicy::Isolate => {
                kwarn!("fiber {} failed: {}", fiber, error);
                Ok(())
            }
            FailurePolicy::Return => {
                kerror!("thread {}: {}", fiber.name(), error);
                Err(FatalError::Fiber {
                    id,
                    name: fiber.name().to_string(),
                    error,
                })
            }
            FailurePolicy::Abort => {
                // Ungated: the report must survive REACTOR_LOG_LEVEL=off
                kprintln!("thread {}: {}", fiber.name(), error);
                std::process::abort();
            }
        }
    }

    fn event_loop_failure(&self, error: EventLoopError) -> FatalError {
        let name = self.shared.event_loop.name();
        if self.config.failure_policy == FailurePolicy::Abort {
            kprintln!("{} event loop: {}", name, error);
            std::process::abort();
        }
        kerror!("{} event loop: {}", name, error);
        FatalError::EventLoop(error)
    }

    /// Apply queued wake requests; a no-op for fibers no longer frozen
    fn process_wakes(&self) -> usize {
        let pending = self.shared.wakes.len();
        let mut woken = 0;
        for _ in 0..pending {
            let Some(id) = self.shared.wakes.pop() else {
                break;
            };
            if !self.frozen.borrow().contains(id) {
                continue;
            }
            if let Some(fiber) = self.fiber(id) {
                if self.try_unfreeze(&fiber).is_ok() {
                    woken += 1;
                }
            }
        }
        woken
    }

    fn drain(&self) -> Result<(), FatalError> {
        match self.shared.event_loop.poll() {
            Ok(n) if n > 0 => ktrace!("drained {} callbacks", n),
            Ok(_) => {}
            Err(e) => return Err(self.event_loop_failure(e)),
        }
        self.process_wakes();
        Ok(())
    }

    /// Block until a fiber is runnable; true when nothing is left at all
    fn wait_for_work(&self) -> Result<bool, FatalError> {
        loop {
            if !self.running.borrow().is_empty() || self.shared.starting_len() > 0 {
                return Ok(false);
            }
            let frozen = self.frozen.borrow().len();
            if frozen == 0 {
                return Ok(true);
            }
            ktrace!(
                "{} fibers frozen, blocking on {} event loop",
                frozen,
                self.shared.event_loop.name()
            );
            match self.shared.event_loop.run_one() {
                Ok(0) if self.config.stall_is_fatal => {
                    return Err(self.event_loop_failure(EventLoopError::Stalled));
                }
                Ok(0) => {
                    kwarn!("event loop made no progress with {} fibers frozen, retrying", frozen);
                }
                Ok(_) => {}
                Err(e) => return Err(self.event_loop_failure(e)),
            }
            self.process_wakes();
        }
    }

    fn run_rounds(&self) -> Result<(), FatalError> {
        loop {
            let round = self.rounds.get() + 1;
            self.rounds.set(round);
            self.merge_starting();

            let snapshot = self.running.borrow().snapshot();
            ktrace!(
                "round {}: {} running, {} frozen",
                round,
                snapshot.len(),
                self.frozen.borrow().len()
            );
            for id in snapshot {
                // Frozen or finished by an earlier fiber of this round
                if !self.running.borrow().contains(id) {
                    continue;
                }
                self.step(id)?;
            }

            self.drain()?;
            if self.wait_for_work()? {
                return Ok(());
            }
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        let mut order = self.running.get_mut().snapshot();
        order.extend(self.frozen.get_mut().snapshot());
        *self.running.get_mut() = FiberSet::new();
        *self.frozen.get_mut() = FiberSet::new();

        let fibers = self.fibers.get_mut();
        let mut live: Vec<Slot> = order.iter().filter_map(|id| fibers.remove(id)).collect();
        live.extend(fibers.drain().map(|(_, slot)| slot));
        let starting = std::mem::take(&mut *lock(&self.shared.starting));

        let count = live.len() + starting.len();
        for slot in live {
            abandon(slot.fiber, slot.body);
        }
        for fiber in starting {
            let (handle, body) = fiber.into_parts();
            abandon(handle, Some(body));
        }
        if count > 0 && self.config.debug_logging {
            kdebug!("scheduler dropped, abandoned {} fibers", count);
        }
    }
}

/// Scheduler counters and set sizes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Rounds executed over every `run()`
    pub rounds: u64,
    pub running: usize,
    pub frozen: usize,
    /// Registered, not yet merged
    pub starting: usize,
    /// Fibers not yet done
    pub live: usize,
}

/// Single-threaded cooperative fiber scheduler
///
/// `!Send`: it belongs to the thread that drives `run()`. Use `handle()` to
/// register fibers or post work from other threads.
pub struct Scheduler {
    core: Rc<Core>,
}

impl Scheduler {
    /// Create a scheduler with the configured event loop backend
    pub fn new(config: SchedulerConfig) -> SchedResult<Self> {
        config.validate()?;
        let event_loop = new_event_loop(config.loop_backend)?;
        Self::with_event_loop(config, event_loop)
    }

    /// Create a scheduler driving a caller-supplied event loop
    pub fn with_event_loop(config: SchedulerConfig, event_loop: Box<dyn EventLoop>) -> SchedResult<Self> {
        config.validate()?;
        if config.debug_logging {
            kdebug!(
                "scheduler created (event loop: {}, failure policy: {})",
                event_loop.name(),
                config.failure_policy
            );
        }
        let shared = Arc::new(Shared {
            starting: Mutex::new(Vec::new()),
            wakes: SegQueue::new(),
            event_loop,
            debug: config.debug_logging,
        });
        Ok(Self {
            core: Rc::new(Core {
                config,
                shared,
                current: RefCell::new(None),
                running: RefCell::new(FiberSet::new()),
                frozen: RefCell::new(FiberSet::new()),
                fibers: RefCell::new(HashMap::new()),
                active: Cell::new(false),
                poisoned: Cell::new(false),
                rounds: Cell::new(0),
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.core.config
    }

    /// Thread-safe handle; does not keep the scheduler alive
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::downgrade(&self.core.shared),
        }
    }

    /// Queue a fiber for the next round
    pub fn register(&self, fiber: Fiber) -> SchedResult<FiberRef> {
        self.core.shared.enqueue(fiber)
    }

    /// Build and register a fiber in one call
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, body: F) -> SchedResult<FiberRef>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: FiberOutput,
    {
        let fiber = Fiber::new(&self.handle(), name, body);
        self.register(fiber)
    }

    /// Run rounds until no fiber is left
    ///
    /// Returns `Err(Fatal(..))` when a fiber fails under
    /// `FailurePolicy::Return` or the event loop can no longer make
    /// progress; the scheduler is poisoned afterwards.
    pub fn run(&self) -> SchedResult<()> {
        let core = &self.core;
        if core.poisoned.get() {
            return Err(SchedError::Poisoned);
        }
        if core.active.replace(true) {
            return Err(SchedError::AlreadyRunning);
        }
        let _active = ActiveFlag(&core.active);
        let _ambient = tls::enter(core);

        match core.run_rounds() {
            Ok(()) => {
                if core.config.debug_logging {
                    kdebug!("all fibers done after {} rounds", core.rounds.get());
                }
                Ok(())
            }
            Err(fatal) => {
                core.poisoned.set(true);
                Err(SchedError::Fatal(fatal))
            }
        }
    }

    /// Fiber presently being stepped, if any
    pub fn current(&self) -> Option<FiberRef> {
        self.core.current()
    }

    /// Move a running fiber to `frozen`
    ///
    /// # Panics
    ///
    /// If the fiber is not running on this scheduler.
    pub fn freeze(&self, fiber: &FiberRef) {
        if let Err(e) = self.core.try_freeze(fiber) {
            panic!("freeze: {}", e);
        }
    }

    /// Make a frozen fiber eligible for the next round
    ///
    /// # Panics
    ///
    /// If the fiber is not frozen on this scheduler.
    pub fn unfreeze(&self, fiber: &FiberRef) {
        if let Err(e) = self.core.try_unfreeze(fiber) {
            panic!("unfreeze: {}", e);
        }
    }

    pub fn try_freeze(&self, fiber: &FiberRef) -> SchedResult<()> {
        self.core.try_freeze(fiber)
    }

    pub fn try_unfreeze(&self, fiber: &FiberRef) -> SchedResult<()> {
        self.core.try_unfreeze(fiber)
    }

    /// Request an unfreeze after the next drain; ignored if not frozen by then
    pub fn wake(&self, fiber: &FiberRef) {
        self.core.shared.request_wake(fiber.id());
    }

    /// Post a callback to the event loop
    pub fn post<F>(&self, callback: F) -> SchedResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        Ok(self.core.shared.event_loop.post(Box::new(callback))?)
    }

    pub fn is_poisoned(&self) -> bool {
        self.core.poisoned.get()
    }

    pub fn event_loop_name(&self) -> &'static str {
        self.core.shared.event_loop.name()
    }

    pub fn stats(&self) -> SchedulerStats {
        let core = &self.core;
        let starting = core.shared.starting_len();
        SchedulerStats {
            rounds: core.rounds.get(),
            running: core.running.borrow().len(),
            frozen: core.frozen.borrow().len(),
            starting,
            live: core.fibers.borrow().len() + starting,
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("event_loop", &self.event_loop_name())
            .field("stats", &self.stats())
            .finish()
    }
}

/// `Send + Sync` handle to a scheduler
///
/// Every operation fails with `SchedulerGone` once the scheduler is dropped.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Weak<Shared>,
}

impl SchedulerHandle {
    pub(crate) fn is_handle_of(&self, shared: &Shared) -> bool {
        std::ptr::eq(self.shared.as_ptr(), shared)
    }

    fn shared(&self) -> SchedResult<Arc<Shared>> {
        self.shared.upgrade().ok_or(SchedError::SchedulerGone)
    }

    pub fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }

    /// Queue a fiber built for this scheduler
    pub fn register(&self, fiber: Fiber) -> SchedResult<FiberRef> {
        self.shared()?.enqueue(fiber)
    }

    pub fn spawn<F, Fut>(&self, name: impl Into<String>, body: F) -> SchedResult<FiberRef>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: FiberOutput,
    {
        let shared = self.shared()?;
        shared.enqueue(Fiber::new(self, name, body))
    }

    pub fn post<F>(&self, callback: F) -> SchedResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let callback: Callback = Box::new(callback);
        Ok(self.shared()?.event_loop.post(callback)?)
    }

    /// Run `callback` on the scheduler thread once `delay` has elapsed
    pub fn post_after<F>(&self, delay: Duration, callback: F) -> SchedResult<TimerHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        Ok(self.shared()?.event_loop.post_after(delay, Box::new(callback))?)
    }

    /// Returns true if the timer had not fired yet
    pub fn cancel_timer(&self, timer: TimerHandle) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.event_loop.cancel(timer),
            None => false,
        }
    }

    /// Lenient unfreeze, safe from any thread
    pub fn wake(&self, fiber: &FiberRef) -> SchedResult<()> {
        self.shared()?.request_wake(fiber.id());
        Ok(())
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}

// ============================================================================
// Ambient operations (thread driving run())
// ============================================================================

/// Fiber presently being stepped on this thread
pub fn current() -> Option<FiberRef> {
    tls::current()
}

/// Freeze through the scheduler running on this thread
pub fn try_freeze(fiber: &FiberRef) -> SchedResult<()> {
    tls::with_active(|core| core.try_freeze(fiber)).unwrap_or(Err(SchedError::NoActiveScheduler))
}

/// Unfreeze through the scheduler running on this thread
///
/// This is how event loop callbacks resume fibers.
pub fn try_unfreeze(fiber: &FiberRef) -> SchedResult<()> {
    tls::with_active(|core| core.try_unfreeze(fiber)).unwrap_or(Err(SchedError::NoActiveScheduler))
}

/// # Panics
///
/// Outside `run()`, or if the fiber is not running.
pub fn freeze(fiber: &FiberRef) {
    if let Err(e) = try_freeze(fiber) {
        panic!("freeze: {}", e);
    }
}

/// # Panics
///
/// Outside `run()`, or if the fiber is not frozen.
pub fn unfreeze(fiber: &FiberRef) {
    if let Err(e) = try_unfreeze(fiber) {
        panic!("unfreeze: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::CondvarLoop;
    use crate::LoopBackend;
    use reactor_core::error::FailureKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    type Log = Arc<Mutex<Vec<String>>>;

    fn new_log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push(log: &Log, entry: impl Into<String>) {
        log.lock().unwrap().push(entry.into());
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(SchedulerConfig::default()).unwrap()
    }

    fn check_invariants(sched: &Scheduler) {
        let core = &sched.core;
        let running = core.running.borrow();
        let frozen = core.frozen.borrow();
        let fibers = core.fibers.borrow();
        for id in running.iter() {
            assert!(!frozen.contains(id), "fiber {} in both sets", id);
            assert_eq!(fibers[&id].fiber.state(), FiberState::Running);
        }
        for id in frozen.iter() {
            assert_eq!(fibers[&id].fiber.state(), FiberState::Frozen);
        }
        assert_eq!(running.len() + frozen.len(), fibers.len());
        for fiber in lock(&core.shared.starting).iter() {
            assert_eq!(fiber.handle().state(), FiberState::Starting);
        }
    }

    #[test]
    fn test_two_fibers_finish_in_one_round() {
        let sched = scheduler();
        let log = new_log();
        for name in ["a", "b"] {
            let log = Arc::clone(&log);
            sched
                .spawn(name, move |scope| async move {
                    push(&log, scope.name());
                })
                .unwrap();
        }
        assert_eq!(sched.stats().starting, 2);
        check_invariants(&sched);

        sched.run().unwrap();
        assert_eq!(entries(&log), vec!["a", "b"]);
        assert_eq!(sched.stats().rounds, 1);
        assert_eq!(sched.stats().live, 0);
    }

    #[test]
    fn test_callback_unfreezes_frozen_fiber() {
        let sched = scheduler();
        let log = new_log();

        let l = Arc::clone(&log);
        let a = sched
            .spawn("a", move |scope| async move {
                push(&l, "a1");
                scope.freeze().await;
                push(&l, "a2");
            })
            .unwrap();

        let l = Arc::clone(&log);
        let a2 = a.clone();
        sched
            .spawn("b", move |scope| async move {
                push(&l, "b");
                assert_eq!(a2.state(), FiberState::Frozen);
                scope
                    .scheduler()
                    .post(move || unfreeze(&a2))
                    .unwrap();
            })
            .unwrap();

        sched.run().unwrap();
        assert_eq!(entries(&log), vec!["a1", "b", "a2"]);
        assert_eq!(sched.stats().rounds, 2);
        assert!(a.is_done());
        assert!(a.failure().is_none());
    }

    #[test]
    #[allow(dependency_on_unit_never_type_fallback)]
    fn test_panicking_fiber_stops_run() {
        let sched = scheduler();
        let log = new_log();

        let l = Arc::clone(&log);
        sched.spawn("first", move |_| async move { push(&l, "first") }).unwrap();
        let bad = sched
            .spawn("second", |_| async move {
                panic!("boom");
            })
            .unwrap();
        let l = Arc::clone(&log);
        let third = sched.spawn("third", move |_| async move { push(&l, "third") }).unwrap();

        match sched.run() {
            Err(SchedError::Fatal(FatalError::Fiber { id, name, error })) => {
                assert_eq!(id, bad.id());
                assert_eq!(name, "second");
                assert_eq!(error.kind(), FailureKind::Panic);
                assert_eq!(error.message(), "boom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(entries(&log), vec!["first"]);
        assert_eq!(bad.failure().unwrap().kind(), FailureKind::Panic);
        assert_eq!(third.state(), FiberState::Running);
        assert!(sched.is_poisoned());
        assert_eq!(sched.run(), Err(SchedError::Poisoned));
    }

    #[test]
    fn test_error_result_is_fatal() {
        let sched = scheduler();
        sched
            .spawn("parser", |_| async move { Err::<(), _>("unexpected token") })
            .unwrap();
        let err = sched.run().unwrap_err();
        assert_eq!(err.to_string(), "fatal: thread parser: unexpected token");
    }

    #[test]
    #[allow(dependency_on_unit_never_type_fallback)]
    fn test_isolate_policy_keeps_scheduling() {
        let config = SchedulerConfig::new().failure_policy(FailurePolicy::Isolate);
        let sched = Scheduler::new(config).unwrap();
        let log = new_log();

        let bad = sched
            .spawn("bad", |_| async move {
                panic!("isolated");
            })
            .unwrap();
        let l = Arc::clone(&log);
        let watched = bad.clone();
        sched
            .spawn("watcher", move |scope| async move {
                scope.yield_now().await;
                let result = scope.join(&watched).await;
                push(&l, result.unwrap_err().to_string());
            })
            .unwrap();

        sched.run().unwrap();
        assert_eq!(entries(&log), vec!["panicked: isolated"]);
        assert!(!sched.is_poisoned());
    }

    #[test]
    fn test_fibers_run_in_registration_order() {
        let sched = scheduler();
        let log = new_log();
        for i in 0..8 {
            let l = Arc::clone(&log);
            sched
                .spawn(format!("f{}", i), move |scope| async move {
                    push(&l, scope.name());
                    scope.yield_now().await;
                    push(&l, scope.name());
                })
                .unwrap();
        }
        sched.run().unwrap();
        let expected: Vec<String> = (0..8).chain(0..8).map(|i| format!("f{}", i)).collect();
        assert_eq!(entries(&log), expected);
    }

    #[test]
    fn test_fiber_registered_mid_round_waits_for_next_round() {
        let sched = scheduler();
        let log = new_log();
        let l = Arc::clone(&log);
        sched
            .spawn("parent", move |scope| async move {
                let l2 = Arc::clone(&l);
                scope
                    .spawn("child", move |_| async move { push(&l2, "child") })
                    .unwrap();
                push(&l, "parent");
            })
            .unwrap();
        let l = Arc::clone(&log);
        sched.spawn("sibling", move |_| async move { push(&l, "sibling") }).unwrap();

        sched.run().unwrap();
        assert_eq!(entries(&log), vec!["parent", "sibling", "child"]);
        assert_eq!(sched.stats().rounds, 2);
    }

    #[test]
    fn test_foreign_thread_registration_wakes_blocked_run() {
        let sched = scheduler();
        let keeper = sched
            .spawn("keeper", |scope| async move {
                scope.freeze().await;
            })
            .unwrap();

        let handle = sched.handle();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let registrar = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            handle
                .spawn("foreign", move |_| async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    unfreeze(&keeper);
                })
                .unwrap();
        });

        let start = Instant::now();
        sched.run().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() >= Duration::from_millis(30));
        registrar.join().unwrap();
    }

    #[test]
    fn test_sets_stay_disjoint() {
        let sched = scheduler();
        let frozen_fiber = sched
            .spawn("sleeper", |scope| async move {
                scope.freeze().await;
            })
            .unwrap();
        let watched = frozen_fiber.clone();
        sched
            .spawn("checker", move |scope| async move {
                assert_eq!(watched.state(), FiberState::Frozen);
                assert_eq!(current().as_ref(), Some(scope.fiber()));
                scope.yield_now().await;
                try_unfreeze(&watched).unwrap();
                assert_eq!(
                    try_unfreeze(&watched),
                    Err(SchedError::InvalidState {
                        id: watched.id(),
                        expected: FiberState::Frozen,
                        actual: FiberState::Running,
                    })
                );
            })
            .unwrap();
        check_invariants(&sched);
        sched.run().unwrap();
        check_invariants(&sched);
        assert!(frozen_fiber.is_done());
        assert!(current().is_none());
    }

    #[test]
    fn test_try_freeze_rejects_non_running() {
        let sched = scheduler();
        let fiber = sched.spawn("idle", |_| async {}).unwrap();
        assert_eq!(
            sched.try_freeze(&fiber),
            Err(SchedError::InvalidState {
                id: fiber.id(),
                expected: FiberState::Running,
                actual: FiberState::Starting,
            })
        );
        assert_eq!(
            sched.try_unfreeze(&fiber),
            Err(SchedError::InvalidState {
                id: fiber.id(),
                expected: FiberState::Frozen,
                actual: FiberState::Starting,
            })
        );
        assert_eq!(try_freeze(&fiber), Err(SchedError::NoActiveScheduler));
    }

    #[test]
    fn test_foreign_fiber_not_found() {
        let sched = scheduler();
        let other = scheduler();
        let stranger = other.handle();
        let log = new_log();
        let l = Arc::clone(&log);
        sched
            .spawn("probe", move |_| async move {
                let fiber = Fiber::new(&stranger, "stranger", |_| async {});
                let handle = fiber.handle();
                handle.set_state(FiberState::Running);
                match try_freeze(&handle) {
                    Err(SchedError::FiberNotFound(id)) if id == handle.id() => push(&l, "not found"),
                    other => push(&l, format!("{:?}", other)),
                }
            })
            .unwrap();
        sched.run().unwrap();
        assert_eq!(entries(&log), vec!["not found"]);
    }

    #[test]
    #[should_panic(expected = "freeze")]
    fn test_freeze_starting_fiber_panics() {
        let sched = scheduler();
        let fiber = sched.spawn("idle", |_| async {}).unwrap();
        sched.freeze(&fiber);
    }

    #[test]
    #[should_panic(expected = "unfreeze")]
    fn test_unfreeze_outside_run_panics() {
        let sched = scheduler();
        let fiber = sched.spawn("idle", |_| async {}).unwrap();
        unfreeze(&fiber);
    }

    #[test]
    fn test_unfreeze_contract_violation_fails_fiber() {
        let sched = scheduler();
        let fiber = sched
            .spawn("self-unfreeze", |scope| async move {
                unfreeze(scope.fiber());
            })
            .unwrap();
        assert!(sched.run().is_err());
        let failure = fiber.failure().unwrap();
        assert_eq!(failure.kind(), FailureKind::Panic);
        assert!(failure.message().starts_with("unfreeze"));
    }

    #[test]
    fn test_wake_requests_apply_after_drain() {
        let sched = scheduler();
        let fiber = sched
            .spawn("waiter", |scope| async move {
                scope.freeze().await;
            })
            .unwrap();
        // Queued before the first step, applied once the fiber is frozen;
        // the duplicate finds it running and is dropped
        sched.wake(&fiber);
        sched.wake(&fiber);
        sched.run().unwrap();
        assert!(fiber.is_done());
        assert_eq!(sched.stats().rounds, 2);
    }

    #[test]
    fn test_reentrant_run_rejected() {
        thread_local! {
            static SCHED: RefCell<Option<Rc<Scheduler>>> = const { RefCell::new(None) };
        }
        let sched = Rc::new(scheduler());
        SCHED.with(|cell| *cell.borrow_mut() = Some(Rc::clone(&sched)));

        let log = new_log();
        let l = Arc::clone(&log);
        sched
            .spawn("reentrant", move |_| async move {
                let nested = SCHED.with(|cell| cell.borrow().as_ref().map(|s| s.run()));
                push(&l, format!("{:?}", nested));
            })
            .unwrap();
        sched.run().unwrap();
        SCHED.with(|cell| cell.borrow_mut().take());
        assert_eq!(entries(&log), vec!["Some(Err(AlreadyRunning))"]);

        // Runs again once finished
        sched.spawn("again", |_| async {}).unwrap();
        sched.run().unwrap();
        assert_eq!(sched.stats().rounds, 2);
    }

    #[test]
    #[allow(dependency_on_unit_never_type_fallback)]
    fn test_dropping_scheduler_abandons_fibers() {
        let sched = scheduler();
        let frozen = sched
            .spawn("frozen", |scope| async move {
                scope.freeze().await;
            })
            .unwrap();
        sched
            .spawn("bad", |_| async {
                panic!("stop");
            })
            .unwrap();
        assert!(sched.run().is_err());
        let queued = sched.spawn("queued", |_| async {}).unwrap();
        let handle = sched.handle();

        let abandoned = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&abandoned);
        frozen
            .on_done(move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
            .detach();

        drop(sched);
        assert_eq!(abandoned.load(Ordering::SeqCst), 1);
        assert_eq!(frozen.failure().unwrap().kind(), FailureKind::Abandoned);
        assert_eq!(queued.failure().unwrap().kind(), FailureKind::Abandoned);
        assert!(!handle.is_alive());
        assert_eq!(
            handle.spawn("late", |_| async {}).unwrap_err(),
            SchedError::SchedulerGone
        );
    }

    #[test]
    fn test_stats_track_sets() {
        let sched = scheduler();
        let keeper = sched
            .spawn("keeper", |scope| async move {
                scope.freeze().await;
            })
            .unwrap();
        sched
            .spawn("releaser", move |scope| async move {
                scope.yield_now().await;
                unfreeze(&keeper);
            })
            .unwrap();

        let before = sched.stats();
        assert_eq!(before.starting, 2);
        assert_eq!(before.live, 2);

        // keeper is unfrozen after round 2's snapshot, so it finishes in round 3
        sched.run().unwrap();
        assert_eq!(
            sched.stats(),
            SchedulerStats {
                rounds: 3,
                ..SchedulerStats::default()
            }
        );
    }

    /// Event loop wrapper that fails or stalls on demand
    struct FaultyLoop {
        inner: CondvarLoop,
        stalls: AtomicUsize,
        wait_error: Option<EventLoopError>,
        poll_error: Option<EventLoopError>,
        post_error: Option<EventLoopError>,
    }

    impl FaultyLoop {
        fn healthy() -> Self {
            Self {
                inner: CondvarLoop::new(),
                stalls: AtomicUsize::new(0),
                wait_error: None,
                poll_error: None,
                post_error: None,
            }
        }

        fn stalling(stalls: usize) -> Self {
            Self {
                stalls: AtomicUsize::new(stalls),
                ..Self::healthy()
            }
        }

        fn failing(error: EventLoopError) -> Self {
            Self {
                wait_error: Some(error),
                ..Self::healthy()
            }
        }

        fn failing_poll(error: EventLoopError) -> Self {
            Self {
                poll_error: Some(error),
                ..Self::healthy()
            }
        }

        fn failing_post(error: EventLoopError) -> Self {
            Self {
                post_error: Some(error),
                ..Self::healthy()
            }
        }
    }

    impl EventLoop for FaultyLoop {
        fn post(&self, callback: Callback) -> Result<(), EventLoopError> {
            if let Some(e) = self.post_error {
                return Err(e);
            }
            self.inner.post(callback)
        }

        fn post_after(&self, delay: Duration, callback: Callback) -> Result<TimerHandle, EventLoopError> {
            self.inner.post_after(delay, callback)
        }

        fn cancel(&self, timer: TimerHandle) -> bool {
            self.inner.cancel(timer)
        }

        fn poll(&self) -> Result<usize, EventLoopError> {
            if let Some(e) = self.poll_error {
                return Err(e);
            }
            self.inner.poll()
        }

        fn run_one(&self) -> Result<usize, EventLoopError> {
            if let Some(e) = self.wait_error {
                return Err(e);
            }
            let left = self.stalls.load(Ordering::SeqCst);
            if left > 0 {
                self.stalls.store(left - 1, Ordering::SeqCst);
                return Ok(0);
            }
            self.inner.run_one()
        }

        fn name(&self) -> &'static str {
            "faulty"
        }
    }

    const EIO: i32 = 5;

    fn freeze_for(sched: &Scheduler, delay: Duration) -> FiberRef {
        sched
            .spawn("sleeper", move |scope| async move { scope.sleep(delay).await })
            .unwrap()
    }

    #[test]
    fn test_zero_progress_wait_is_fatal() {
        let sched =
            Scheduler::with_event_loop(SchedulerConfig::default(), Box::new(FaultyLoop::stalling(1)))
                .unwrap();
        let fiber = freeze_for(&sched, Duration::from_millis(5));
        assert_eq!(
            sched.run(),
            Err(SchedError::Fatal(FatalError::EventLoop(EventLoopError::Stalled)))
        );
        assert_eq!(fiber.state(), FiberState::Frozen);
    }

    #[test]
    fn test_zero_progress_retried_when_not_fatal() {
        let config = SchedulerConfig::new().stall_is_fatal(false);
        let sched = Scheduler::with_event_loop(config, Box::new(FaultyLoop::stalling(2))).unwrap();
        let fiber = freeze_for(&sched, Duration::from_millis(5));
        sched.run().unwrap();
        assert!(fiber.result().unwrap().is_ok());
    }

    #[test]
    fn test_wait_error_is_fatal() {
        let sched = Scheduler::with_event_loop(
            SchedulerConfig::default(),
            Box::new(FaultyLoop::failing(EventLoopError::Os(EIO))),
        )
        .unwrap();
        freeze_for(&sched, Duration::from_millis(5));
        match sched.run() {
            Err(SchedError::Fatal(FatalError::EventLoop(EventLoopError::Os(code)))) => {
                assert_eq!(code, EIO)
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_drain_error_is_fatal() {
        let sched = Scheduler::with_event_loop(
            SchedulerConfig::default(),
            Box::new(FaultyLoop::failing_poll(EventLoopError::Os(EIO))),
        )
        .unwrap();
        let fiber = sched.spawn("quick", |_| async {}).unwrap();
        assert_eq!(
            sched.run(),
            Err(SchedError::Fatal(FatalError::EventLoop(EventLoopError::Os(EIO))))
        );
        assert!(fiber.is_done());
        assert_eq!(sched.run(), Err(SchedError::Poisoned));
    }

    #[test]
    fn test_unsignalled_registration_keeps_fiber() {
        let sched = Scheduler::with_event_loop(
            SchedulerConfig::default(),
            Box::new(FaultyLoop::failing_post(EventLoopError::Os(EIO))),
        )
        .unwrap();
        let fiber = sched.spawn("quiet", |_| async {}).unwrap();
        assert_eq!(fiber.state(), FiberState::Starting);
        sched.run().unwrap();
        assert!(fiber.result().unwrap().is_ok());
    }

    #[test]
    fn test_register_rejects_fiber_built_for_another_scheduler() {
        let a = scheduler();
        let b = scheduler();
        let fiber = Fiber::new(&a.handle(), "misplaced", |scope| async move {
            scope.sleep(Duration::from_millis(5)).await
        });
        let id = fiber.id();
        assert_eq!(b.register(fiber), Err(SchedError::ForeignFiber(id)));
        let fiber = Fiber::new(&a.handle(), "misplaced", |_| async {});
        let id = fiber.id();
        assert_eq!(b.handle().register(fiber), Err(SchedError::ForeignFiber(id)));
        assert_eq!(b.stats().starting, 0);
        b.run().unwrap();

        let fiber = Fiber::new(&a.handle(), "placed", |_| async {});
        let placed = a.handle().register(fiber).unwrap();
        a.run().unwrap();
        assert!(placed.is_done());
    }

    /// Runs a second scheduler to completion from inside a fiber step
    fn run_nested_scheduler(log: &Log) {
        let inner = scheduler();
        let l = Arc::clone(log);
        inner
            .spawn("inner", move |_| async move {
                let name = tls::current().map(|f| f.name().to_string());
                push(&l, format!("inner sees {}", name.unwrap_or_default()));
            })
            .unwrap();
        inner.run().unwrap();
    }

    #[test]
    fn test_nested_run_restores_outer_bindings() {
        let outer = scheduler();
        let log = new_log();
        let l = Arc::clone(&log);
        let fiber = outer
            .spawn("outer", move |scope| async move {
                run_nested_scheduler(&l);
                let bound = tls::current().map(|f| f.id()) == Some(scope.id());
                push(&l, format!("current restored {}", bound));
                let tagged = kprint::fiber_context() == scope.id().as_u64();
                push(&l, format!("tag restored {}", tagged));
            })
            .unwrap();
        outer.run().unwrap();
        assert!(fiber.result().unwrap().is_ok());
        assert_eq!(
            entries(&log),
            vec!["inner sees inner", "current restored true", "tag restored true"]
        );
        assert!(tls::current().is_none());
        assert_eq!(kprint::fiber_context(), 0);
    }

    /// Selects the scenario a re-executed test binary runs before aborting
    const ABORT_SCENARIO: &str = "REACTOR_TEST_ABORT_SCENARIO";

    #[cfg(unix)]
    const SIGABRT: i32 = 6;

    fn run_abort_scenario(scenario: &str) {
        // The report must not depend on the log level
        kprint::set_log_level(kprint::LogLevel::Off);
        let config = SchedulerConfig::new().failure_policy(FailurePolicy::Abort);
        match scenario {
            "fiber" => {
                let sched = Scheduler::new(config).unwrap();
                sched
                    .spawn("ledger-writer", |_| async { Err::<(), _>("disk full") })
                    .unwrap();
                let _ = sched.run();
            }
            "event-loop" => {
                let sched = Scheduler::with_event_loop(
                    config,
                    Box::new(FaultyLoop::failing(EventLoopError::Os(EIO))),
                )
                .unwrap();
                freeze_for(&sched, Duration::from_millis(5));
                let _ = sched.run();
            }
            other => panic!("unknown scenario {}", other),
        }
        panic!("scenario {} returned instead of aborting", scenario);
    }

    /// Re-run `test` in a child process and return its stderr
    fn abort_in_child(test: &str, scenario: &str) -> String {
        let output = std::process::Command::new(std::env::current_exe().unwrap())
            .args([test, "--exact", "--nocapture", "--test-threads=1"])
            .env(ABORT_SCENARIO, scenario)
            .output()
            .unwrap();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        assert!(!output.status.success(), "child exited cleanly: {}", stderr);
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(output.status.signal(), Some(SIGABRT), "stderr: {}", stderr);
        }
        stderr
    }

    #[test]
    fn test_abort_policy_reports_fiber_failure() {
        if let Ok(scenario) = std::env::var(ABORT_SCENARIO) {
            return run_abort_scenario(&scenario);
        }
        let stderr = abort_in_child(
            "scheduler::tests::test_abort_policy_reports_fiber_failure",
            "fiber",
        );
        assert!(stderr.contains("thread ledger-writer: disk full"), "stderr: {}", stderr);
    }

    #[test]
    fn test_abort_policy_reports_event_loop_failure() {
        if let Ok(scenario) = std::env::var(ABORT_SCENARIO) {
            return run_abort_scenario(&scenario);
        }
        let stderr = abort_in_child(
            "scheduler::tests::test_abort_policy_reports_event_loop_failure",
            "event-loop",
        );
        assert!(stderr.contains("faulty event loop"), "stderr: {}", stderr);
        assert!(stderr.contains("os error 5"), "stderr: {}", stderr);
    }

    #[test]
    fn test_fallback_backend_runs_scenarios() {
        let config = SchedulerConfig::new().loop_backend(LoopBackend::Fallback);
        let sched = Scheduler::new(config).unwrap();
        assert_eq!(sched.event_loop_name(), "condvar");
        let fiber = freeze_for(&sched, Duration::from_millis(10));
        sched.run().unwrap();
        assert!(fiber.is_done());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SchedulerConfig::new()
            .failure_policy(FailurePolicy::Abort)
            .stall_is_fatal(false);
        assert!(matches!(Scheduler::new(config), Err(SchedError::InvalidConfig(_))));
    }
}
