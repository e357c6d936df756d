//! Basic reactor example
//!
//! Demonstrates yielding fibers, a fiber frozen until a timer callback
//! unfreezes it, fiber-local storage and registration from another thread.
//!
//! # Environment Variables
//!
//! - `REACTOR_FLUSH_EPRINT=1` - Flush debug output immediately
//! - `REACTOR_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `REACTOR_EVENT_LOOP=fallback` - Use the condvar event loop instead of eventfd

use reactor::{kdebug, kerror, kinfo, unfreeze, LocalStorage, Runtime, SchedulerConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
// REACTOR_LOG_LEVEL=debug REACTOR_FLUSH_EPRINT=1 cargo run -p reactor-basic
fn main() {
    println!("=== Reactor Basic Example ===\n");

    let config = SchedulerConfig::from_env().debug_logging(true);
    let runtime = match Runtime::new(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            kerror!("failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };
    println!("Event loop: {}", runtime.scheduler().event_loop_name());

    let completed = Arc::new(AtomicUsize::new(0));
    let iterations: LocalStorage<u32> = LocalStorage::new();

    // Three fibers taking turns, one round per iteration
    for i in 1..=3 {
        let c = Arc::clone(&completed);
        let iters = iterations.clone();
        let fiber = runtime
            .spawn(format!("worker-{}", i), move |scope| async move {
                for j in 0..3 {
                    let n = iters.current_with_or_default(0, |n| {
                        *n += 1;
                        *n
                    })?;
                    kdebug!("[{}] iteration {} (count {})", scope.name(), j, n);
                    scope.yield_now().await;
                }
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<(), reactor::SchedError>(())
            })
            .unwrap_or_else(|e| panic!("spawn failed: {}", e));
        println!("Spawned {}", fiber);
    }

    // Frozen until a timer callback unfreezes it
    let c = Arc::clone(&completed);
    let sleeper = runtime
        .spawn("sleeper", move |scope| async move {
            kdebug!("[sleeper] freezing");
            scope.freeze().await;
            kdebug!("[sleeper] unfrozen");
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap_or_else(|e| panic!("spawn failed: {}", e));
    let target = sleeper.clone();
    runtime
        .handle()
        .post_after(Duration::from_millis(50), move || unfreeze(&target))
        .unwrap_or_else(|e| panic!("timer failed: {}", e));

    // Registered from another OS thread while run() is blocked
    let handle = runtime.handle();
    let c = Arc::clone(&completed);
    let registrar = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        handle.spawn("foreign", move |_| async move {
            kdebug!("[foreign] running on the scheduler thread");
            c.fetch_add(1, Ordering::SeqCst);
        })
    });

    let start = Instant::now();
    if let Err(e) = runtime.run() {
        kerror!("run failed: {}", e);
        std::process::exit(1);
    }
    match registrar.join() {
        Ok(Ok(fiber)) => println!("Foreign fiber {} finished: {}", fiber, fiber.is_done()),
        Ok(Err(e)) => kerror!("foreign registration failed: {}", e),
        Err(_) => kerror!("registrar thread panicked"),
    }

    let stats = runtime.scheduler().stats();
    kinfo!(
        "{} fiber(s) completed in {} rounds ({:?})",
        completed.load(Ordering::SeqCst),
        stats.rounds,
        start.elapsed()
    );
    println!("Fiber-local entries left: {}", iterations.len());

    println!("\n=== Example Complete ===");
}
