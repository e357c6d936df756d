//! Stress test - many fibers
//!
//! Spawns a large number of fibers that yield repeatedly, while a second
//! OS thread keeps registering more through a `SchedulerHandle`. Every
//! fiber keeps a counter in fiber-local storage, which must be empty once
//! the run is over.

use reactor::{LocalStorage, Runtime, SchedulerConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

fn main() {
    println!("=== Reactor Stress Test ===\n");

    let num_fibers: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10_000);
    let yields: usize = reactor::env_get("REACTOR_STRESS_YIELDS", 10);

    println!("Spawning {} fibers ({} yields each)...", num_fibers, yields);

    let runtime = match Runtime::new(SchedulerConfig::from_env()) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };

    let completed = Arc::new(AtomicU64::new(0));
    let steps: LocalStorage<usize> = LocalStorage::new();
    let start = Instant::now();

    for i in 0..num_fibers {
        let completed = Arc::clone(&completed);
        let steps = steps.clone();
        let spawned = runtime.spawn("stress", move |scope| async move {
            // Do a little work
            for _ in 0..yields {
                steps.with_or_default(scope.fiber(), 0, |n| *n += 1);
                scope.yield_now().await;
            }
            if steps.get_or_default(scope.fiber(), 0) != yields {
                return Err("step count mismatch");
            }
            completed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        if let Err(e) = spawned {
            eprintln!("spawn failed: {}", e);
            std::process::exit(1);
        }

        // Progress indicator
        if (i + 1) % 1000 == 0 {
            print!("\rSpawned: {}/{}", i + 1, num_fibers);
        }
    }

    let spawn_time = start.elapsed();
    println!("\n\nSpawn time: {:?}", spawn_time);
    println!(
        "Spawn rate: {:.0} fibers/sec",
        num_fibers as f64 / spawn_time.as_secs_f64()
    );

    // Foreign registrations land in later rounds
    let foreign = num_fibers / 10;
    let handle = runtime.handle();
    let c = Arc::clone(&completed);
    let registrar = std::thread::spawn(move || {
        for _ in 0..foreign {
            let c = Arc::clone(&c);
            if handle
                .spawn("foreign", move |_| async move {
                    c.fetch_add(1, Ordering::Relaxed);
                })
                .is_err()
            {
                break;
            }
        }
    });

    println!("\nRunning...");
    let run_start = Instant::now();
    if let Err(e) = runtime.run() {
        eprintln!("run failed: {}", e);
        std::process::exit(1);
    }
    if registrar.join().is_err() {
        eprintln!("registrar thread panicked");
    }
    // Registrations that raced the end of run()
    if let Err(e) = runtime.run() {
        eprintln!("run failed: {}", e);
        std::process::exit(1);
    }

    let run_time = run_start.elapsed();
    let done = completed.load(Ordering::Relaxed);
    let stats = runtime.scheduler().stats();
    println!("Completed: {} fibers", done);
    println!("Rounds: {}", stats.rounds);
    println!("Run time: {:?}", run_time);
    println!(
        "Throughput: {:.0} steps/sec",
        (num_fibers * (yields + 1) + foreign) as f64 / run_time.as_secs_f64()
    );

    println!("Fiber-local entries left: {}", steps.len());

    if done as usize == num_fibers + foreign && steps.is_empty() {
        println!("\n✓ All fibers completed");
    } else {
        println!("\n✗ Only {}/{} fibers completed", done, num_fibers + foreign);
        std::process::exit(1);
    }
}
