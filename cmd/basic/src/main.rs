//! Basic gvfiber example
//!
//! Spawns a handful of fibers that yield, sleep and arm timers on a small
//! worker pool, then shuts the runtime down once everything has finished.
//!
//! # Environment Variables
//!
//! - `GVF_LOG=debug` - log filter (EnvFilter syntax)
//! - `GVF_THREADS=4` - worker threads

use gvfiber::{yield_now, IoManager, Runtime, RuntimeConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// GVF_LOG=debug cargo run -p gvfiber-basic
fn main() -> gvfiber::RtResult<()> {
    gvfiber::init_logging();
    println!("=== gvfiber Basic Example ===\n");

    let config = RuntimeConfig::from_env().name("basic");
    let runtime = Runtime::new(config)?;
    let completed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    for i in 1..=3 {
        let c = completed.clone();
        runtime.spawn(move || {
            tracing::debug!(fiber = i, "started");
            for j in 0..3 {
                tracing::debug!(fiber = i, iteration = j, "yielding");
                yield_now();
            }
            c.fetch_add(1, Ordering::SeqCst);
        });
    }

    // Two sleepers overlap instead of queueing behind each other.
    for ms in [200, 300] {
        let c = completed.clone();
        runtime.spawn(move || {
            gvfiber::sleep(Duration::from_millis(ms));
            println!("slept {ms}ms (at {:?})", start.elapsed());
            c.fetch_add(1, Ordering::SeqCst);
        });
    }

    // A recurring timer that cancels itself after three ticks.
    let c = completed.clone();
    runtime.spawn(move || {
        let Some(iom) = IoManager::current() else {
            return;
        };
        let ticks = Arc::new(AtomicUsize::new(0));
        let timer = iom.add_timer(
            100,
            {
                let ticks = ticks.clone();
                move || {
                    let n = ticks.fetch_add(1, Ordering::SeqCst) + 1;
                    println!("tick {n}");
                }
            },
            true,
        );
        while ticks.load(Ordering::SeqCst) < 3 {
            gvfiber::sleep(Duration::from_millis(50));
        }
        timer.cancel();
        c.fetch_add(1, Ordering::SeqCst);
    });

    runtime.shutdown()?;
    println!(
        "\n{} fibers completed in {:?}",
        completed.load(Ordering::SeqCst),
        start.elapsed()
    );
    println!("=== Example Complete ===");
    Ok(())
}
