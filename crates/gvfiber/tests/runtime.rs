use gvfiber::{Runtime, RuntimeConfig, RuntimeError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn config(name: &str, threads: usize) -> RuntimeConfig {
    RuntimeConfig::new().threads(threads).name(name)
}

#[test]
fn nested_spawn_runs_before_shutdown_returns() {
    gvfiber::init_logging();
    let rt = Runtime::new(config("nested", 2)).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    rt.spawn(move || {
        for _ in 0..10 {
            let h = h.clone();
            gvfiber::spawn(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
    });

    rt.shutdown().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 10);
}

#[test]
fn spawn_outside_a_worker_fails() {
    let err = gvfiber::spawn(|| {}).unwrap_err();
    assert!(matches!(err, RuntimeError::NoScheduler));
}

#[test]
fn yield_now_interleaves_fibers_on_one_thread() {
    let rt = Runtime::new(config("yield", 1)).unwrap();
    let trace = Arc::new(Mutex::new(Vec::new()));

    for id in 0..2 {
        let trace = trace.clone();
        rt.spawn(move || {
            for step in 0..3 {
                trace.lock().unwrap().push((id, step));
                gvfiber::yield_now();
            }
        });
    }

    rt.shutdown().unwrap();
    let trace = trace.lock().unwrap();
    assert_eq!(*trace, vec![(0, 0), (1, 0), (0, 1), (1, 1), (0, 2), (1, 2)]);
}

#[test]
fn yield_now_outside_a_fiber_is_harmless() {
    gvfiber::yield_now();
}

#[test]
fn sleep_parks_without_holding_the_worker() {
    let rt = Runtime::new(config("sleep", 1)).unwrap();
    let start = Instant::now();
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        let d = done.clone();
        rt.spawn(move || {
            gvfiber::sleep(Duration::from_millis(150));
            d.fetch_add(1, Ordering::SeqCst);
        });
    }

    rt.shutdown().unwrap();
    let elapsed = start.elapsed();
    assert_eq!(done.load(Ordering::SeqCst), 4);
    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_millis(450), "sleeps did not overlap: {elapsed:?}");
}

#[test]
fn dropping_the_runtime_waits_for_work() {
    let hits = Arc::new(AtomicUsize::new(0));
    {
        let rt = Runtime::new(config("drop", 2)).unwrap();
        for _ in 0..50 {
            let h = hits.clone();
            rt.spawn(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
    }
    assert_eq!(hits.load(Ordering::SeqCst), 50);
}

#[test]
fn invalid_config_is_rejected() {
    let err = Runtime::new(config("none", 0)).unwrap_err();
    assert!(matches!(err, RuntimeError::Config(_)));
}
