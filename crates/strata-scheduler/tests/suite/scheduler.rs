use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use strata_scheduler::{build_pool, Scheduler, SchedulerConfig};

#[test]
fn background_jobs_run_off_the_caller_thread() {
    let scheduler = Scheduler::new(SchedulerConfig {
        background_threads: 1,
    });
    let caller = std::thread::current().id();
    let (tx, rx) = mpsc::channel();
    scheduler.spawn_blocking("test", move || {
        tx.send(std::thread::current().id()).unwrap();
    });
    let worker = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_ne!(worker, caller);
}

#[test]
fn panicking_job_does_not_take_the_pool_down() {
    let scheduler = Scheduler::new(SchedulerConfig {
        background_threads: 1,
    });
    scheduler.spawn_blocking("exploding", || panic!("write failed hard"));

    let ran = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let counter = Arc::clone(&ran);
    scheduler.spawn_blocking("after", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        tx.send(()).unwrap();
    });
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn build_pool_uses_requested_threads() {
    let pool = build_pool("strata-test", 2);
    assert!(!pool.is_inline());
    assert_eq!(pool.threads(), 2);

    let (tx, rx) = mpsc::channel();
    pool.spawn(move || tx.send(7).unwrap());
    assert_eq!(rx.recv().unwrap(), 7);
}
