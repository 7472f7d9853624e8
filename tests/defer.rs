use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use moor::defer::{clear_queue, defer, has_queue, perform_all, Pool};

mod util;

// The deferred queue is process global; tests touching it take this lock
// so they observe only their own tasks.
static QUEUE_LOCK: Mutex<()> = Mutex::new(());

fn exclusive() -> MutexGuard<'static, ()> {
    util::init();
    let guard = QUEUE_LOCK.lock().unwrap();
    perform_all();
    guard
}

static COUNTER: AtomicUsize = AtomicUsize::new(0);
static ORDER: Mutex<Vec<usize>> = Mutex::new(Vec::new());

fn count_task(_: usize, _: usize) {
    COUNTER.fetch_add(1, Ordering::SeqCst);
}

fn order_task(tag: usize, _: usize) {
    ORDER.lock().unwrap().push(tag);
}

fn chain_task(remaining: usize, _: usize) {
    COUNTER.fetch_add(1, Ordering::SeqCst);
    if remaining > 0 {
        defer(chain_task, remaining - 1, 0);
    }
}

#[test]
fn runs_each_task_exactly_once_in_order() {
    let _guard = exclusive();
    ORDER.lock().unwrap().clear();
    for tag in 0..1000 {
        defer(order_task, tag, 0);
    }
    assert!(has_queue());
    perform_all();
    assert!(!has_queue());
    let order = ORDER.lock().unwrap();
    assert_eq!(order.len(), 1000);
    assert!(order.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn tasks_scheduled_while_performing_run_before_return() {
    let _guard = exclusive();
    COUNTER.store(0, Ordering::SeqCst);
    defer(chain_task, 99, 0);
    perform_all();
    assert_eq!(COUNTER.load(Ordering::SeqCst), 100);
}

#[test]
fn clear_queue_drops_without_running() {
    let _guard = exclusive();
    COUNTER.store(0, Ordering::SeqCst);
    for _ in 0..500 {
        defer(count_task, 0, 0);
    }
    clear_queue();
    assert!(!has_queue());
    perform_all();
    assert_eq!(COUNTER.load(Ordering::SeqCst), 0);
}

#[test]
fn queue_spills_across_many_blocks() {
    let _guard = exclusive();
    COUNTER.store(0, Ordering::SeqCst);
    // Far beyond one block's capacity, so block chaining and recycling are
    // exercised.
    for _ in 0..10_000 {
        defer(count_task, 0, 0);
    }
    perform_all();
    assert_eq!(COUNTER.load(Ordering::SeqCst), 10_000);
}

#[test]
fn pool_performs_tasks_in_the_background() {
    let _guard = exclusive();
    COUNTER.store(0, Ordering::SeqCst);
    for _ in 0..2_000 {
        defer(count_task, 0, 0);
    }
    let pool = Pool::start(2).unwrap();
    assert!(pool.is_active());
    pool.stop();
    assert!(!pool.is_active());
    pool.wait();
    // Workers drain the queue fully before exiting.
    perform_all();
    assert_eq!(COUNTER.load(Ordering::SeqCst), 2_000);
}
