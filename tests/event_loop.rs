use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hive_net::{EventLoop, TimerHandle};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn run_in_loop_executes_inline_on_owner_thread() {
    init_logging();
    let lp = EventLoop::new().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    lp.run_in_loop(move |lp| {
        assert!(lp.is_in_loop_thread());
        flag.store(true, Ordering::Release);
    });

    // Inline execution: done before the loop ever runs.
    assert!(ran.load(Ordering::Acquire));
}

#[test]
fn cross_thread_queue_wakes_blocked_poll() {
    init_logging();
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.queue_in_loop(move |lp| {
            flag.store(true, Ordering::Release);
            lp.quit();
        });
    });

    let start = Instant::now();
    lp.run();
    worker.join().unwrap();

    assert!(ran.load(Ordering::Acquire));
    // Without the wakeup descriptor this would sit out the 10 s poll.
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn queued_tasks_preserve_fifo_order() {
    init_logging();
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let order: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    let worker = thread::spawn(move || {
        for i in 0..3 {
            let order = order.clone();
            handle.queue_in_loop(move |_| order.lock().unwrap().push(i));
        }
        handle.queue_in_loop(move |lp| {
            order.lock().unwrap().push(99);
            lp.quit();
        });
    });

    lp.run();
    worker.join().unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 99]);
}

#[test]
fn task_queued_by_task_runs_without_a_full_poll_wait() {
    init_logging();
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let kicker = handle.clone();
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        kicker.queue_in_loop(move |lp| {
            // Queued while the loop is draining tasks; the loop must wake
            // itself instead of waiting out the next poll.
            lp.queue_in_loop(|lp| lp.quit());
        });
    });

    let start = Instant::now();
    lp.run();
    worker.join().unwrap();

    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn run_after_fires_at_or_after_deadline() {
    init_logging();
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let quitter = handle.clone();
    let start = Instant::now();
    lp.run_after(Duration::from_millis(100), move || {
        flag.store(true, Ordering::Release);
        quitter.quit();
    });

    lp.run();

    assert!(fired.load(Ordering::Acquire));
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[test]
fn canceled_timer_never_fires() {
    init_logging();
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let victim = lp.run_after(Duration::from_millis(50), move || {
        flag.store(true, Ordering::Release);
    });
    lp.cancel_timer(&victim);

    let quitter = handle.clone();
    lp.run_after(Duration::from_millis(200), move || quitter.quit());

    lp.run();
    assert!(!fired.load(Ordering::Acquire));
}

#[test]
fn run_every_repeats_until_canceled() {
    init_logging();
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let count = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));

    let ticks = count.clone();
    let me = slot.clone();
    let timer = lp.run_every(Duration::from_millis(30), move || {
        let n = ticks.fetch_add(1, Ordering::AcqRel) + 1;
        if n == 3 {
            if let Some(timer) = me.lock().unwrap().take() {
                timer.cancel();
            }
        }
    });
    *slot.lock().unwrap() = Some(timer);

    let quitter = handle.clone();
    lp.run_after(Duration::from_millis(300), move || quitter.quit());

    lp.run();
    assert_eq!(count.load(Ordering::Acquire), 3);
}

#[test]
fn quit_from_another_thread_interrupts_idle_loop() {
    init_logging();
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.quit();
    });

    let start = Instant::now();
    lp.run();
    worker.join().unwrap();

    assert!(start.elapsed() < Duration::from_secs(2));
}
