use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::event_loop::LoopHandle;
use crate::event_loop_thread::EventLoopThread;

/// A pool of worker loops fed by round-robin assignment.
///
/// With zero workers everything runs on the base loop; otherwise the base
/// loop keeps accepting while per-connection I/O lands on the workers.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    num_threads: AtomicUsize,
    started: AtomicBool,
    next: AtomicUsize,
    threads: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<LoopHandle>>,
}

impl EventLoopThreadPool {
    pub fn new(base: LoopHandle) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            num_threads: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Worker count, excluding the base loop. Must precede `start`.
    pub fn set_num_threads(&self, n: usize) {
        assert!(!self.started());
        self.num_threads.store(n, Ordering::Release);
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Spawn the workers. Runs on the base loop's thread.
    pub fn start(&self) {
        assert!(!self.started());
        self.base.assert_in_loop_thread();
        self.started.store(true, Ordering::Release);

        let n = self.num_threads.load(Ordering::Acquire);
        let mut threads = self.threads.lock().unwrap();
        let mut loops = self.loops.lock().unwrap();
        for _ in 0..n {
            let mut thread = EventLoopThread::new();
            loops.push(thread.start_loop());
            threads.push(thread);
        }

        log::info!("EventLoopThreadPool::start() with {} thread(s)", n);
    }

    /// Next loop in round-robin order; the base loop when there are no
    /// workers.
    pub fn get_next_loop(&self) -> LoopHandle {
        assert!(self.started());

        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base.clone();
        }

        let idx = self.next.fetch_add(1, Ordering::AcqRel) % loops.len();
        loops[idx].clone()
    }

    /// The base loop followed by the workers.
    pub fn get_all_loops(&self) -> Vec<LoopHandle> {
        assert!(self.started());

        let mut all = vec![self.base.clone()];
        all.extend(self.loops.lock().unwrap().iter().cloned());
        all
    }

    /// Quit every worker loop and join the threads.
    pub fn stop(&self) {
        let mut threads = self.threads.lock().unwrap();
        for thread in threads.iter_mut() {
            thread.stop();
        }
    }
}
