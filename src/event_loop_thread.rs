use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::event_loop::{EventLoop, LoopHandle};
use crate::logger::fatal;

/// Owns one thread whose body constructs an [`EventLoop`], publishes its
/// handle to the parent, then runs it until quit.
pub struct EventLoopThread {
    handle: Option<LoopHandle>,
    thread: Option<JoinHandle<()>>,
    exiting: bool,
}

impl EventLoopThread {
    pub fn new() -> EventLoopThread {
        EventLoopThread {
            handle: None,
            thread: None,
            exiting: false,
        }
    }

    /// Spawn the thread and block until its loop is up, returning the
    /// loop's handle.
    pub fn start_loop(&mut self) -> LoopHandle {
        assert!(self.thread.is_none());

        let slot: Arc<(Mutex<Option<LoopHandle>>, Condvar)> =
            Arc::new((Mutex::new(None), Condvar::new()));
        let peer = slot.clone();

        let thread = thread::Builder::new()
            .name("event-loop".into())
            .spawn(move || {
                let lp = match EventLoop::new() {
                    Ok(lp) => lp,
                    Err(e) => fatal!("EventLoopThread: EventLoop::new() {}", e),
                };

                {
                    let (lock, cond) = &*peer;
                    *lock.lock().unwrap() = Some(lp.handle());
                    cond.notify_one();
                }

                lp.run();
                log::trace!("EventLoopThread exit");
            })
            .unwrap_or_else(|e| fatal!("EventLoopThread: spawn: {}", e));

        let handle = {
            let (lock, cond) = &*slot;
            let mut published = lock.lock().unwrap();
            while published.is_none() {
                published = cond.wait(published).unwrap();
            }
            published.take().unwrap()
        };

        self.thread = Some(thread);
        self.handle = Some(handle.clone());
        handle
    }

    /// Quit the loop and join the thread.
    pub fn stop(&mut self) {
        if self.exiting {
            return;
        }
        self.exiting = true;

        if let Some(handle) = &self.handle {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Default for EventLoopThread {
    fn default() -> EventLoopThread {
        EventLoopThread::new()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use super::EventLoopThread;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn starts_and_runs_tasks() {
        let mut lt = EventLoopThread::new();
        let handle = lt.start_loop();

        assert!(!handle.is_in_loop_thread());

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let this_thread = thread::current().id();
        handle.run_in_loop(move |lp| {
            assert!(lp.is_in_loop_thread());
            assert_ne!(thread::current().id(), this_thread);
            flag.store(true, Ordering::Release);
        });

        while !ran.load(Ordering::Acquire) {
            thread::yield_now();
        }

        lt.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let mut lt = EventLoopThread::new();
        lt.start_loop();
        lt.stop();
        lt.stop();
    }
}
