use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::callbacks::TimerCallback;
use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys::timerfd::TimerFd;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// A scheduled callback owned by one loop's [`TimerQueue`].
pub struct Timer {
    cb: TimerCallback,
    // None for a one-shot timer.
    interval: Option<Duration>,
    canceled: AtomicBool,
    seq: u64,
}

impl Timer {
    pub(crate) fn new(cb: TimerCallback, interval: Option<Duration>) -> Arc<Timer> {
        Arc::new(Timer {
            cb,
            interval,
            canceled: AtomicBool::new(false),
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn run(&self) {
        (self.cb)();
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

/// Cancellation handle for a scheduled timer.
///
/// May be used from any thread. Cancellation is observed by the dispatch
/// loop before the callback would fire; a canceled timer never runs again
/// and is dropped at its expiry instead of being re-inserted.
#[derive(Clone)]
pub struct TimerHandle {
    inner: Weak<Timer>,
}

impl TimerHandle {
    pub(crate) fn new(timer: &Arc<Timer>) -> TimerHandle {
        TimerHandle {
            inner: Arc::downgrade(timer),
        }
    }

    pub fn cancel(&self) {
        if let Some(timer) = self.inner.upgrade() {
            timer.canceled.store(true, Ordering::Release);
        }
    }
}

/// Monotonic timer heap backed by a timerfd registered with the poller.
///
/// Entries are keyed by `(expiry, sequence)` so colliding timestamps stay
/// distinct. Everything here runs on the owning loop's thread; callers on
/// other threads go through [`LoopHandle::run_after`] and friends, which
/// forward to the loop.
pub(crate) struct TimerQueue {
    timer_fd: TimerFd,
    channel: Arc<Channel>,
    timers: RefCell<BTreeMap<(Instant, u64), Arc<Timer>>>,
}

impl TimerQueue {
    pub(crate) fn new(loop_: LoopHandle) -> io::Result<TimerQueue> {
        let timer_fd = TimerFd::new()?;
        let channel = Channel::new(loop_, timer_fd.as_raw_fd());

        Ok(TimerQueue {
            timer_fd,
            channel,
            timers: RefCell::new(BTreeMap::new()),
        })
    }

    /// Register the timerfd channel with the poller. Runs once, from the
    /// owning thread, while the loop is being built.
    pub(crate) fn register(&self) {
        self.channel
            .set_read_callback(Box::new(|lp: &EventLoop| lp.handle_expired_timers()));
        self.channel.enable_read();
    }

    pub(crate) fn add_timer(&self, timer: Arc<Timer>, when: Instant) {
        let earliest_changed = {
            let mut timers = self.timers.borrow_mut();
            let earliest = timers.keys().next().map(|&(at, _)| at);
            timers.insert((when, timer.seq), timer);
            earliest.map_or(true, |at| when < at)
        };

        if earliest_changed {
            self.reset_timerfd(when);
        }
    }

    pub(crate) fn next_expiry(&self) -> Option<Instant> {
        self.timers.borrow().keys().next().map(|&(at, _)| at)
    }

    /// Pop and run everything that has expired, re-inserting repeating
    /// timers, then reprogram the descriptor for the new earliest deadline.
    pub(crate) fn handle_expired(&self) {
        // Drain the expiration count; a spurious wakeup reads WouldBlock.
        let _ = self.timer_fd.read();

        let now = Instant::now();
        let expired = {
            let mut timers = self.timers.borrow_mut();
            let unexpired = timers.split_off(&(now + Duration::from_nanos(1), 0));
            std::mem::replace(&mut *timers, unexpired)
        };

        let mut repeating = Vec::new();
        for ((when, _), timer) in expired {
            if timer.is_canceled() {
                continue;
            }
            timer.run();
            if let Some(interval) = timer.interval {
                if !timer.is_canceled() {
                    repeating.push((when + interval, timer));
                }
            }
        }

        {
            let mut timers = self.timers.borrow_mut();
            for (when, timer) in repeating {
                let seq = timer.seq;
                timers.insert((when, seq), timer);
            }
        }

        if let Some(when) = self.next_expiry() {
            self.reset_timerfd(when);
        }
    }

    fn reset_timerfd(&self, when: Instant) {
        let delay = when.saturating_duration_since(Instant::now());
        if let Err(e) = self.timer_fd.set_after(delay) {
            log::error!("TimerQueue::reset_timerfd() {}", e);
        }
    }
}
