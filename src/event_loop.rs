use std::cell::{Cell, RefCell};
use std::io;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::callbacks::{Task, TimerCallback};
use crate::channel::Channel;
use crate::logger::fatal;
use crate::poller::Poller;
use crate::sys::eventfd::EventFd;
use crate::timer::{Timer, TimerHandle, TimerQueue};

/// Upper bound on one poll, so the loop periodically observes the quit
/// flag even when idle.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

thread_local! {
    static CURRENT: RefCell<Weak<Inner>> = RefCell::new(Weak::new());
}

/// Wakes a blocked poller from another thread by making its eventfd
/// readable.
#[derive(Debug)]
pub(crate) struct Waker {
    inner: EventFd,
}

impl Waker {
    fn new() -> io::Result<Waker> {
        Ok(Waker {
            inner: EventFd::new()?,
        })
    }

    pub(crate) fn wakeup(&self) {
        if let Err(e) = self.inner.write(1) {
            if e.kind() != io::ErrorKind::WouldBlock {
                log::error!("Waker::wakeup() {}", e);
            }
        }
    }

    fn drain(&self) {
        if let Err(e) = self.inner.read() {
            if e.kind() != io::ErrorKind::WouldBlock {
                log::error!("Waker::drain() {}", e);
            }
        }
    }
}

/// The cross-thread face of a loop: the task queue, the wakeup
/// descriptor, and the owning thread's identity.
pub(crate) struct Shared {
    tasks: Mutex<Vec<Task>>,
    waker: Waker,
    thread: ThreadId,
    handling_pending: AtomicBool,
    quit: AtomicBool,
}

/// A single-threaded reactor.
///
/// An `EventLoop` is exclusively owned by the thread that created it; it
/// cannot be sent elsewhere. Each iteration of [`run`] polls for
/// readiness, dispatches the active channels, then drains the task queue.
/// Other threads talk to the loop through its [`LoopHandle`].
///
/// [`run`]: EventLoop::run
pub struct EventLoop {
    inner: Rc<Inner>,
}

struct Inner {
    shared: Arc<Shared>,
    poller: RefCell<Poller>,
    timer_queue: TimerQueue,
    wake_channel: Arc<Channel>,
    handling_events: Cell<bool>,
}

impl EventLoop {
    /// Create the loop for the current thread.
    ///
    /// At most one loop may exist per thread; a second construction is a
    /// fatal error.
    pub fn new() -> io::Result<EventLoop> {
        let already = CURRENT.with(|cur| cur.borrow().upgrade().is_some());
        if already {
            fatal!("EventLoop::new() another EventLoop already exists in this thread");
        }

        let shared = Arc::new(Shared {
            tasks: Mutex::new(Vec::new()),
            waker: Waker::new()?,
            thread: thread::current().id(),
            handling_pending: AtomicBool::new(false),
            quit: AtomicBool::new(false),
        });

        let handle = LoopHandle {
            shared: shared.clone(),
        };

        let poller = Poller::new()?;
        let timer_queue = TimerQueue::new(handle.clone())?;
        let wake_channel = Channel::new(handle, shared.waker.inner.as_raw_fd());

        let inner = Rc::new(Inner {
            shared,
            poller: RefCell::new(poller),
            timer_queue,
            wake_channel,
            handling_events: Cell::new(false),
        });

        CURRENT.with(|cur| *cur.borrow_mut() = Rc::downgrade(&inner));

        let lp = EventLoop { inner };
        lp.wake_channel_register();
        lp.inner.timer_queue.register();

        log::trace!("EventLoop::new() in thread {:?}", thread::current().id());
        Ok(lp)
    }

    fn wake_channel_register(&self) {
        self.inner
            .wake_channel
            .set_read_callback(Box::new(|lp: &EventLoop| {
                lp.inner.shared.waker.drain();
            }));
        self.inner.wake_channel.enable_read();
    }

    /// Run the loop with the `EventLoop` of the current thread, if one
    /// exists.
    pub(crate) fn with_current<F, R>(f: F) -> Option<R>
    where
        F: FnOnce(&EventLoop) -> R,
    {
        let inner = CURRENT.with(|cur| cur.borrow().upgrade());
        inner.map(|inner| f(&EventLoop { inner }))
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.inner.shared.clone(),
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.inner.shared.thread
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            fatal!(
                "EventLoop::assert_in_loop_thread() owned by {:?}, called from {:?}",
                self.inner.shared.thread,
                thread::current().id()
            );
        }
    }

    /// The reactor. Blocks until [`quit`] is called.
    ///
    /// [`quit`]: EventLoop::quit
    pub fn run(&self) {
        self.assert_in_loop_thread();
        self.inner.shared.quit.store(false, Ordering::Release);
        log::trace!("EventLoop::run() started");

        while !self.inner.shared.quit.load(Ordering::Acquire) {
            let timeout = self
                .inner
                .timer_queue
                .next_expiry()
                .map(|at| at.saturating_duration_since(Instant::now()))
                .map_or(POLL_TIMEOUT, |d| d.min(POLL_TIMEOUT));

            let active = match self.inner.poller.borrow_mut().poll(timeout) {
                Ok(active) => active,
                Err(e) => fatal!("EventLoop::run() poll: {}", e),
            };

            if active.is_empty() {
                log::trace!("EventLoop::run() nothing happened");
            }

            self.inner.handling_events.set(true);
            for (channel, ready) in active {
                channel.handle_events(self, ready);
            }
            self.inner.handling_events.set(false);

            self.do_pending_tasks();
        }

        log::trace!("EventLoop::run() stopped");
    }

    /// Ask the loop to return from [`run`]. Callable from any thread.
    ///
    /// [`run`]: EventLoop::run
    pub fn quit(&self) {
        self.handle().quit();
    }

    /// Execute `task` now if on the owning thread, otherwise enqueue it
    /// and wake the loop.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task(self);
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Always enqueue `task` for the pending phase.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.handle().queue_in_loop(task);
    }

    pub fn run_at<F>(&self, when: Instant, cb: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handle().run_at(when, cb)
    }

    pub fn run_after<F>(&self, delay: Duration, cb: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handle().run_after(delay, cb)
    }

    pub fn run_every<F>(&self, interval: Duration, cb: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handle().run_every(interval, cb)
    }

    pub fn cancel_timer(&self, handle: &TimerHandle) {
        handle.cancel();
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.inner.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.inner.poller.borrow_mut().remove_channel(channel);
    }

    pub(crate) fn add_timer(&self, timer: Arc<Timer>, when: Instant) {
        self.assert_in_loop_thread();
        self.inner.timer_queue.add_timer(timer, when);
    }

    pub(crate) fn handle_expired_timers(&self) {
        self.assert_in_loop_thread();
        self.inner.timer_queue.handle_expired();
    }

    fn do_pending_tasks(&self) {
        self.inner
            .shared
            .handling_pending
            .store(true, Ordering::Release);

        // Short critical section: swap the queue out, run outside the
        // lock so tasks may enqueue more tasks freely.
        let tasks = mem::take(&mut *self.inner.shared.tasks.lock().unwrap());
        for task in tasks {
            task(self);
        }

        self.inner
            .shared
            .handling_pending
            .store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("EventLoop")
            .field("thread", &self.inner.shared.thread)
            .finish()
    }
}

/// Cloneable, `Send + Sync` handle to an [`EventLoop`].
///
/// Everything that crosses threads goes through here: scheduling work,
/// timers, and quitting. Channel registration is loop-thread-only and
/// aborts when misused.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            fatal!(
                "LoopHandle::assert_in_loop_thread() owned by {:?}, called from {:?}",
                self.shared.thread,
                thread::current().id()
            );
        }
    }

    /// True when both handles lead to the same loop.
    pub fn same_loop(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Execute `task` now if on the owning thread, otherwise enqueue it
    /// and wake the loop.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        if self.is_in_loop_thread() {
            // The thread-local is present whenever the owning loop is
            // still alive; with the loop gone the task would never run
            // anyway, so queueing it is as good as dropping it.
            match EventLoop::with_current(|lp| task(lp)) {
                Some(()) => {}
                None => log::warn!("LoopHandle::run_in_loop() loop is gone, task dropped"),
            }
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Always enqueue `task`; wake the loop when enqueuing from another
    /// thread or while the loop is draining tasks, so a task queued by a
    /// task does not wait out a full poll.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.shared.tasks.lock().unwrap().push(Box::new(task));

        if !self.is_in_loop_thread() || self.shared.handling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub fn run_at<F>(&self, when: Instant, cb: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule(Box::new(cb) as TimerCallback, when, None)
    }

    pub fn run_after<F>(&self, delay: Duration, cb: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule(Box::new(cb) as TimerCallback, Instant::now() + delay, None)
    }

    /// Schedule `cb` to run every `interval`, starting one interval from
    /// now.
    pub fn run_every<F>(&self, interval: Duration, cb: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule(
            Box::new(cb) as TimerCallback,
            Instant::now() + interval,
            Some(interval),
        )
    }

    pub fn cancel_timer(&self, handle: &TimerHandle) {
        handle.cancel();
    }

    fn schedule(&self, cb: TimerCallback, when: Instant, interval: Option<Duration>) -> TimerHandle {
        let timer = Timer::new(cb, interval);
        let handle = TimerHandle::new(&timer);

        self.run_in_loop(move |lp| lp.add_timer(timer, when));

        handle
    }

    pub(crate) fn update_channel(&self, channel: Arc<Channel>) {
        self.assert_in_loop_thread();
        if EventLoop::with_current(|lp| lp.update_channel(&channel)).is_none() {
            log::warn!("LoopHandle::update_channel() loop is gone");
        }
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        if EventLoop::with_current(|lp| lp.remove_channel(channel)).is_none() {
            log::warn!("LoopHandle::remove_channel() loop is gone");
        }
    }

    pub(crate) fn wakeup(&self) {
        self.shared.waker.wakeup();
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("LoopHandle")
            .field("thread", &self.shared.thread)
            .finish()
    }
}
