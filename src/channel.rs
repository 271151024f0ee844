use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::callbacks::EventCallback;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::ready::Ready;
use crate::token::Token;

#[derive(Default)]
struct Handlers {
    read: Option<EventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// Bridges one descriptor's readiness events to typed callbacks.
///
/// A channel belongs to exactly one [`EventLoop`]; every interest mutation
/// and every dispatch happens on that loop's thread. The owner must
/// disable all interest (and let the loop drop the registration) before
/// the underlying descriptor is closed.
///
/// The channel never owns the descriptor.
pub struct Channel {
    fd: RawFd,
    loop_: LoopHandle,
    me: Weak<Channel>,
    // Token::INVALID while not registered with the poller.
    token: AtomicUsize,
    interest: AtomicUsize,
    revents: AtomicUsize,
    handlers: Mutex<Handlers>,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

impl Channel {
    pub fn new(loop_: LoopHandle, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|me| Channel {
            fd,
            loop_,
            me: me.clone(),
            token: AtomicUsize::new(Token::INVALID.0),
            interest: AtomicUsize::new(Ready::empty().bits()),
            revents: AtomicUsize::new(Ready::empty().bits()),
            handlers: Mutex::new(Handlers::default()),
            tie: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.token.load(Ordering::Acquire))
    }

    pub(crate) fn set_token(&self, token: Token) {
        self.token.store(token.0, Ordering::Release);
    }

    pub fn interest(&self) -> Ready {
        Ready::from_bits(self.interest.load(Ordering::Acquire))
    }

    pub fn is_reading(&self) -> bool {
        self.interest().is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest().is_writable()
    }

    pub fn is_none_interest(&self) -> bool {
        self.interest().is_empty()
    }

    pub fn set_read_callback(&self, cb: EventCallback) {
        self.handlers.lock().unwrap().read = Some(cb);
    }

    pub fn set_write_callback(&self, cb: EventCallback) {
        self.handlers.lock().unwrap().write = Some(cb);
    }

    pub fn set_close_callback(&self, cb: EventCallback) {
        self.handlers.lock().unwrap().close = Some(cb);
    }

    pub fn set_error_callback(&self, cb: EventCallback) {
        self.handlers.lock().unwrap().error = Some(cb);
    }

    /// Tie this channel to its owner.
    ///
    /// Dispatch upgrades the weak reference and holds the owner strong for
    /// the duration of a single event delivery; once the owner is gone,
    /// pending events are silently dropped.
    pub fn tie(&self, owner: Arc<dyn Any + Send + Sync>) {
        *self.tie.lock().unwrap() = Some(Arc::downgrade(&owner));
    }

    pub fn enable_read(&self) {
        self.set_interest(self.interest() | Ready::readable());
    }

    pub fn disable_read(&self) {
        self.set_interest(self.interest() - Ready::readable());
    }

    pub fn enable_write(&self) {
        self.set_interest(self.interest() | Ready::writable());
    }

    pub fn disable_write(&self) {
        self.set_interest(self.interest() - Ready::writable());
    }

    pub fn disable_all(&self) {
        self.set_interest(Ready::empty());
    }

    fn set_interest(&self, interest: Ready) {
        self.interest.store(interest.bits(), Ordering::Release);
        self.update();
    }

    fn update(&self) {
        // `me` only fails to upgrade during teardown of the last owner,
        // when there is no registration left to update.
        if let Some(channel) = self.me.upgrade() {
            self.loop_.update_channel(channel);
        }
    }

    /// The readiness mask observed at the last dispatch.
    pub fn revents(&self) -> Ready {
        Ready::from_bits(self.revents.load(Ordering::Acquire))
    }

    /// Dispatch one batch of readiness events.
    ///
    /// Order: error, close (hang-up without readable data), read, write.
    /// Callbacks may tear the owner down mid-dispatch; the loop treats the
    /// channel as potentially removed afterwards and does not re-enter it
    /// in the same iteration.
    pub(crate) fn handle_events(&self, lp: &EventLoop, ready: Ready) {
        let tie = self.tie.lock().unwrap().clone();
        let _guard: Option<Arc<dyn Any + Send + Sync>> = match tie {
            Some(weak) => match weak.upgrade() {
                Some(owner) => Some(owner),
                None => {
                    log::trace!("Channel::handle_events() fd={} owner is gone", self.fd);
                    return;
                }
            },
            None => None,
        };

        self.revents.store(ready.bits(), Ordering::Release);

        let handlers = self.handlers.lock().unwrap();

        if ready.is_error() {
            if let Some(cb) = &handlers.error {
                cb(lp);
            }
        }

        if ready.is_hup() && !ready.is_readable() {
            if let Some(cb) = &handlers.close {
                cb(lp);
            }
        }

        if ready.is_readable() {
            if let Some(cb) = &handlers.read {
                cb(lp);
            }
        }

        if ready.is_writable() {
            if let Some(cb) = &handlers.write {
                cb(lp);
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("token", &self.token())
            .field("interest", &self.interest())
            .finish()
    }
}
