use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::Duration;
use std::{cmp, mem};

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};
use slab::Slab;

use crate::channel::Channel;
use crate::ready::Ready;
use crate::sys::syscall;
use crate::token::Token;

const EVENTS_CAPACITY: usize = 1024;

/// The readiness facility behind the loop: an epoll descriptor plus the
/// token registry mapping kernel events back to channels.
///
/// Both `update_channel` and `remove_channel` must be invoked from the
/// owning loop's thread; the loop asserts this before delegating here.
pub struct Poller {
    epfd: RawFd,
    channels: Slab<Weak<Channel>>,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        Ok(Poller {
            epfd,
            channels: Slab::new(),
            events: Vec::with_capacity(EVENTS_CAPACITY),
        })
    }

    /// Wait for readiness and return the active channels with their masks.
    ///
    /// An interrupted wait returns an empty list without error. Events for
    /// channels whose owner has gone away prune the stale registration.
    pub fn poll(&mut self, timeout: Duration) -> io::Result<Vec<(Arc<Channel>, Ready)>> {
        let millis = cmp::min(timeout.as_millis(), libc::c_int::MAX as u128) as libc::c_int;

        let cnt = match syscall!(epoll_wait(
            self.epfd,
            self.events.as_mut_ptr(),
            self.events.capacity() as libc::c_int,
            millis
        )) {
            Ok(cnt) => cnt,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(e),
        };

        unsafe { self.events.set_len(cnt as usize) };

        let mut active = Vec::with_capacity(cnt as usize);
        let events = mem::take(&mut self.events);

        for event in &events {
            let token = event.u64 as usize;
            let ready = epoll_to_ready(event.events as libc::c_int);

            match self.channels.get(token) {
                Some(weak) => match weak.upgrade() {
                    Some(channel) => active.push((channel, ready)),
                    None => {
                        log::trace!("Poller::poll() dropping dead registration, token={}", token);
                        self.channels.remove(token);
                    }
                },
                None => log::trace!("Poller::poll() stale token={}", token),
            }
        }

        self.events = events;
        Ok(active)
    }

    /// Add, modify, or drop the registration to match the channel's
    /// interest mask and registration state.
    pub fn update_channel(&mut self, channel: &Arc<Channel>) {
        let token = channel.token();
        let interest = channel.interest();

        if token == Token::INVALID {
            if interest.is_empty() {
                return;
            }
            let entry = self.channels.insert(Arc::downgrade(channel));
            channel.set_token(Token(entry));
            if let Err(e) = self.ctl(libc::EPOLL_CTL_ADD, channel.fd(), entry, interest) {
                log::error!("Poller::update_channel() add fd={}: {}", channel.fd(), e);
                self.channels.remove(entry);
                channel.set_token(Token::INVALID);
            }
        } else if interest.is_empty() {
            self.delete(channel.fd());
            self.channels.remove(token.0);
            channel.set_token(Token::INVALID);
        } else if let Err(e) = self.ctl(libc::EPOLL_CTL_MOD, channel.fd(), token.0, interest) {
            // The descriptor may have been torn down concurrently; a stale
            // modify is not an error.
            if !is_stale(&e) {
                log::error!("Poller::update_channel() mod fd={}: {}", channel.fd(), e);
            }
        }
    }

    /// Drop the registration entirely. Idempotent.
    pub fn remove_channel(&mut self, channel: &Channel) {
        let token = channel.token();
        if token == Token::INVALID {
            return;
        }

        self.delete(channel.fd());
        self.channels.remove(token.0);
        channel.set_token(Token::INVALID);
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: usize, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ready_to_epoll(interest),
            u64: token as u64,
        };
        syscall!(epoll_ctl(self.epfd, op, fd, &mut info))?;
        Ok(())
    }

    fn delete(&self, fd: RawFd) {
        let mut info = libc::epoll_event { events: 0, u64: 0 };
        if let Err(e) = syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info)) {
            if !is_stale(&e) {
                log::error!("Poller::remove_channel() del fd={}: {}", fd, e);
            }
        }
    }
}

fn is_stale(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ENOENT) | Some(libc::EBADF) | Some(libc::EPERM)
    )
}

fn ready_to_epoll(interest: Ready) -> u32 {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= EPOLLIN;
    }

    if interest.is_writable() {
        kind |= EPOLLOUT;
    }

    kind as u32
}

fn epoll_to_ready(epoll: libc::c_int) -> Ready {
    let mut kind = Ready::empty();

    if (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0 {
        kind.insert(Ready::readable());
    }

    if (epoll & EPOLLOUT) != 0 {
        kind.insert(Ready::writable());
    }

    // EPOLLERR usually means a socket error happened.
    if (epoll & EPOLLERR) != 0 {
        kind.insert(Ready::error());
    }

    if (epoll & EPOLLRDHUP) != 0 || (epoll & EPOLLHUP) != 0 {
        kind.insert(Ready::hup());
    }

    kind
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        let _ = syscall!(close(self.epfd));
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Poller")
            .field("epfd", &self.epfd)
            .field("channels", &self.channels.len())
            .finish()
    }
}
