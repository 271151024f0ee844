use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::callbacks::{ErrorCallback, NewConnectionCallback};
use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::logger::fatal;
use crate::sys::socket::TcpSock;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ConnectorState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectorState {
    fn from_u8(v: u8) -> ConnectorState {
        match v {
            1 => ConnectorState::Connecting,
            2 => ConnectorState::Connected,
            _ => ConnectorState::Disconnected,
        }
    }
}

/// Classification of a failed connect attempt, delivered to the error
/// callback.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnectError {
    /// Transient network failure; another attempt may succeed.
    Retriable,
    /// Descriptor, address, or permission failure; retrying cannot help.
    Fatal,
}

/// Non-blocking connect state machine.
///
/// One `start` drives one attempt: an in-progress connect parks the
/// socket under write interest and resolves it through `SO_ERROR` when
/// the poller fires. The socket produced by a successful attempt is
/// transferred out through the new-connection callback; the connector
/// keeps no descriptor ownership afterwards.
///
/// The connector is one-shot by itself; reconnect pacing lives in
/// [`TcpClient`](crate::TcpClient).
pub struct Connector {
    loop_: LoopHandle,
    peer: SocketAddr,
    state: AtomicU8,
    // Latched on a Fatal outcome; further attempts are refused.
    fatal: AtomicBool,
    socket: Mutex<Option<TcpSock>>,
    channel: Mutex<Option<Arc<Channel>>>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    error_cb: Mutex<Option<ErrorCallback>>,
    me: Weak<Connector>,
}

const RETRIABLE: &[i32] = &[
    libc::EAGAIN,
    libc::EADDRINUSE,
    libc::EADDRNOTAVAIL,
    libc::ECONNREFUSED,
    libc::ECONNRESET,
    libc::ENETUNREACH,
    libc::ENETDOWN,
    libc::EHOSTUNREACH,
    libc::ETIMEDOUT,
];

fn classify(code: i32) -> ConnectError {
    if RETRIABLE.contains(&code) {
        ConnectError::Retriable
    } else {
        ConnectError::Fatal
    }
}

impl Connector {
    pub fn new(loop_: LoopHandle, peer: SocketAddr) -> Arc<Connector> {
        Arc::new_cyclic(|me| Connector {
            loop_,
            peer,
            state: AtomicU8::new(ConnectorState::Disconnected as u8),
            fatal: AtomicBool::new(false),
            socket: Mutex::new(None),
            channel: Mutex::new(None),
            new_connection_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_error_callback(&self, cb: ErrorCallback) {
        *self.error_cb.lock().unwrap() = Some(cb);
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn state(&self) -> ConnectorState {
        ConnectorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Begin a connect attempt. Callable from any thread; a no-op while
    /// an attempt is already in flight or established.
    pub fn start(&self) {
        if let Some(me) = self.me.upgrade() {
            self.loop_.run_in_loop(move |lp| me.start_in_loop(lp));
        }
    }

    /// Abandon whatever attempt is in flight and dial again.
    pub fn restart(&self) {
        if let Some(me) = self.me.upgrade() {
            self.loop_.run_in_loop(move |lp| {
                me.stop_in_loop(lp);
                me.start_in_loop(lp);
            });
        }
    }

    /// Abandon an in-flight attempt.
    pub fn stop(&self) {
        if let Some(me) = self.me.upgrade() {
            self.loop_.run_in_loop(move |lp| me.stop_in_loop(lp));
        }
    }

    fn stop_in_loop(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        if self.state() == ConnectorState::Connecting {
            self.detach_channel(lp);
            self.socket.lock().unwrap().take();
        }
        self.state
            .store(ConnectorState::Disconnected as u8, Ordering::Release);
    }

    fn start_in_loop(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        if self.state() != ConnectorState::Disconnected {
            return;
        }
        if self.fatal.load(Ordering::Acquire) {
            log::warn!(
                "Connector::start() {} failed fatally before, not retrying",
                self.peer
            );
            return;
        }

        let socket = match TcpSock::new(&self.peer) {
            Ok(socket) => socket,
            Err(e) => fatal!("Connector::start() socket: {}", e),
        };

        match socket.connect(&self.peer) {
            Ok(()) => self.established(lp, socket),
            Err(e) => match e.raw_os_error() {
                Some(libc::EINPROGRESS) | Some(libc::EINTR) => self.connecting(socket),
                Some(code) => match classify(code) {
                    ConnectError::Retriable => {
                        log::warn!("Connector::start() {}: {}", self.peer, e);
                        self.report_error(ConnectError::Retriable);
                    }
                    ConnectError::Fatal => {
                        log::error!("Connector::start() {}: {}", self.peer, e);
                        self.report_error(ConnectError::Fatal);
                    }
                },
                None => {
                    log::error!("Connector::start() {}: {}", self.peer, e);
                    self.report_error(ConnectError::Fatal);
                }
            },
        }
    }

    /// Park the pending socket under write interest until the kernel
    /// resolves the handshake.
    fn connecting(&self, socket: TcpSock) {
        self.state
            .store(ConnectorState::Connecting as u8, Ordering::Release);

        let channel = Channel::new(self.loop_.clone(), socket.as_raw_fd());
        *self.socket.lock().unwrap() = Some(socket);

        let weak = self.me.clone();
        channel.set_write_callback(Box::new({
            let weak = weak.clone();
            move |lp: &EventLoop| {
                if let Some(connector) = weak.upgrade() {
                    connector.handle_write(lp);
                }
            }
        }));
        // A refused connect reports EPOLLERR together with EPOLLOUT; both
        // funnel into the same SO_ERROR check.
        channel.set_error_callback(Box::new(move |lp: &EventLoop| {
            if let Some(connector) = weak.upgrade() {
                connector.handle_write(lp);
            }
        }));

        channel.enable_write();
        *self.channel.lock().unwrap() = Some(channel);
    }

    fn handle_write(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        if self.state() != ConnectorState::Connecting {
            return;
        }

        self.detach_channel(lp);
        let socket = match self.socket.lock().unwrap().take() {
            Some(socket) => socket,
            None => return,
        };

        match socket.take_error() {
            Ok(None) => self.established(lp, socket),
            Ok(Some(e)) => {
                let kind = e.raw_os_error().map_or(ConnectError::Fatal, classify);
                match kind {
                    ConnectError::Retriable => {
                        log::warn!("Connector::handle_write() {}: {}", self.peer, e)
                    }
                    ConnectError::Fatal => {
                        log::error!("Connector::handle_write() {}: {}", self.peer, e)
                    }
                }
                self.state
                    .store(ConnectorState::Disconnected as u8, Ordering::Release);
                self.report_error(kind);
            }
            Err(e) => {
                log::error!("Connector::handle_write() {}: SO_ERROR: {}", self.peer, e);
                self.state
                    .store(ConnectorState::Disconnected as u8, Ordering::Release);
                self.report_error(ConnectError::Fatal);
            }
        }
    }

    fn established(&self, lp: &EventLoop, socket: TcpSock) {
        self.state
            .store(ConnectorState::Connected as u8, Ordering::Release);

        let local = match socket.local_addr() {
            Ok(local) => local,
            Err(e) => {
                log::error!("Connector::established() local_addr: {}", e);
                self.state
                    .store(ConnectorState::Disconnected as u8, Ordering::Release);
                self.report_error(ConnectError::Fatal);
                return;
            }
        };

        let cb = self.new_connection_cb.lock().unwrap();
        match &*cb {
            Some(cb) => cb(lp, socket, local, self.peer),
            None => log::warn!(
                "Connector::established() no callback, closing fd={}",
                socket.as_raw_fd()
            ),
        }
    }

    fn detach_channel(&self, lp: &EventLoop) {
        if let Some(channel) = self.channel.lock().unwrap().take() {
            channel.disable_all();
            lp.remove_channel(&channel);
        }
    }

    fn report_error(&self, kind: ConnectError) {
        if kind == ConnectError::Fatal {
            self.fatal.store(true, Ordering::Release);
        }
        let cb = self.error_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(kind);
        }
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Connector")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("fatal", &self.fatal.load(Ordering::Acquire))
            .finish()
    }
}
