use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionRef,
    WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::logger::fatal;
use crate::sys::socket::TcpSock;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

/// One established TCP connection, pinned to one loop.
///
/// The state machine runs Connecting → Connected → Disconnecting →
/// Disconnected. All mutating operations (`send`, `shutdown`,
/// `force_close`, `start_read`, `stop_read`) are safe from any thread and
/// route to the owning loop; accessors read atomics or immutable fields.
///
/// Shared ownership: the owning loop's connection set, the channel tie,
/// and any in-flight task each hold the connection alive until they are
/// done with it.
pub struct TcpConnection {
    loop_: LoopHandle,
    socket: TcpSock,
    channel: Arc<Channel>,
    local: SocketAddr,
    peer: SocketAddr,
    state: AtomicU8,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
    high_water_mark: AtomicUsize,
    context: Mutex<Option<Box<dyn Any + Send>>>,
    me: Weak<TcpConnection>,
}

impl TcpConnection {
    pub(crate) fn new(
        loop_: LoopHandle,
        socket: TcpSock,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> TcpConnectionRef {
        let fd = socket.as_raw_fd();

        let conn = Arc::new_cyclic(|me: &Weak<TcpConnection>| TcpConnection {
            channel: Channel::new(loop_.clone(), fd),
            loop_,
            socket,
            local,
            peer,
            state: AtomicU8::new(ConnState::Connecting as u8),
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            context: Mutex::new(None),
            me: me.clone(),
        });

        let weak = Arc::downgrade(&conn);
        conn.channel.set_read_callback(Box::new({
            let weak = weak.clone();
            move |lp: &EventLoop| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(lp);
                }
            }
        }));
        conn.channel.set_write_callback(Box::new({
            let weak = weak.clone();
            move |lp: &EventLoop| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write(lp);
                }
            }
        }));
        conn.channel.set_close_callback(Box::new({
            let weak = weak.clone();
            move |lp: &EventLoop| {
                if let Some(conn) = weak.upgrade() {
                    // The error path may already have torn the connection
                    // down within this same dispatch.
                    if conn.state() != ConnState::Disconnected {
                        conn.handle_close(lp);
                    }
                }
            }
        }));
        conn.channel.set_error_callback(Box::new(move |lp: &EventLoop| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error(lp);
            }
        }));

        log::trace!("TcpConnection::new() {} fd={}", conn.name(), fd);
        conn
    }

    fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn name(&self) -> String {
        format!("{} -> {}", self.peer, self.local)
    }

    pub fn owner_loop(&self) -> &LoopHandle {
        &self.loop_
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark.store(mark, Ordering::Release);
        *self.high_water_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    /// Attach an opaque user value to the connection.
    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        *self.context.lock().unwrap() = Some(context);
    }

    /// Access the attached user value.
    pub fn with_context<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Option<Box<dyn Any + Send>>) -> R,
    {
        f(&mut self.context.lock().unwrap())
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.socket.set_nodelay(on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.socket.set_keep_alive(on)
    }

    /// Bytes queued for write but not yet accepted by the socket.
    pub fn output_readable_bytes(&self) -> usize {
        self.output.lock().unwrap().readable_bytes()
    }

    /// Promote the freshly accepted/connected socket to Connected, tie the
    /// channel, and start reading. Runs on the owning loop.
    pub(crate) fn connect_established(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        if self
            .state
            .compare_exchange(
                ConnState::Connecting as u8,
                ConnState::Connected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            fatal!(
                "TcpConnection::connect_established() {} unexpected state {:?}",
                self.name(),
                self.state()
            );
        }

        if let Some(me) = self.me.upgrade() {
            self.channel.tie(me);
        }
        self.channel.enable_read();
    }

    /// Send bytes to the peer.
    ///
    /// On the owning loop this writes directly when nothing is queued;
    /// from any other thread the payload is copied and the write happens
    /// on the owning loop. Silently dropped unless Connected.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnState::Connected {
            log::warn!("TcpConnection::send() {} not connected, give up", self.name());
            return;
        }

        if self.loop_.is_in_loop_thread() {
            if EventLoop::with_current(|lp| self.send_in_loop(lp, data)).is_none() {
                log::warn!("TcpConnection::send() {} loop is gone", self.name());
            }
        } else if let Some(me) = self.me.upgrade() {
            let owned = data.to_vec();
            self.loop_.queue_in_loop(move |lp| me.send_in_loop(lp, &owned));
        }
    }

    /// Send and drain the caller's buffer.
    pub fn send_buffer(&self, buf: &mut Buffer) {
        if self.state() != ConnState::Connected {
            log::warn!("TcpConnection::send() {} not connected, give up", self.name());
            return;
        }

        if self.loop_.is_in_loop_thread() {
            let sent = EventLoop::with_current(|lp| self.send_in_loop(lp, buf.peek()));
            if sent.is_some() {
                buf.retrieve_all();
            }
        } else if let Some(me) = self.me.upgrade() {
            let owned = buf.retrieve_all_as_bytes();
            self.loop_.queue_in_loop(move |lp| me.send_in_loop(lp, &owned));
        }
    }

    /// Half-close the write side once the output buffer drains.
    pub fn shutdown(&self) {
        let swapped = self.state.compare_exchange(
            ConnState::Connected as u8,
            ConnState::Disconnecting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_ok() {
            if let Some(me) = self.me.upgrade() {
                self.loop_.run_in_loop(move |lp| me.shutdown_in_loop(lp));
            }
        }
    }

    /// Tear the connection down without waiting for queued output.
    ///
    /// Safe to call repeatedly and from any thread; the close callback
    /// fires exactly once.
    pub fn force_close(&self) {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if cur == ConnState::Disconnected as u8 {
                return;
            }
            match self.state.compare_exchange_weak(
                cur,
                ConnState::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }

        if let Some(me) = self.me.upgrade() {
            self.loop_.run_in_loop(move |lp| me.force_close_in_loop(lp));
        }
    }

    pub fn start_read(&self) {
        if let Some(me) = self.me.upgrade() {
            self.loop_.run_in_loop(move |lp| {
                lp.assert_in_loop_thread();
                if !me.channel.is_reading() {
                    me.channel.enable_read();
                }
            });
        }
    }

    pub fn stop_read(&self) {
        if let Some(me) = self.me.upgrade() {
            self.loop_.run_in_loop(move |lp| {
                lp.assert_in_loop_thread();
                if me.channel.is_reading() {
                    me.channel.disable_read();
                }
            });
        }
    }

    pub fn is_reading(&self) -> bool {
        self.channel.is_reading()
    }

    fn handle_read(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            return;
        }

        let n = {
            let mut input = self.input.lock().unwrap();
            input.read_fd(self.socket.as_raw_fd())
        };

        match n {
            Ok(0) => self.handle_close(lp),
            Ok(_) => {
                let cb = self.message_cb.lock().unwrap().clone();
                if let (Some(cb), Some(me)) = (cb, self.me.upgrade()) {
                    let mut input = self.input.lock().unwrap();
                    cb(&me, &mut input);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::error!("TcpConnection::handle_read() {}: {}", self.name(), e);
                self.handle_error(lp);
            }
        }
    }

    fn handle_write(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            log::warn!(
                "TcpConnection::handle_write() {} disconnected, give up writing",
                self.name()
            );
            return;
        }

        let mut fault = false;
        {
            let mut output = self.output.lock().unwrap();
            debug_assert!(output.readable_bytes() > 0);
            debug_assert!(self.channel.is_writing());

            match self.socket.write(output.peek()) {
                Ok(n) => {
                    output.retrieve(n);
                    if output.readable_bytes() == 0 {
                        self.channel.disable_write();
                        if self.state() == ConnState::Disconnecting {
                            self.shutdown_in_loop(lp);
                        }
                        self.queue_write_complete(lp);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    log::error!("TcpConnection::handle_write() {}: {}", self.name(), e);
                    fault = matches!(
                        e.raw_os_error(),
                        Some(libc::EPIPE) | Some(libc::ECONNRESET)
                    );
                }
            }
        }

        if fault {
            self.handle_error(lp);
        }
    }

    fn handle_close(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        let state = self.state();
        if state != ConnState::Connected && state != ConnState::Disconnecting {
            fatal!(
                "TcpConnection::handle_close() {} unexpected state {:?}",
                self.name(),
                state
            );
        }

        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();
        lp.remove_channel(&self.channel);

        let cb = self.close_cb.lock().unwrap().clone();
        if let (Some(cb), Some(me)) = (cb, self.me.upgrade()) {
            cb(&me);
        }
    }

    fn handle_error(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        match self.socket.take_error() {
            Ok(Some(e)) => log::error!("TcpConnection::handle_error() {}: {}", self.name(), e),
            Ok(None) => log::error!("TcpConnection::handle_error() {}", self.name()),
            Err(e) => log::error!("TcpConnection::handle_error() {}: {}", self.name(), e),
        }

        if self.state() != ConnState::Disconnected {
            self.handle_close(lp);
        }
    }

    fn send_in_loop(&self, lp: &EventLoop, data: &[u8]) {
        lp.assert_in_loop_thread();
        // Re-checked here: a shutdown may have raced ahead of a send that
        // was queued from another thread.
        if self.state() != ConnState::Connected {
            log::warn!("TcpConnection::send() {} not connected, give up", self.name());
            return;
        }

        let mut output = self.output.lock().unwrap();
        let mut written = 0;

        // The socket buffer is known full once write interest is armed;
        // skip straight to queueing in that case.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    written = n;
                    if written == data.len() {
                        self.queue_write_complete(lp);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    log::error!("TcpConnection::send() {}: {}", self.name(), e);
                    if matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        drop(output);
                        self.handle_close(lp);
                        return;
                    }
                }
            }
        }

        let remaining = data.len() - written;
        if remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Acquire);
            if old_len < mark && old_len + remaining >= mark {
                let cb = self.high_water_cb.lock().unwrap().clone();
                if let (Some(cb), Some(me)) = (cb, self.me.upgrade()) {
                    let new_len = old_len + remaining;
                    lp.queue_in_loop(move |_| cb(&me, new_len));
                }
            }

            output.append(&data[written..]);
            if !self.channel.is_writing() {
                self.channel.enable_write();
            }
        }
    }

    fn shutdown_in_loop(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        if self.state() != ConnState::Disconnected && !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                log::error!("TcpConnection::shutdown() {}: {}", self.name(), e);
            }
        }
    }

    fn force_close_in_loop(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        if self.state() != ConnState::Disconnected {
            self.handle_close(lp);
        }
    }

    fn queue_write_complete(&self, lp: &EventLoop) {
        let cb = self.write_complete_cb.lock().unwrap().clone();
        if let (Some(cb), Some(me)) = (cb, self.me.upgrade()) {
            lp.queue_in_loop(move |_| cb(&me));
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        let state = self.state();
        if state != ConnState::Disconnected {
            // The owning loop exited while the connection was live; the
            // socket still closes, but the orderly close path never ran.
            log::warn!(
                "TcpConnection::drop() {} not torn down, state={:?} fd={}",
                self.name(),
                state,
                self.socket.as_raw_fd()
            );
        } else {
            log::trace!(
                "TcpConnection::drop() {} fd={}",
                self.name(),
                self.socket.as_raw_fd()
            );
        }
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("TcpConnection")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("fd", &self.socket.as_raw_fd())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::ConnState;

    #[test]
    fn state_round_trip() {
        for state in [
            ConnState::Connecting,
            ConnState::Connected,
            ConnState::Disconnecting,
            ConnState::Disconnected,
        ] {
            assert_eq!(ConnState::from_u8(state as u8), state);
        }
    }
}
