use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::callbacks::NewConnectionCallback;
use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::logger::fatal;
use crate::sys::socket::TcpSock;

/// Turns a listening socket into a stream of accepted connections.
///
/// Construction creates a non-blocking, close-on-exec listener with
/// address- and port-reuse enabled and binds it; a bind failure is a
/// configuration error and aborts. `listen` transitions to the listening
/// state on the owning loop.
pub struct Acceptor {
    loop_: LoopHandle,
    socket: TcpSock,
    channel: Arc<Channel>,
    local: SocketAddr,
    listening: AtomicBool,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(loop_: LoopHandle, addr: &SocketAddr) -> Arc<Acceptor> {
        let socket = match Acceptor::bind_socket(addr) {
            Ok(socket) => socket,
            Err(e) => fatal!("Acceptor::new() bind {}: {}", addr, e),
        };

        // With a port-0 bind the kernel picked the port; report reality.
        let local = match socket.local_addr() {
            Ok(local) => local,
            Err(e) => fatal!("Acceptor::new() local_addr: {}", e),
        };

        let channel = Channel::new(loop_.clone(), socket.as_raw_fd());

        let acceptor = Arc::new(Acceptor {
            loop_,
            socket,
            channel,
            local,
            listening: AtomicBool::new(false),
            new_connection_cb: Mutex::new(None),
        });

        let weak: Weak<Acceptor> = Arc::downgrade(&acceptor);
        acceptor
            .channel
            .set_read_callback(Box::new(move |lp: &EventLoop| {
                if let Some(acceptor) = weak.upgrade() {
                    acceptor.handle_read(lp);
                }
            }));

        acceptor
    }

    fn bind_socket(addr: &SocketAddr) -> io::Result<TcpSock> {
        let socket = TcpSock::new(addr)?;
        socket.set_reuse_addr(true)?;
        socket.set_reuse_port(true)?;
        socket.bind(addr)?;
        Ok(socket)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock().unwrap() = Some(cb);
    }

    /// Start listening and watching for incoming connections. Runs on the
    /// owning loop; a listen failure is fatal.
    pub fn listen(&self) {
        self.loop_.assert_in_loop_thread();

        if let Err(e) = self.socket.listen(libc::SOMAXCONN) {
            fatal!("Acceptor::listen() {}: {}", self.local, e);
        }
        self.listening.store(true, Ordering::Release);
        self.channel.enable_read();
    }

    /// Stop watching the listening socket. Runs on the owning loop.
    pub fn stop(&self) {
        self.loop_.assert_in_loop_thread();

        if self.listening.swap(false, Ordering::AcqRel) {
            self.channel.disable_all();
            self.loop_.remove_channel(&self.channel);
        }
    }

    /// Accept until the kernel runs dry, handing each connection to the
    /// installed callback. Accepted descriptors without a callback are
    /// closed on the spot.
    fn handle_read(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();

        loop {
            match self.socket.accept() {
                Ok((sock, peer)) => {
                    let cb = self.new_connection_cb.lock().unwrap();
                    match &*cb {
                        Some(cb) => cb(lp, sock, self.local, peer),
                        None => log::warn!(
                            "Acceptor::handle_read() no callback, closing fd={}",
                            sock.as_raw_fd()
                        ),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => match e.raw_os_error() {
                    // Transient conditions; the listener stays armed and
                    // the next readable event retries.
                    Some(libc::ECONNABORTED) | Some(libc::EMFILE) | Some(libc::ENFILE) => {
                        log::error!("Acceptor::handle_read() {}: {}", self.local, e);
                        break;
                    }
                    _ => fatal!("Acceptor::handle_read() {}: {}", self.local, e),
                },
            }
        }
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Acceptor")
            .field("local", &self.local)
            .field("listening", &self.listening())
            .finish()
    }
}
